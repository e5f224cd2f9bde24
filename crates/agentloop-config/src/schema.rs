use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const UNLIMITED: i64 = -1;

pub const DEFAULT_SUMMARY_PROMPT: &str = r#"Summarize the conversation above so that work can continue from the summary alone.
Keep it factual and dense. Use this template:
---
## Goal
[What is the user trying to accomplish?]

## Instructions
- [Constraints and preferences the user stated]

## Progress
[What has been done, what is in progress, what is left]

## Relevant files
[Files read, edited or created, with one line on why each matters]
---"#;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    pub tools: ToolSettings,
    pub checkpoints: CheckpointSettings,
    pub context: ContextSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    /// Provider calls allowed per loop invocation, `-1` for unlimited.
    pub max_iterations: i64,
    /// Tools that run without asking. `true` means no confirmation.
    pub auto_exec: HashMap<String, bool>,
    pub auto_exec_default: bool,
    /// Global kill switch: every tool call is rejected.
    pub disabled: bool,
    pub disabled_tools: Vec<String>,
    pub modes: HashMap<String, ModeSettings>,
    /// Per-batch cap on calls to `agent_tool_name`, `-1` for unlimited.
    pub max_concurrent_agents: i64,
    pub agent_tool_name: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            auto_exec: HashMap::new(),
            auto_exec_default: false,
            disabled: false,
            disabled_tools: Vec::new(),
            modes: HashMap::new(),
            max_concurrent_agents: 3,
            agent_tool_name: "subagents".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeSettings {
    /// Allowlist for the mode. Empty allows everything.
    pub tools: Vec<String>,
    /// Tools outside the allowlist that may still run when their target path
    /// matches one of these globs.
    pub path_exceptions: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointSettings {
    pub user_message_before: bool,
    pub user_message_after: bool,
    pub model_message_before: bool,
    pub model_message_after: bool,
    pub tool_batch_before: bool,
    pub tool_batch_after: bool,
    /// Only the first iteration of a turn gets a model "before" checkpoint.
    pub model_before_outer_only: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            user_message_before: true,
            user_message_after: false,
            model_message_before: false,
            model_message_after: true,
            tool_batch_before: true,
            tool_batch_after: true,
            model_before_outer_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    pub auto_summarize: bool,
    /// Fraction of the provider context window that may be used.
    pub threshold_ratio: f64,
    /// Absolute token budget; overrides `threshold_ratio` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_tokens: Option<u64>,
    pub keep_recent_rounds: usize,
    pub summary_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            auto_summarize: true,
            threshold_ratio: 0.8,
            threshold_tokens: None,
            keep_recent_rounds: 2,
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            summary_model: None,
        }
    }
}

impl ContextSettings {
    pub fn threshold_for(&self, context_window: u64) -> u64 {
        match self.threshold_tokens {
            Some(tokens) => tokens,
            None => (context_window as f64 * self.threshold_ratio.clamp(0.0, 1.0)) as u64,
        }
    }
}
