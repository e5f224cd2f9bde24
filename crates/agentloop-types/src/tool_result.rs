use serde::{Deserialize, Serialize};

use crate::InlineData;

/// Declaration of a callable tool as sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// How a single tool call ended.
///
/// `PolicyRejected` and `LimitExceeded` come from configuration, `UserRejected`
/// from a declined confirmation, `Cancelled` from the turn's cancellation token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Failed,
    PolicyRejected,
    LimitExceeded,
    UserRejected,
    Cancelled,
}

impl ToolOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            ToolOutcome::PolicyRejected | ToolOutcome::LimitExceeded | ToolOutcome::UserRejected
        )
    }

    /// Outcomes after which the loop must not call the model again on its own.
    pub fn halts_turn(&self) -> bool {
        matches!(self, ToolOutcome::Cancelled | ToolOutcome::UserRejected)
    }
}

/// Payload returned to the model inside a function response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tool-reported metadata, e.g. partial success counts of batch-style tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rejected: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl ToolPayload {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            rejected: true,
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            error: Some("Tool execution was cancelled".to_string()),
            cancelled: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
    pub result: ToolPayload,
    /// Inline media produced by the tool, routed by the executor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<InlineData>,
}

impl ToolExecutionResult {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        outcome: ToolOutcome,
        result: ToolPayload,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            outcome,
            result,
            attachments: Vec::new(),
        }
    }

    pub fn response_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.result).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_payload_serializes_marker() {
        let value = serde_json::to_value(ToolPayload::rejected("not allowed"))
            .expect("payload should serialize");
        assert_eq!(value["success"], false);
        assert_eq!(value["rejected"], true);
        assert!(value.get("cancelled").is_none());
    }

    #[test]
    fn only_cancelled_and_user_rejected_halt() {
        assert!(ToolOutcome::Cancelled.halts_turn());
        assert!(ToolOutcome::UserRejected.halts_turn());
        assert!(!ToolOutcome::PolicyRejected.halts_turn());
        assert!(!ToolOutcome::LimitExceeded.halts_turn());
        assert!(!ToolOutcome::Failed.halts_turn());
    }
}
