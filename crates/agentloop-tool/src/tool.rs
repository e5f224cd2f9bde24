use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use agentloop_types::InlineData;
pub use agentloop_types::ToolSchema;

pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata keys a batch-style tool uses to report partial success.
pub const SUCCESS_COUNT_KEY: &str = "successCount";
pub const FAILED_COUNT_KEY: &str = "failedCount";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub title: String,
    pub output: String,
    pub metadata: Metadata,
    /// Inline media produced by the tool (screenshots, rendered files).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<InlineData>,
}

impl ToolResult {
    pub fn simple(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: Metadata::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_attachment(
        mut self,
        mime_type: impl Into<String>,
        bytes: &[u8],
        display_name: Option<String>,
    ) -> Self {
        self.attachments.push(InlineData {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            display_name,
        });
        self
    }

    /// True when the result reports both succeeded and failed sub-operations.
    pub fn is_partial(&self) -> bool {
        let count = |key: &str| {
            self.metadata
                .get(key)
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        count(SUCCESS_COUNT_KEY) > 0 && count(FAILED_COUNT_KEY) > 0
    }
}

#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    /// Index of the model message that requested the call.
    pub message_index: usize,
    pub call_id: Option<String>,
    /// Active tool mode, if the host uses modes.
    pub mode: Option<String>,
    pub abort: CancellationToken,
    pub extra: HashMap<String, serde_json::Value>,
}

impl ToolContext {
    pub fn new(conversation_id: impl Into<String>, message_index: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_index,
            call_id: None,
            mode: None,
            abort: CancellationToken::new(),
            extra: HashMap::new(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_mode(mut self, mode: Option<String>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError>;

    fn validate(&self, args: &serde_json::Value) -> Result<(), ToolError> {
        let _ = args;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Cancelled")]
    Cancelled,
}
