use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use agentloop_types::{Content, ToolSchema};

use crate::ChunkStream;

/// How the active provider expects tool calls to be encoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallFormat {
    /// Provider-native function-call objects.
    #[default]
    Native,
    /// `<tool_use>` tags inside plain text.
    Xml,
    /// `[TOOL_CALL]` bracket markers around JSON inside plain text.
    Json,
}

impl ToolCallFormat {
    pub fn is_text_encoded(&self) -> bool {
        matches!(self, ToolCallFormat::Xml | ToolCallFormat::Json)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider_id: String,
    pub model: String,
    pub context_window: u64,
    #[serde(default)]
    pub max_output_tokens: u64,
    #[serde(default)]
    pub tool_call_format: ToolCallFormat,
    /// Media may ride inside a function response.
    #[serde(default)]
    pub supports_multimodal_function_response: bool,
    /// Media may be sent as standalone inline parts.
    #[serde(default)]
    pub supports_inline_attachments: bool,
}

impl ProviderConfig {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>, context_window: u64) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            context_window,
            max_output_tokens: 0,
            tool_call_format: ToolCallFormat::Native,
            supports_multimodal_function_response: false,
            supports_inline_attachments: false,
        }
    }

    pub fn with_tool_call_format(mut self, format: ToolCallFormat) -> Self {
        self.tool_call_format = format;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub conversation_id: String,
    pub history: Vec<Content>,
    pub system_prompt: String,
    pub dynamic_context: Option<String>,
    pub model_override: Option<String>,
    /// Tools the model may call. Empty for calls that must answer in text.
    pub tools: Vec<ToolSchema>,
    pub config: ProviderConfig,
}

/// A provider answers either with a finished message or with a chunk stream.
pub enum GenerateResponse {
    Complete(Content),
    Stream(ChunkStream),
}

impl std::fmt::Debug for GenerateResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateResponse::Complete(content) => {
                f.debug_tuple("Complete").field(content).finish()
            }
            GenerateResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResponse, ProviderError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("API error (status {status_code}): {message}")]
    ApiErrorWithStatus { message: String, status_code: u16 },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    pub fn api_error_with_status(message: impl Into<String>, status_code: u16) -> Self {
        ProviderError::ApiErrorWithStatus {
            message: message.into(),
            status_code,
        }
    }

    /// Stable identifier used on the event channel.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::ApiErrorWithStatus { .. } | ProviderError::ApiError(_) => "api_error",
            ProviderError::NetworkError(_) => "network_error",
            ProviderError::AuthError(_) => "auth_error",
            ProviderError::RateLimit => "rate_limit",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::StreamError(_) => "stream_error",
            ProviderError::Timeout => "timeout",
            ProviderError::ContextOverflow(_) => "context_overflow",
            ProviderError::MalformedResponse(_) => "malformed_response",
        }
    }

    /// Whether an outer retry policy could reasonably try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimit | ProviderError::Timeout | ProviderError::NetworkError(_) => {
                true
            }
            ProviderError::ApiErrorWithStatus { status_code, .. } => {
                matches!(status_code, 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    /// Contract violations by the provider. These are not turned into events.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, ProviderError::MalformedResponse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_follows_status() {
        assert!(ProviderError::RateLimit.is_retryable());
        assert!(ProviderError::api_error_with_status("busy", 503).is_retryable());
        assert!(!ProviderError::api_error_with_status("bad", 400).is_retryable());
        assert!(!ProviderError::AuthError("no key".into()).is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ProviderError::Timeout.code(), "timeout");
        assert_eq!(
            ProviderError::MalformedResponse("x".into()).code(),
            "malformed_response"
        );
    }
}
