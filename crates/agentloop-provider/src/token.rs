use async_trait::async_trait;

use agentloop_types::{Content, Part};

use crate::{ProviderConfig, ProviderError};

/// Rough characters-per-token ratio used by the fallback estimator.
const CHARS_PER_TOKEN: u64 = 4;
/// Flat cost charged for an inline attachment.
const ATTACHMENT_TOKENS: u64 = 256;

/// Supplies token counts for history messages and free text.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_content(
        &self,
        content: &Content,
        config: &ProviderConfig,
    ) -> Result<u64, ProviderError>;

    async fn count_text(&self, text: &str, config: &ProviderConfig) -> Result<u64, ProviderError>;
}

/// Character based estimate. Used when the provider offers no counting endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl CharEstimator {
    pub fn estimate_text(text: &str) -> u64 {
        (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
    }

    pub fn estimate_content(content: &Content) -> u64 {
        content
            .parts
            .iter()
            .map(|part| match part {
                Part::Text { text } | Part::Thought { text } => Self::estimate_text(text),
                Part::FunctionCall(call) => {
                    Self::estimate_text(&call.name) + Self::estimate_text(&call.args.to_string())
                }
                Part::FunctionResponse(response) => {
                    Self::estimate_text(&response.name)
                        + Self::estimate_text(&response.response.to_string())
                        + ATTACHMENT_TOKENS * response.parts.len() as u64
                }
                Part::InlineData(_) => ATTACHMENT_TOKENS,
            })
            .sum()
    }
}

#[async_trait]
impl TokenCounter for CharEstimator {
    async fn count_content(
        &self,
        content: &Content,
        _config: &ProviderConfig,
    ) -> Result<u64, ProviderError> {
        Ok(Self::estimate_content(content))
    }

    async fn count_text(&self, text: &str, _config: &ProviderConfig) -> Result<u64, ProviderError> {
        Ok(Self::estimate_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(CharEstimator::estimate_text(""), 0);
        assert_eq!(CharEstimator::estimate_text("abc"), 1);
        assert_eq!(CharEstimator::estimate_text("abcdefgh"), 2);
        assert_eq!(CharEstimator::estimate_text("abcdefghi"), 3);
    }

    #[tokio::test]
    async fn counter_counts_function_calls() {
        let config = ProviderConfig::new("mock", "mock-model", 1000);
        let content = Content::model(vec![Part::FunctionCall(
            agentloop_types::FunctionCall::new("read_file", serde_json::json!({"path": "a"})),
        )]);
        let tokens = CharEstimator
            .count_content(&content, &config)
            .await
            .expect("estimate should succeed");
        assert!(tokens > 0);
    }
}
