use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use agentloop_config::SettingsProvider;
use agentloop_provider::{
    GenerateRequest, GenerateResponse, Provider, ProviderConfig, ProviderError, StreamAccumulator,
};
use agentloop_storage::{ConversationStore, StorageError};
use agentloop_types::Content;

use crate::checkpoint::CheckpointCoordinator;
use crate::context::{last_summary_index, round_starts, ContextBudgetManager};

const SUMMARY_SYSTEM_PROMPT: &str =
    "You summarize conversations between a user and a coding assistant. Do not call tools.";
const SUMMARY_HEADER: &str = "Summary of the earlier conversation:\n\n";

#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("Not enough rounds to summarize")]
    NothingToSummarize,

    #[error("Summary provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Summary provider returned no text")]
    EmptySummary,

    #[error("Summarization cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    /// Messages replaced by the summary, prior summaries included.
    pub replaced_messages: usize,
    pub summarized_rounds: usize,
    pub summary: Content,
}

/// Collapses old rounds into one summary message with a secondary model call.
///
/// The replaced range always starts at index 0, so any earlier summary is
/// folded into the new one and exactly one summary stays live.
pub struct Summarizer {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn Provider>,
    settings: Arc<dyn SettingsProvider>,
    checkpoints: Arc<CheckpointCoordinator>,
    budget: Arc<ContextBudgetManager>,
}

impl Summarizer {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn Provider>,
        settings: Arc<dyn SettingsProvider>,
        checkpoints: Arc<CheckpointCoordinator>,
        budget: Arc<ContextBudgetManager>,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
            checkpoints,
            budget,
        }
    }

    pub async fn summarize(
        &self,
        conversation_id: &str,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> Result<SummaryOutcome, SummarizeError> {
        let settings = self.settings.settings().context;
        let history = self.store.get_history(conversation_id).await?;
        let active_start = last_summary_index(&history).unwrap_or(0);
        let rounds = round_starts(&history, active_start);

        let keep = settings.keep_recent_rounds.max(1);
        if rounds.len() <= keep {
            return Err(SummarizeError::NothingToSummarize);
        }
        let cut = rounds[rounds.len() - keep];
        let summarized_rounds = rounds.len() - keep;

        tracing::info!(
            conversation_id = %conversation_id,
            summarized_rounds,
            messages = cut,
            "summarizing conversation"
        );

        let mut request_history: Vec<Content> = history[active_start..cut].to_vec();
        request_history.push(Content::user_text(settings.summary_prompt.clone()));
        let request = GenerateRequest {
            conversation_id: conversation_id.to_string(),
            history: request_history,
            system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
            dynamic_context: None,
            model_override: settings.summary_model.clone(),
            tools: Vec::new(),
            config: config.clone(),
        };

        let response = self.provider.generate(request, cancel.clone()).await?;
        let content = match response {
            GenerateResponse::Complete(content) => content,
            GenerateResponse::Stream(mut stream) => {
                let mut acc = StreamAccumulator::new();
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SummarizeError::Cancelled),
                        item = stream.next() => match item {
                            Some(chunk) => acc.push(chunk?),
                            None => break,
                        },
                    }
                }
                acc.into_content()
            }
        };
        if cancel.is_cancelled() {
            return Err(SummarizeError::Cancelled);
        }

        let text = content.text();
        let text = text.trim();
        if text.is_empty() {
            return Err(SummarizeError::EmptySummary);
        }

        let summary = Content::summary(format!("{}{}", SUMMARY_HEADER, text), cut);
        self.store
            .replace_range(conversation_id, 0, cut, summary.clone())
            .await?;
        self.checkpoints.delete_from_index(conversation_id, 0).await;
        self.budget.clear_trim_state(conversation_id);

        tracing::info!(
            conversation_id = %conversation_id,
            replaced_messages = cut,
            "conversation summarized"
        );

        Ok(SummaryOutcome {
            replaced_messages: cut,
            summarized_rounds,
            summary,
        })
    }
}
