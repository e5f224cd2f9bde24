use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;

use agentloop_config::SettingsProvider;
use agentloop_provider::{CharEstimator, ProviderConfig, TokenCounter};
use agentloop_storage::{ConversationStore, StorageError};
use agentloop_types::Content;

#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub system_prompt: String,
    /// Set to false to get a trimmed history even when summarization would apply.
    pub allow_auto_summarize: bool,
}

impl HistoryOptions {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            allow_auto_summarize: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedHistory {
    /// The slice to send. When trimming dropped rounds after a summary, the
    /// summary is kept as the first message.
    pub history: Vec<Content>,
    /// Index in the full log of the first message kept after trimming.
    pub trim_start_index: usize,
    pub needs_auto_summarize: bool,
    pub estimated_tokens: u64,
}

#[derive(Debug, Clone, Copy)]
struct TrimState {
    start_index: usize,
    history_len: usize,
}

/// Index of the last summary message, which opens the active window.
pub fn last_summary_index(history: &[Content]) -> Option<usize> {
    history.iter().rposition(|c| c.is_summary)
}

/// Indices at or after `from` where a round (a user-typed message) starts.
pub fn round_starts(history: &[Content], from: usize) -> Vec<usize> {
    history
        .iter()
        .enumerate()
        .skip(from)
        .filter(|(_, c)| c.is_user_input && !c.is_summary)
        .map(|(i, _)| i)
        .collect()
}

/// Moves `start` back so the slice never opens with a function response
/// whose call was cut off.
fn pair_safe_start(history: &[Content], mut start: usize) -> usize {
    while start > 0 && start < history.len() && history[start].is_function_response {
        start -= 1;
    }
    start
}

/// Fits history into the provider context window.
pub struct ContextBudgetManager {
    store: Arc<dyn ConversationStore>,
    counter: Arc<dyn TokenCounter>,
    settings: Arc<dyn SettingsProvider>,
    trim_state: Mutex<HashMap<String, TrimState>>,
}

impl ContextBudgetManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        counter: Arc<dyn TokenCounter>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            store,
            counter,
            settings,
            trim_state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn prepare(
        &self,
        conversation_id: &str,
        config: &ProviderConfig,
        options: &HistoryOptions,
        dynamic_context: Option<&str>,
    ) -> Result<PreparedHistory, StorageError> {
        let settings = self.settings.settings().context;
        let mut history = self.store.get_history(conversation_id).await?;
        let active_start = last_summary_index(&history).unwrap_or(0);

        self.ensure_token_counts(conversation_id, &mut history, active_start, config)
            .await;
        let costs: Vec<u64> = history
            .iter()
            .map(|c| {
                c.token_counts
                    .get(&config.provider_id)
                    .copied()
                    .unwrap_or_else(|| CharEstimator::estimate_content(c))
            })
            .collect();

        let fixed = self.count_text(&options.system_prompt, config).await
            + match dynamic_context {
                Some(text) => self.count_text(text, config).await,
                None => 0,
            };
        let threshold = settings.threshold_for(config.context_window);
        let cost_from = |start: usize| fixed + costs[start..].iter().sum::<u64>();

        let active_cost = cost_from(active_start);
        if active_cost <= threshold {
            return Ok(PreparedHistory {
                history: history.split_off(active_start),
                trim_start_index: active_start,
                needs_auto_summarize: false,
                estimated_tokens: active_cost,
            });
        }

        let rounds = round_starts(&history, active_start);
        let keep = settings.keep_recent_rounds.max(1);
        if settings.auto_summarize && options.allow_auto_summarize && rounds.len() > keep {
            tracing::info!(
                conversation_id = %conversation_id,
                estimated_tokens = active_cost,
                threshold,
                rounds = rounds.len(),
                "history over budget, requesting summarization"
            );
            return Ok(PreparedHistory {
                history: history.split_off(active_start),
                trim_start_index: active_start,
                needs_auto_summarize: true,
                estimated_tokens: active_cost,
            });
        }

        let has_summary = history.get(active_start).is_some_and(|c| c.is_summary);
        let summary_cost = if has_summary { costs[active_start] } else { 0 };

        let floor = {
            let mut state = self.trim_state.lock();
            match state.get(conversation_id) {
                Some(cached)
                    if cached.history_len <= history.len() && cached.start_index >= active_start =>
                {
                    cached.start_index
                }
                Some(_) => {
                    state.remove(conversation_id);
                    active_start
                }
                None => active_start,
            }
        };

        let start = rounds
            .iter()
            .copied()
            .filter(|&s| s >= floor)
            .find(|&s| {
                let kept_summary = if s > active_start { summary_cost } else { 0 };
                cost_from(s) + kept_summary <= threshold
            })
            .or_else(|| rounds.last().copied().filter(|&s| s >= floor))
            .unwrap_or(floor);
        let start = pair_safe_start(&history, start).max(active_start);

        self.trim_state.lock().insert(
            conversation_id.to_string(),
            TrimState {
                start_index: start,
                history_len: history.len(),
            },
        );

        let mut estimated = cost_from(start);
        let mut slice = Vec::with_capacity(history.len() - start + 1);
        if has_summary && start > active_start {
            slice.push(history[active_start].clone());
            estimated += summary_cost;
        }
        slice.extend(history.drain(start..));

        if start > active_start {
            tracing::debug!(
                conversation_id = %conversation_id,
                trim_start_index = start,
                estimated_tokens = estimated,
                threshold,
                "trimmed history to fit context window"
            );
        }

        Ok(PreparedHistory {
            history: slice,
            trim_start_index: start,
            needs_auto_summarize: false,
            estimated_tokens: estimated,
        })
    }

    /// Forgets the cached trim point. Call after any out-of-band history change.
    pub fn clear_trim_state(&self, conversation_id: &str) {
        self.trim_state.lock().remove(conversation_id);
    }

    /// Counts messages of the active window that have no cached count for
    /// this provider, concurrently, and stores the counts.
    async fn ensure_token_counts(
        &self,
        conversation_id: &str,
        history: &mut [Content],
        from: usize,
        config: &ProviderConfig,
    ) {
        let missing: Vec<usize> = (from..history.len())
            .filter(|&i| !history[i].token_counts.contains_key(&config.provider_id))
            .collect();
        if missing.is_empty() {
            return;
        }

        let counts = {
            let snapshot: &[Content] = history;
            join_all(
                missing
                    .iter()
                    .map(|&i| self.counter.count_content(&snapshot[i], config)),
            )
            .await
        };

        for (index, count) in missing.into_iter().zip(counts) {
            match count {
                Ok(tokens) => {
                    history[index]
                        .token_counts
                        .insert(config.provider_id.clone(), tokens);
                    if let Err(e) = self
                        .store
                        .update_message(conversation_id, index, history[index].clone())
                        .await
                    {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            index,
                            error = %e,
                            "failed to cache token count"
                        );
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        index,
                        error = %e,
                        "token count failed, using estimate"
                    );
                }
            }
        }
    }

    async fn count_text(&self, text: &str, config: &ProviderConfig) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.counter
            .count_text(text, config)
            .await
            .unwrap_or_else(|_| CharEstimator::estimate_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_config::StaticSettings;
    use agentloop_storage::MemoryConversationStore;
    use agentloop_types::{FunctionCall, FunctionResponse, Part};

    /// 40 characters, 10 estimated tokens.
    const FORTY: &str = "0123456789012345678901234567890123456789";

    fn rounds(n: usize) -> Vec<Content> {
        (0..n)
            .flat_map(|_| [Content::user_input(FORTY), Content::model_text(FORTY)])
            .collect()
    }

    async fn manager(
        history: Vec<Content>,
        configure: impl FnOnce(&mut agentloop_config::Settings),
    ) -> (ContextBudgetManager, Arc<MemoryConversationStore>) {
        let store = Arc::new(MemoryConversationStore::with_history("cnv_1", history).await);
        let settings = StaticSettings::default();
        settings.update(configure);
        let manager =
            ContextBudgetManager::new(store.clone(), Arc::new(CharEstimator), Arc::new(settings));
        (manager, store)
    }

    fn config() -> ProviderConfig {
        ProviderConfig::new("mock", "mock-model", 10_000)
    }

    #[tokio::test]
    async fn history_under_budget_is_returned_whole() {
        let (manager, _) = manager(rounds(3), |_| {}).await;
        let prepared = manager
            .prepare("cnv_1", &config(), &HistoryOptions::new("system"), None)
            .await
            .expect("prepare should succeed");
        assert_eq!(prepared.history.len(), 6);
        assert_eq!(prepared.trim_start_index, 0);
        assert!(!prepared.needs_auto_summarize);
    }

    #[tokio::test]
    async fn token_counts_are_cached_in_the_store() {
        let (manager, store) = manager(rounds(2), |_| {}).await;
        manager
            .prepare("cnv_1", &config(), &HistoryOptions::new(""), None)
            .await
            .expect("prepare should succeed");
        let history = store.get_history("cnv_1").await.expect("history");
        assert!(history
            .iter()
            .all(|c| c.token_counts.get("mock") == Some(&10)));
    }

    #[tokio::test]
    async fn over_budget_with_old_rounds_requests_summary() {
        let (manager, _) = manager(rounds(10), |s| s.context.threshold_tokens = Some(100)).await;
        let prepared = manager
            .prepare("cnv_1", &config(), &HistoryOptions::new(""), None)
            .await
            .expect("prepare should succeed");
        assert!(prepared.needs_auto_summarize);
        assert_eq!(prepared.history.len(), 20);
    }

    #[tokio::test]
    async fn trimming_cuts_on_round_boundaries_when_summaries_are_off() {
        let (manager, _) = manager(rounds(10), |s| {
            s.context.threshold_tokens = Some(60);
            s.context.auto_summarize = false;
        })
        .await;
        let prepared = manager
            .prepare("cnv_1", &config(), &HistoryOptions::new(""), None)
            .await
            .expect("prepare should succeed");
        assert!(!prepared.needs_auto_summarize);
        // Three rounds of 20 tokens fit into 60.
        assert_eq!(prepared.trim_start_index, 14);
        assert_eq!(prepared.history.len(), 6);
        assert!(prepared.history[0].is_user_input);
        assert!(prepared.estimated_tokens <= 60);
    }

    #[tokio::test]
    async fn trimming_never_orphans_a_function_response() {
        let call = FunctionCall::new("ls", serde_json::json!({})).with_id("call_1");
        let response = Content::function_responses(vec![Part::FunctionResponse(FunctionResponse {
            id: "call_1".into(),
            name: "ls".into(),
            response: serde_json::json!({"success": true}),
            parts: Vec::new(),
        })]);
        // A single long round: no round boundary to cut at.
        let history = vec![
            Content::user_input(FORTY),
            Content::model(vec![Part::FunctionCall(call)]),
            response,
            Content::model_text(FORTY),
        ];
        let (manager, _) = manager(history, |s| {
            s.context.threshold_tokens = Some(5);
            s.context.auto_summarize = false;
        })
        .await;
        let prepared = manager
            .prepare("cnv_1", &config(), &HistoryOptions::new(""), None)
            .await
            .expect("prepare should succeed");
        assert_eq!(prepared.trim_start_index, 0);
        assert_eq!(prepared.history.len(), 4);
    }

    #[tokio::test]
    async fn active_window_starts_at_last_summary() {
        let mut history = rounds(3);
        history.insert(2, Content::summary("summary of the first round", 2));
        let (manager, _) = manager(history, |_| {}).await;
        let prepared = manager
            .prepare("cnv_1", &config(), &HistoryOptions::new(""), None)
            .await
            .expect("prepare should succeed");
        assert_eq!(prepared.trim_start_index, 2);
        assert!(prepared.history[0].is_summary);
        assert_eq!(prepared.history.len(), 5);
    }

    #[tokio::test]
    async fn trim_point_is_sticky_until_cleared() {
        let (manager, store) = manager(rounds(10), |s| {
            s.context.threshold_tokens = Some(60);
            s.context.auto_summarize = false;
        })
        .await;
        let first = manager
            .prepare("cnv_1", &config(), &HistoryOptions::new(""), None)
            .await
            .expect("prepare should succeed");
        assert_eq!(first.trim_start_index, 14);

        store
            .delete_to_message("cnv_1", 4)
            .await
            .expect("delete should succeed");
        manager.clear_trim_state("cnv_1");
        let second = manager
            .prepare("cnv_1", &config(), &HistoryOptions::new(""), None)
            .await
            .expect("prepare should succeed");
        assert_eq!(second.trim_start_index, 0);
        assert_eq!(second.history.len(), 4);
    }
}
