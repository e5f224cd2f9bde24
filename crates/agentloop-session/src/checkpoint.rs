use std::sync::Arc;

use agentloop_config::SettingsProvider;
use agentloop_storage::{CheckpointBackend, ConversationStore};
use agentloop_types::{Checkpoint, CheckpointPhase};

pub const USER_MESSAGE_LABEL: &str = "user_message";
pub const MODEL_MESSAGE_LABEL: &str = "model_message";
pub const TOOL_BATCH_LABEL: &str = "tool_batch";

/// Creates checkpoints around user messages, model messages and tool batches.
///
/// Every creation is gated by its own setting and returns `None` when gated
/// off, when no backend is configured, or when the backend fails. Failures
/// are logged, never returned.
pub struct CheckpointCoordinator {
    backend: Option<Arc<dyn CheckpointBackend>>,
    store: Arc<dyn ConversationStore>,
    settings: Arc<dyn SettingsProvider>,
}

impl CheckpointCoordinator {
    pub fn new(
        backend: Option<Arc<dyn CheckpointBackend>>,
        store: Arc<dyn ConversationStore>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            backend,
            store,
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// `index` defaults to the slot the next message will occupy ("before")
    /// or the last message ("after").
    pub async fn create_for_user_message(
        &self,
        conversation_id: &str,
        phase: CheckpointPhase,
        index: Option<usize>,
    ) -> Option<Checkpoint> {
        let backend = self.backend.as_ref()?;
        let settings = self.settings.settings().checkpoints;
        let enabled = match phase {
            CheckpointPhase::Before => settings.user_message_before,
            CheckpointPhase::After => settings.user_message_after,
        };
        if !enabled {
            return None;
        }
        let index = match index {
            Some(index) => index,
            None => self.default_index(conversation_id, phase).await?,
        };
        self.create(backend, conversation_id, index, USER_MESSAGE_LABEL, phase)
            .await
    }

    /// `iteration` is 1-based within the turn. With `modelBeforeOuterOnly`,
    /// only the first iteration gets a "before" checkpoint.
    pub async fn create_for_model_message(
        &self,
        conversation_id: &str,
        phase: CheckpointPhase,
        iteration: Option<u32>,
    ) -> Option<Checkpoint> {
        let backend = self.backend.as_ref()?;
        let settings = self.settings.settings().checkpoints;
        let enabled = match phase {
            CheckpointPhase::Before => {
                settings.model_message_before
                    && !(settings.model_before_outer_only && iteration.is_some_and(|i| i > 1))
            }
            CheckpointPhase::After => settings.model_message_after,
        };
        if !enabled {
            return None;
        }
        let index = self.default_index(conversation_id, phase).await?;
        self.create(backend, conversation_id, index, MODEL_MESSAGE_LABEL, phase)
            .await
    }

    pub async fn create_for_tool_batch(
        &self,
        conversation_id: &str,
        index: usize,
        label: &str,
        phase: CheckpointPhase,
    ) -> Option<Checkpoint> {
        let backend = self.backend.as_ref()?;
        let settings = self.settings.settings().checkpoints;
        let enabled = match phase {
            CheckpointPhase::Before => settings.tool_batch_before,
            CheckpointPhase::After => settings.tool_batch_after,
        };
        if !enabled {
            return None;
        }
        self.create(backend, conversation_id, index, label, phase)
            .await
    }

    /// Removes every checkpoint at or after `index`.
    pub async fn delete_from_index(&self, conversation_id: &str, index: usize) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(e) = backend.delete_from_index(conversation_id, index).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                index,
                error = %e,
                "failed to delete checkpoints"
            );
        }
    }

    async fn default_index(&self, conversation_id: &str, phase: CheckpointPhase) -> Option<usize> {
        match self.store.history_len(conversation_id).await {
            Ok(len) => Some(match phase {
                CheckpointPhase::Before => len,
                CheckpointPhase::After => len.saturating_sub(1),
            }),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "could not read history length for checkpoint"
                );
                None
            }
        }
    }

    async fn create(
        &self,
        backend: &Arc<dyn CheckpointBackend>,
        conversation_id: &str,
        index: usize,
        label: &str,
        phase: CheckpointPhase,
    ) -> Option<Checkpoint> {
        let checkpoint = Checkpoint::new(conversation_id, index, label, phase);
        match backend.create(checkpoint).await {
            Ok(checkpoint) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    index,
                    label = %label,
                    phase = %phase,
                    "checkpoint created"
                );
                Some(checkpoint)
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    label = %label,
                    error = %e,
                    "checkpoint creation failed"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_config::StaticSettings;
    use agentloop_storage::{MemoryCheckpointBackend, MemoryConversationStore, StorageError};
    use agentloop_types::Content;
    use async_trait::async_trait;

    struct FailingBackend;

    #[async_trait]
    impl CheckpointBackend for FailingBackend {
        async fn create(&self, _checkpoint: Checkpoint) -> Result<Checkpoint, StorageError> {
            Err(StorageError::Backend("disk full".into()))
        }

        async fn delete_from_index(
            &self,
            _conversation_id: &str,
            _index: usize,
        ) -> Result<usize, StorageError> {
            Err(StorageError::Backend("disk full".into()))
        }

        async fn list(&self, _conversation_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
            Ok(Vec::new())
        }
    }

    fn coordinator(
        backend: Option<Arc<dyn CheckpointBackend>>,
        settings: Arc<StaticSettings>,
    ) -> CheckpointCoordinator {
        CheckpointCoordinator::new(backend, Arc::new(MemoryConversationStore::new()), settings)
    }

    #[tokio::test]
    async fn no_backend_is_a_silent_no_op() {
        let coordinator = coordinator(None, Arc::new(StaticSettings::default()));
        assert!(coordinator
            .create_for_user_message("cnv_1", CheckpointPhase::Before, Some(0))
            .await
            .is_none());
        coordinator.delete_from_index("cnv_1", 0).await;
    }

    #[tokio::test]
    async fn settings_gate_each_phase() {
        let backend = Arc::new(MemoryCheckpointBackend::new());
        let coordinator = coordinator(Some(backend.clone()), Arc::new(StaticSettings::default()));

        // Defaults: user before on, user after off.
        assert!(coordinator
            .create_for_user_message("cnv_1", CheckpointPhase::Before, Some(0))
            .await
            .is_some());
        assert!(coordinator
            .create_for_user_message("cnv_1", CheckpointPhase::After, Some(0))
            .await
            .is_none());
        let tool = coordinator
            .create_for_tool_batch("cnv_1", 1, "read_file", CheckpointPhase::Before)
            .await
            .expect("tool batch checkpoint should be created");
        assert_eq!(tool.label, "read_file");
        assert_eq!(backend.list("cnv_1").await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn outer_only_suppresses_later_model_before_checkpoints() {
        let settings = Arc::new(StaticSettings::default());
        settings.update(|s| s.checkpoints.model_message_before = true);
        let store = Arc::new(MemoryConversationStore::new());
        store
            .add_content("cnv_1", Content::user_input("hi"))
            .await
            .expect("append should succeed");
        let coordinator = CheckpointCoordinator::new(
            Some(Arc::new(MemoryCheckpointBackend::new())),
            store,
            settings.clone(),
        );

        let first = coordinator
            .create_for_model_message("cnv_1", CheckpointPhase::Before, Some(1))
            .await
            .expect("first iteration should get a checkpoint");
        assert_eq!(first.message_index, 1);
        assert!(coordinator
            .create_for_model_message("cnv_1", CheckpointPhase::Before, Some(2))
            .await
            .is_none());

        settings.update(|s| s.checkpoints.model_before_outer_only = false);
        assert!(coordinator
            .create_for_model_message("cnv_1", CheckpointPhase::Before, Some(2))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn backend_failures_are_swallowed() {
        let coordinator = coordinator(
            Some(Arc::new(FailingBackend)),
            Arc::new(StaticSettings::default()),
        );
        assert!(coordinator
            .create_for_tool_batch("cnv_1", 0, "tool_batch", CheckpointPhase::After)
            .await
            .is_none());
        coordinator.delete_from_index("cnv_1", 0).await;
    }
}
