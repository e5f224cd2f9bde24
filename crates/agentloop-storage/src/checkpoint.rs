use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use agentloop_types::Checkpoint;

use crate::StorageError;

/// Persists rollback markers. Checkpoints are only created or bulk-deleted.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn create(&self, checkpoint: Checkpoint) -> Result<Checkpoint, StorageError>;

    /// Removes every checkpoint whose message index is `>= index`. Returns the number removed.
    async fn delete_from_index(
        &self,
        conversation_id: &str,
        index: usize,
    ) -> Result<usize, StorageError>;

    async fn list(&self, conversation_id: &str) -> Result<Vec<Checkpoint>, StorageError>;
}

#[derive(Default)]
pub struct MemoryCheckpointBackend {
    checkpoints: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointBackend {
    async fn create(&self, checkpoint: Checkpoint) -> Result<Checkpoint, StorageError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints
            .entry(checkpoint.conversation_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn delete_from_index(
        &self,
        conversation_id: &str,
        index: usize,
    ) -> Result<usize, StorageError> {
        let mut checkpoints = self.checkpoints.write().await;
        let Some(list) = checkpoints.get_mut(conversation_id) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|cp| cp.message_index < index);
        let removed = before - list.len();
        if removed > 0 {
            tracing::debug!(
                conversation_id = %conversation_id,
                index,
                removed,
                "deleted checkpoints from index"
            );
        }
        Ok(removed)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
