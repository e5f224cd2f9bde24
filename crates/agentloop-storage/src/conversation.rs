use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use agentloop_types::Content;

use crate::StorageError;

/// Append-only message log keyed by conversation id.
///
/// A message's index in the log is its identity. Only the explicit edit,
/// truncate and summary-replacement operations change existing entries.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_history(&self, conversation_id: &str) -> Result<Vec<Content>, StorageError>;

    async fn history_len(&self, conversation_id: &str) -> Result<usize, StorageError>;

    async fn get_message(
        &self,
        conversation_id: &str,
        index: usize,
    ) -> Result<Option<Content>, StorageError>;

    /// Appends a message and returns its index.
    async fn add_content(
        &self,
        conversation_id: &str,
        content: Content,
    ) -> Result<usize, StorageError>;

    async fn update_message(
        &self,
        conversation_id: &str,
        index: usize,
        content: Content,
    ) -> Result<(), StorageError>;

    /// Removes the message at `index` and everything after it. Returns the number removed.
    async fn delete_to_message(
        &self,
        conversation_id: &str,
        index: usize,
    ) -> Result<usize, StorageError>;

    /// Replaces messages `start..end` with a single message.
    async fn replace_range(
        &self,
        conversation_id: &str,
        start: usize,
        end: usize,
        content: Content,
    ) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, Vec<Content>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_history(conversation_id: &str, history: Vec<Content>) -> Self {
        let store = Self::new();
        store
            .conversations
            .write()
            .await
            .insert(conversation_id.to_string(), history);
        store
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get_history(&self, conversation_id: &str) -> Result<Vec<Content>, StorageError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn history_len(&self, conversation_id: &str) -> Result<usize, StorageError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(conversation_id).map_or(0, Vec::len))
    }

    async fn get_message(
        &self,
        conversation_id: &str,
        index: usize,
    ) -> Result<Option<Content>, StorageError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .and_then(|history| history.get(index))
            .cloned())
    }

    async fn add_content(
        &self,
        conversation_id: &str,
        content: Content,
    ) -> Result<usize, StorageError> {
        let mut conversations = self.conversations.write().await;
        let history = conversations
            .entry(conversation_id.to_string())
            .or_default();
        history.push(content);
        Ok(history.len() - 1)
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        index: usize,
        content: Content,
    ) -> Result<(), StorageError> {
        let mut conversations = self.conversations.write().await;
        let history = conversations
            .entry(conversation_id.to_string())
            .or_default();
        let len = history.len();
        let slot = history
            .get_mut(index)
            .ok_or_else(|| StorageError::IndexOutOfRange {
                conversation_id: conversation_id.to_string(),
                index,
                len,
            })?;
        *slot = content;
        Ok(())
    }

    async fn delete_to_message(
        &self,
        conversation_id: &str,
        index: usize,
    ) -> Result<usize, StorageError> {
        let mut conversations = self.conversations.write().await;
        let Some(history) = conversations.get_mut(conversation_id) else {
            return Ok(0);
        };
        if index >= history.len() {
            return Ok(0);
        }
        let removed = history.len() - index;
        history.truncate(index);
        Ok(removed)
    }

    async fn replace_range(
        &self,
        conversation_id: &str,
        start: usize,
        end: usize,
        content: Content,
    ) -> Result<(), StorageError> {
        let mut conversations = self.conversations.write().await;
        let history = conversations
            .entry(conversation_id.to_string())
            .or_default();
        if start > end || end > history.len() {
            return Err(StorageError::InvalidRange {
                conversation_id: conversation_id.to_string(),
                start,
                end,
            });
        }
        history.splice(start..end, std::iter::once(content));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_content_returns_sequential_indices() {
        let store = MemoryConversationStore::new();
        let first = store
            .add_content("cnv_1", Content::user_input("a"))
            .await
            .expect("append should succeed");
        let second = store
            .add_content("cnv_1", Content::model_text("b"))
            .await
            .expect("append should succeed");
        assert_eq!((first, second), (0, 1));
        assert_eq!(store.history_len("cnv_1").await.expect("len"), 2);
        assert_eq!(store.history_len("cnv_other").await.expect("len"), 0);
    }

    #[tokio::test]
    async fn delete_to_message_truncates_from_index() {
        let store = MemoryConversationStore::with_history(
            "cnv_1",
            vec![
                Content::user_input("a"),
                Content::model_text("b"),
                Content::user_input("c"),
            ],
        )
        .await;
        let removed = store
            .delete_to_message("cnv_1", 1)
            .await
            .expect("delete should succeed");
        assert_eq!(removed, 2);
        let history = store.get_history("cnv_1").await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "a");
    }

    #[tokio::test]
    async fn replace_range_collapses_messages() {
        let store = MemoryConversationStore::with_history(
            "cnv_1",
            vec![
                Content::user_input("a"),
                Content::model_text("b"),
                Content::user_input("c"),
                Content::model_text("d"),
            ],
        )
        .await;
        store
            .replace_range("cnv_1", 0, 2, Content::summary("ab", 2))
            .await
            .expect("replace should succeed");
        let history = store.get_history("cnv_1").await.expect("history");
        assert_eq!(history.len(), 3);
        assert!(history[0].is_summary);
        assert_eq!(history[1].text(), "c");
    }

    #[tokio::test]
    async fn update_out_of_range_is_an_error() {
        let store = MemoryConversationStore::new();
        let err = store
            .update_message("cnv_1", 3, Content::model_text("x"))
            .await
            .expect_err("update should fail");
        assert!(matches!(err, StorageError::IndexOutOfRange { index: 3, .. }));
    }
}
