#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Message index {index} out of range for conversation {conversation_id} (len {len})")]
    IndexOutOfRange {
        conversation_id: String,
        index: usize,
        len: usize,
    },

    #[error("Invalid range {start}..{end} for conversation {conversation_id}")]
    InvalidRange {
        conversation_id: String,
        start: usize,
        end: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}
