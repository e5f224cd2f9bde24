use agentloop_provider::ProviderError;
use agentloop_storage::StorageError;

/// Failures that escape the loop instead of becoming events.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The provider broke its contract (e.g. a malformed response).
    #[error("Provider contract violation: {0}")]
    ProviderContract(ProviderError),

    #[error("Conversation {0} is busy")]
    Busy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
