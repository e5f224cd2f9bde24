use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointPhase {
    Before,
    After,
}

impl std::fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointPhase::Before => write!(f, "before"),
            CheckpointPhase::After => write!(f, "after"),
        }
    }
}

/// Immutable rollback marker. Created or bulk-deleted, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub conversation_id: String,
    pub message_index: usize,
    pub label: String,
    pub phase: CheckpointPhase,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        conversation_id: impl Into<String>,
        message_index: usize,
        label: impl Into<String>,
        phase: CheckpointPhase,
    ) -> Self {
        Self {
            id: agentloop_core::id::checkpoint_id(),
            conversation_id: conversation_id.into(),
            message_index,
            label: label.into(),
            phase,
            created_at: Utc::now(),
        }
    }
}
