use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use agentloop_provider::StreamChunk;
use agentloop_types::{Checkpoint, Content, FunctionCall, ToolExecutionResult, ToolOutcome};

/// Live status of one tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Success,
    /// A batch-style tool reported both successes and failures.
    Warning,
    Error,
}

impl ToolStatus {
    pub fn from_result(result: &ToolExecutionResult) -> Self {
        if result.outcome != ToolOutcome::Success || !result.result.success {
            return ToolStatus::Error;
        }
        let count = |key: &str| {
            result
                .result
                .metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        if count(agentloop_tool::SUCCESS_COUNT_KEY) > 0 && count(agentloop_tool::FAILED_COUNT_KEY) > 0
        {
            ToolStatus::Warning
        } else {
            ToolStatus::Success
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SummaryPhase {
    Started,
    Completed,
    Failed,
}

/// Everything the loop reports to its caller while a turn runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LoopEvent {
    #[serde(rename_all = "camelCase")]
    Chunk { conversation_id: String, chunk: StreamChunk },

    #[serde(rename_all = "camelCase")]
    ToolsExecuting {
        conversation_id: String,
        pending_calls: Vec<FunctionCall>,
    },

    #[serde(rename_all = "camelCase")]
    ToolStatus {
        conversation_id: String,
        call: FunctionCall,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ToolExecutionResult>,
    },

    #[serde(rename_all = "camelCase")]
    ToolIteration {
        conversation_id: String,
        content: Content,
        results: Vec<ToolExecutionResult>,
        checkpoints: Vec<Checkpoint>,
    },

    #[serde(rename_all = "camelCase")]
    AwaitingConfirmation {
        conversation_id: String,
        pending_calls: Vec<FunctionCall>,
        content: Content,
        prior_results: Vec<ToolExecutionResult>,
    },

    #[serde(rename_all = "camelCase")]
    CheckpointsOnly {
        conversation_id: String,
        checkpoints: Vec<Checkpoint>,
    },

    #[serde(rename_all = "camelCase")]
    AutoSummaryStatus {
        conversation_id: String,
        phase: SummaryPhase,
    },

    #[serde(rename_all = "camelCase")]
    Complete {
        conversation_id: String,
        content: Content,
        checkpoints: Vec<Checkpoint>,
    },

    #[serde(rename_all = "camelCase")]
    Cancelled { conversation_id: String },

    #[serde(rename_all = "camelCase")]
    Error {
        conversation_id: String,
        code: String,
        message: String,
    },
}

impl LoopEvent {
    pub fn error(
        conversation_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LoopEvent::Error {
            conversation_id: conversation_id.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// True for events after which the turn emits nothing else.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopEvent::Complete { .. }
                | LoopEvent::Cancelled { .. }
                | LoopEvent::Error { .. }
                | LoopEvent::AwaitingConfirmation { .. }
        )
    }
}

pub type EventSender = mpsc::UnboundedSender<LoopEvent>;

pub(crate) fn emit(events: &EventSender, event: LoopEvent) {
    if events.send(event).is_err() {
        tracing::trace!("event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_types::ToolPayload;

    #[test]
    fn events_serialize_with_camel_case_tag() {
        let event = LoopEvent::error("cnv_1", "max_iterations", "limit reached");
        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["type"], "error");
        assert_eq!(value["conversationId"], "cnv_1");
        assert_eq!(value["code"], "max_iterations");

        let event = LoopEvent::AutoSummaryStatus {
            conversation_id: "cnv_1".into(),
            phase: SummaryPhase::Started,
        };
        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["type"], "autoSummaryStatus");
        assert_eq!(value["phase"], "started");
    }

    #[test]
    fn status_reflects_outcome_and_partial_counts() {
        let ok = ToolExecutionResult::new(
            "call_1",
            "multi_edit",
            ToolOutcome::Success,
            ToolPayload::success(serde_json::json!("done")),
        );
        assert_eq!(ToolStatus::from_result(&ok), ToolStatus::Success);

        let mut partial = ok.clone();
        partial.result.metadata = Some(serde_json::json!({"successCount": 2, "failedCount": 1}));
        assert_eq!(ToolStatus::from_result(&partial), ToolStatus::Warning);

        let rejected = ToolExecutionResult::new(
            "call_2",
            "write_file",
            ToolOutcome::PolicyRejected,
            ToolPayload::rejected("not allowed"),
        );
        assert_eq!(ToolStatus::from_result(&rejected), ToolStatus::Error);
    }
}
