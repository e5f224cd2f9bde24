pub mod agent_loop;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod parser;
pub mod summarize;

pub use agent_loop::{
    AgentLoop, AgentLoopBuilder, ConfirmationRequest, DynamicContextProvider, PendingCalls,
    TurnFailure, TurnOptions, TurnOutcome, TurnRequest,
};
pub use checkpoint::CheckpointCoordinator;
pub use context::{ContextBudgetManager, HistoryOptions, PreparedHistory};
pub use error::SessionError;
pub use events::{EventSender, LoopEvent, SummaryPhase, ToolStatus};
pub use executor::{BatchContext, BatchOutcome, BatchProgress, ToolExecutor};
pub use parser::ToolCallParser;
pub use summarize::{SummarizeError, SummaryOutcome, Summarizer};
