//! The turn state machine.
//!
//! A turn runs `Iterating` until the model answers without tool calls
//! (`Completed`), a call needs the user's confirmation (`AwaitingConfirmation`),
//! the turn is cancelled, or it fails. Nothing is kept in memory across a
//! confirmation pause: `resume_after_confirmation` rebuilds the pending calls
//! and the round's dynamic context from history.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use agentloop_config::SettingsProvider;
use agentloop_provider::{
    CharEstimator, ChunkStream, GenerateRequest, GenerateResponse, Provider, ProviderConfig,
    ProviderError, StreamAccumulator, StreamChunk, TokenCounter,
};
use agentloop_storage::{CheckpointBackend, ConversationStore};
use agentloop_tool::{McpToolProvider, ToolRegistry};
use agentloop_types::{
    CheckpointPhase, Content, FunctionCall, FunctionResponse, Part, Role, ToolExecutionResult,
    ToolPayload,
};

use crate::checkpoint::CheckpointCoordinator;
use crate::context::{ContextBudgetManager, HistoryOptions, PreparedHistory};
use crate::error::SessionError;
use crate::events::{emit, EventSender, LoopEvent, SummaryPhase};
use crate::executor::{BatchContext, BatchProgress, ToolExecutor};
use crate::parser::ToolCallParser;
use crate::summarize::Summarizer;

/// Produces the per-round context (open editors, time, workspace state).
///
/// Called once when a round starts. The text is stored on the round's user
/// message and reused verbatim for the rest of the round.
#[async_trait]
pub trait DynamicContextProvider: Send + Sync {
    async fn generate(&self, conversation_id: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub system_prompt: String,
    pub config: ProviderConfig,
    pub model_override: Option<String>,
    pub mode: Option<String>,
}

impl TurnOptions {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            system_prompt: String::new(),
            config,
            model_override: None,
            mode: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub message: Content,
    pub options: TurnOptions,
}

impl TurnRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        options: TurnOptions,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: Content::user_input(text),
            options,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub conversation_id: String,
    /// Call id to accepted (`true`) or declined (`false`).
    pub decisions: HashMap<String, bool>,
    /// Free text appended as a user message before the model is called again.
    pub annotation: Option<String>,
    pub options: TurnOptions,
}

impl ConfirmationRequest {
    pub fn new(conversation_id: impl Into<String>, options: TurnOptions) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            decisions: HashMap::new(),
            annotation: None,
            options,
        }
    }

    pub fn with_decision(mut self, call_id: impl Into<String>, accepted: bool) -> Self {
        self.decisions.insert(call_id.into(), accepted);
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnFailure {
    MaxIterations { limit: i64 },
    Provider { code: String, message: String },
    Busy,
    NothingToResume,
    InvalidRequest(String),
}

impl TurnFailure {
    /// Code carried by the matching `LoopEvent::Error`.
    pub fn event_code(&self) -> &'static str {
        match self {
            TurnFailure::MaxIterations { .. } => "max_iterations",
            TurnFailure::Provider { .. } => "provider_error",
            TurnFailure::Busy => "busy",
            TurnFailure::NothingToResume => "nothing_to_resume",
            TurnFailure::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { content: Content },
    AwaitingConfirmation { pending_calls: Vec<FunctionCall> },
    /// A batch with a cancelled or user-declined call ended the turn.
    Halted { results: Vec<ToolExecutionResult> },
    Cancelled,
    Failed(TurnFailure),
}

/// The calls of one model message split at the first one that needs the user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingCalls {
    /// Calls to hand to the executor now, declined ones included.
    pub executable: Vec<FunctionCall>,
    pub declined: HashSet<String>,
    /// The confirmation-required call and everything after it.
    pub awaiting: Vec<FunctionCall>,
}

impl PendingCalls {
    pub fn partition(
        calls: Vec<FunctionCall>,
        decisions: &HashMap<String, bool>,
        needs_confirmation: impl Fn(&FunctionCall) -> bool,
    ) -> Self {
        let mut pending = PendingCalls::default();
        let mut calls = calls.into_iter();
        while let Some(call) = calls.next() {
            match decisions.get(&call.id) {
                Some(true) => pending.executable.push(call),
                Some(false) => {
                    pending.declined.insert(call.id.clone());
                    pending.executable.push(call);
                }
                None if needs_confirmation(&call) => {
                    pending.awaiting.push(call);
                    pending.awaiting.extend(calls);
                    break;
                }
                None => pending.executable.push(call),
            }
        }
        pending
    }
}

/// Unanswered calls of the last model message, with that message's index.
fn unanswered_calls(history: &[Content]) -> Option<(usize, Vec<FunctionCall>)> {
    let model_index = history.iter().rposition(|c| c.role == Role::Model)?;
    let resolved: HashSet<&str> = history[model_index + 1..]
        .iter()
        .flat_map(|c| c.function_responses_iter())
        .map(|r| r.id.as_str())
        .collect();
    let calls: Vec<FunctionCall> = history[model_index]
        .function_calls()
        .filter(|call| !resolved.contains(call.id.as_str()))
        .cloned()
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some((model_index, calls))
    }
}

/// Model responses since the round's opening user message. A resumed round
/// keeps counting where the paused invocation stopped.
fn round_iterations(history: &[Content], round_start: Option<usize>) -> u32 {
    let start = round_start.unwrap_or(0);
    let count = history
        .get(start..)
        .unwrap_or_default()
        .iter()
        .filter(|c| c.role == Role::Model)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Sub-agent calls in `model` ahead of the call `first_id`. Those were
/// dispatched by an earlier batch of the same response.
fn agent_calls_before(model: &Content, first_id: &str, agent_tool_name: &str) -> usize {
    model
        .function_calls()
        .take_while(|call| call.id != first_id)
        .filter(|call| call.name == agent_tool_name)
        .count()
}

struct RunState {
    cancel_token: CancellationToken,
}

/// Per-invocation loop state. Never persisted.
struct LoopIterationState {
    conversation_id: String,
    options: TurnOptions,
    cancel: CancellationToken,
    dynamic_context: Option<String>,
    /// Model responses so far in the current round, across confirmation pauses.
    iteration: u32,
}

enum CallsStep {
    Continue,
    Halt(Vec<ToolExecutionResult>),
    Done(TurnOutcome),
}

pub struct AgentLoopBuilder {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    settings: Arc<dyn SettingsProvider>,
    checkpoint_backend: Option<Arc<dyn CheckpointBackend>>,
    mcp: Option<Arc<dyn McpToolProvider>>,
    token_counter: Option<Arc<dyn TokenCounter>>,
    summary_provider: Option<Arc<dyn Provider>>,
    dynamic_context: Option<Arc<dyn DynamicContextProvider>>,
}

impl AgentLoopBuilder {
    pub fn with_checkpoint_backend(mut self, backend: Arc<dyn CheckpointBackend>) -> Self {
        self.checkpoint_backend = Some(backend);
        self
    }

    pub fn with_mcp(mut self, mcp: Arc<dyn McpToolProvider>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = Some(counter);
        self
    }

    /// Provider used for summarization. Defaults to the main provider.
    pub fn with_summary_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.summary_provider = Some(provider);
        self
    }

    pub fn with_dynamic_context(mut self, provider: Arc<dyn DynamicContextProvider>) -> Self {
        self.dynamic_context = Some(provider);
        self
    }

    pub fn build(self) -> AgentLoop {
        let checkpoints = Arc::new(CheckpointCoordinator::new(
            self.checkpoint_backend,
            self.store.clone(),
            self.settings.clone(),
        ));
        let counter: Arc<dyn TokenCounter> = match self.token_counter {
            Some(counter) => counter,
            None => Arc::new(CharEstimator),
        };
        let budget = Arc::new(ContextBudgetManager::new(
            self.store.clone(),
            counter,
            self.settings.clone(),
        ));
        let summary_provider = match self.summary_provider {
            Some(provider) => provider,
            None => self.provider.clone(),
        };
        let summarizer = Summarizer::new(
            self.store.clone(),
            summary_provider,
            self.settings.clone(),
            checkpoints.clone(),
            budget.clone(),
        );
        let mut executor =
            ToolExecutor::new(self.registry, self.settings.clone(), checkpoints.clone());
        if let Some(mcp) = self.mcp {
            executor = executor.with_mcp(mcp);
        }

        AgentLoop {
            store: self.store,
            provider: self.provider,
            settings: self.settings,
            executor,
            checkpoints,
            budget,
            summarizer,
            dynamic_context: self.dynamic_context,
            runs: Mutex::new(HashMap::new()),
        }
    }
}

pub struct AgentLoop {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn Provider>,
    settings: Arc<dyn SettingsProvider>,
    executor: ToolExecutor,
    checkpoints: Arc<CheckpointCoordinator>,
    budget: Arc<ContextBudgetManager>,
    summarizer: Summarizer,
    dynamic_context: Option<Arc<dyn DynamicContextProvider>>,
    runs: Mutex<HashMap<String, RunState>>,
}

impl AgentLoop {
    pub fn builder(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        settings: Arc<dyn SettingsProvider>,
    ) -> AgentLoopBuilder {
        AgentLoopBuilder {
            store,
            provider,
            registry,
            settings,
            checkpoint_backend: None,
            mcp: None,
            token_counter: None,
            summary_provider: None,
            dynamic_context: None,
        }
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn checkpoints(&self) -> &CheckpointCoordinator {
        &self.checkpoints
    }

    pub fn budget(&self) -> &ContextBudgetManager {
        &self.budget
    }

    pub async fn is_busy(&self, conversation_id: &str) -> bool {
        self.runs.lock().await.contains_key(conversation_id)
    }

    /// Trips the cancellation token of the running turn. Returns false when idle.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let runs = self.runs.lock().await;
        match runs.get(conversation_id) {
            Some(run) => {
                tracing::info!(conversation_id = %conversation_id, "cancelling turn");
                run.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    async fn start(&self, conversation_id: &str) -> Option<CancellationToken> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(conversation_id) {
            return None;
        }
        let token = CancellationToken::new();
        runs.insert(
            conversation_id.to_string(),
            RunState {
                cancel_token: token.clone(),
            },
        );
        Some(token)
    }

    async fn finish_run(&self, conversation_id: &str) {
        self.runs.lock().await.remove(conversation_id);
    }

    fn reject_busy(&self, conversation_id: &str, events: &EventSender) -> TurnOutcome {
        tracing::warn!(conversation_id = %conversation_id, "turn rejected, conversation is busy");
        self.fail(
            conversation_id,
            TurnFailure::Busy,
            "A turn is already running for this conversation",
            events,
        )
    }

    fn fail(
        &self,
        conversation_id: &str,
        failure: TurnFailure,
        message: impl Into<String>,
        events: &EventSender,
    ) -> TurnOutcome {
        emit(
            events,
            LoopEvent::error(conversation_id, failure.event_code(), message),
        );
        TurnOutcome::Failed(failure)
    }

    /// Runs a new turn for the user message in `request`.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        let conversation_id = request.conversation_id.clone();
        let Some(cancel) = self.start(&conversation_id).await else {
            return Ok(self.reject_busy(&conversation_id, events));
        };

        let result = self.run_new_turn(request, cancel, events).await;
        self.finish_run(&conversation_id).await;

        if let Err(e) = &result {
            tracing::error!(conversation_id = %conversation_id, error = %e, "turn failed");
        }
        result
    }

    /// Continues a turn paused on confirmation.
    pub async fn resume_after_confirmation(
        &self,
        request: ConfirmationRequest,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        let conversation_id = request.conversation_id.clone();
        let Some(cancel) = self.start(&conversation_id).await else {
            return Ok(self.reject_busy(&conversation_id, events));
        };

        let result = self.resume(request, cancel, events).await;
        self.finish_run(&conversation_id).await;

        if let Err(e) = &result {
            tracing::error!(conversation_id = %conversation_id, error = %e, "resume failed");
        }
        result
    }

    /// Truncates history from the user message at `index` onward (exclusive)
    /// and runs that round again with fresh dynamic context.
    pub async fn retry_from(
        &self,
        conversation_id: &str,
        index: usize,
        options: TurnOptions,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        let Some(cancel) = self.start(conversation_id).await else {
            return Ok(self.reject_busy(conversation_id, events));
        };

        let result = self
            .retry(conversation_id, index, options, cancel, events)
            .await;
        self.finish_run(conversation_id).await;

        if let Err(e) = &result {
            tracing::error!(conversation_id = %conversation_id, error = %e, "retry failed");
        }
        result
    }

    /// Runs a turn on a tokio task and streams its events.
    pub fn spawn_turn(
        self: &Arc<Self>,
        request: TurnRequest,
    ) -> (
        UnboundedReceiverStream<LoopEvent>,
        JoinHandle<Result<TurnOutcome, SessionError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_turn(request, &tx).await });
        (UnboundedReceiverStream::new(rx), handle)
    }

    pub fn spawn_resume(
        self: &Arc<Self>,
        request: ConfirmationRequest,
    ) -> (
        UnboundedReceiverStream<LoopEvent>,
        JoinHandle<Result<TurnOutcome, SessionError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        let handle =
            tokio::spawn(async move { this.resume_after_confirmation(request, &tx).await });
        (UnboundedReceiverStream::new(rx), handle)
    }

    /// Removes the message at `index` and everything after it.
    pub async fn delete_to_message(
        &self,
        conversation_id: &str,
        index: usize,
    ) -> Result<usize, SessionError> {
        let runs = self.runs.lock().await;
        if runs.contains_key(conversation_id) {
            return Err(SessionError::Busy(conversation_id.to_string()));
        }
        let removed = self.store.delete_to_message(conversation_id, index).await?;
        self.checkpoints
            .delete_from_index(conversation_id, index)
            .await;
        self.budget.clear_trim_state(conversation_id);
        drop(runs);

        tracing::info!(conversation_id = %conversation_id, index, removed, "deleted messages");
        Ok(removed)
    }

    /// Replaces the parts of the message at `index` and drops everything after it.
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        index: usize,
        parts: Vec<Part>,
    ) -> Result<(), SessionError> {
        let runs = self.runs.lock().await;
        if runs.contains_key(conversation_id) {
            return Err(SessionError::Busy(conversation_id.to_string()));
        }
        let Some(mut message) = self.store.get_message(conversation_id, index).await? else {
            return Err(SessionError::InvalidRequest(format!(
                "no message at index {}",
                index
            )));
        };
        message.parts = parts;
        message.token_counts.clear();

        self.store
            .delete_to_message(conversation_id, index + 1)
            .await?;
        self.store
            .update_message(conversation_id, index, message)
            .await?;
        self.checkpoints
            .delete_from_index(conversation_id, index)
            .await;
        self.budget.clear_trim_state(conversation_id);
        drop(runs);

        tracing::info!(conversation_id = %conversation_id, index, "edited message");
        Ok(())
    }

    async fn run_new_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        let conversation_id = request.conversation_id;
        self.close_unanswered_calls(&conversation_id).await?;

        let mut checkpoints = Vec::new();
        let next_index = self.store.history_len(&conversation_id).await?;
        checkpoints.extend(
            self.checkpoints
                .create_for_user_message(&conversation_id, CheckpointPhase::Before, Some(next_index))
                .await,
        );

        let dynamic_context = self.generate_dynamic_context(&conversation_id).await;
        let mut message = request.message;
        message.role = Role::User;
        message.is_user_input = true;
        message.turn_dynamic_context = dynamic_context.clone();
        let index = self.store.add_content(&conversation_id, message).await?;

        checkpoints.extend(
            self.checkpoints
                .create_for_user_message(&conversation_id, CheckpointPhase::After, Some(index))
                .await,
        );
        if !checkpoints.is_empty() {
            emit(
                events,
                LoopEvent::CheckpointsOnly {
                    conversation_id: conversation_id.clone(),
                    checkpoints,
                },
            );
        }

        let mut state = LoopIterationState {
            conversation_id,
            options: request.options,
            cancel,
            dynamic_context,
            iteration: 0,
        };
        self.iterate(&mut state, events).await
    }

    async fn resume(
        &self,
        request: ConfirmationRequest,
        cancel: CancellationToken,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        let conversation_id = request.conversation_id;
        let history = self.store.get_history(&conversation_id).await?;
        let Some((model_index, calls)) = unanswered_calls(&history) else {
            tracing::warn!(conversation_id = %conversation_id, "nothing to resume");
            return Ok(self.fail(
                &conversation_id,
                TurnFailure::NothingToResume,
                "No tool calls are waiting for confirmation",
                events,
            ));
        };

        for call_id in request.decisions.keys() {
            if !calls.iter().any(|c| &c.id == call_id) {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    call_id = %call_id,
                    "decision for a call that is not pending"
                );
            }
        }

        let round_start = history[..model_index]
            .iter()
            .rposition(|c| c.is_user_input);
        let dynamic_context = match round_start
            .and_then(|i| history[i].turn_dynamic_context.clone())
        {
            Some(cached) => Some(cached),
            None => {
                let generated = self.generate_dynamic_context(&conversation_id).await;
                if let (Some(index), Some(text)) = (round_start, generated.as_ref()) {
                    let mut message = history[index].clone();
                    message.turn_dynamic_context = Some(text.clone());
                    self.store
                        .update_message(&conversation_id, index, message)
                        .await?;
                }
                generated
            }
        };

        let mut state = LoopIterationState {
            conversation_id,
            options: request.options,
            cancel,
            dynamic_context,
            iteration: round_iterations(&history, round_start),
        };

        let model_content = history[model_index].clone();
        let mode = state.options.mode.clone();
        let pending = PendingCalls::partition(calls, &request.decisions, |call| {
            self.executor.needs_confirmation(call, mode.as_deref())
        });

        match self
            .process_calls(&state, &model_content, model_index, pending, events)
            .await?
        {
            CallsStep::Continue => {}
            CallsStep::Halt(results) if request.annotation.is_none() => {
                return Ok(TurnOutcome::Halted { results });
            }
            CallsStep::Halt(_) => {}
            CallsStep::Done(outcome) => return Ok(outcome),
        }

        if let Some(annotation) = request.annotation.filter(|a| !a.trim().is_empty()) {
            self.store
                .add_content(&state.conversation_id, Content::user_text(annotation))
                .await?;
        }
        self.iterate(&mut state, events).await
    }

    async fn retry(
        &self,
        conversation_id: &str,
        index: usize,
        options: TurnOptions,
        cancel: CancellationToken,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        let message = self
            .store
            .get_message(conversation_id, index)
            .await?
            .filter(|m| m.is_user_input);
        let Some(mut message) = message else {
            return Ok(self.fail(
                conversation_id,
                TurnFailure::InvalidRequest(format!("message {} is not a user message", index)),
                format!("Cannot retry from message {}: not a user message", index),
                events,
            ));
        };

        self.store
            .delete_to_message(conversation_id, index + 1)
            .await?;
        self.checkpoints
            .delete_from_index(conversation_id, index)
            .await;
        self.budget.clear_trim_state(conversation_id);

        let dynamic_context = self.generate_dynamic_context(conversation_id).await;
        message.turn_dynamic_context = dynamic_context.clone();
        self.store
            .update_message(conversation_id, index, message)
            .await?;

        tracing::info!(conversation_id = %conversation_id, index, "retrying round");
        let mut state = LoopIterationState {
            conversation_id: conversation_id.to_string(),
            options,
            cancel,
            dynamic_context,
            iteration: 0,
        };
        self.iterate(&mut state, events).await
    }

    async fn iterate(
        &self,
        state: &mut LoopIterationState,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        let max_iterations = self.settings.settings().tools.max_iterations;
        let conversation_id = state.conversation_id.clone();

        loop {
            if state.cancel.is_cancelled() {
                return Ok(self.cancelled(&conversation_id, events));
            }
            if max_iterations >= 0 && i64::from(state.iteration) >= max_iterations {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    limit = max_iterations,
                    "maximum tool iterations reached"
                );
                return Ok(self.fail(
                    &conversation_id,
                    TurnFailure::MaxIterations {
                        limit: max_iterations,
                    },
                    format!("Reached the limit of {} tool iterations", max_iterations),
                    events,
                ));
            }

            let iteration = state.iteration + 1;
            tracing::info!(conversation_id = %conversation_id, iteration, "starting iteration");

            if let Some(cp) = self
                .checkpoints
                .create_for_model_message(&conversation_id, CheckpointPhase::Before, Some(iteration))
                .await
            {
                emit(
                    events,
                    LoopEvent::CheckpointsOnly {
                        conversation_id: conversation_id.clone(),
                        checkpoints: vec![cp],
                    },
                );
            }

            let prepared = self.prepare_history(state, events).await?;
            if state.cancel.is_cancelled() {
                return Ok(self.cancelled(&conversation_id, events));
            }

            state.iteration = iteration;
            let request = GenerateRequest {
                conversation_id: conversation_id.clone(),
                history: prepared.history,
                system_prompt: state.options.system_prompt.clone(),
                dynamic_context: state.dynamic_context.clone(),
                model_override: state.options.model_override.clone(),
                tools: self.executor.declared_tools().await,
                config: state.options.config.clone(),
            };

            let response = match self.provider.generate(request, state.cancel.clone()).await {
                Ok(response) => response,
                Err(e) => return self.provider_failure(state, e, events),
            };
            let (mut content, interrupted) = match response {
                GenerateResponse::Complete(content) => (content, false),
                GenerateResponse::Stream(stream) => {
                    match self.consume_stream(state, stream, events).await {
                        Ok(result) => result,
                        Err(e) => return self.provider_failure(state, e, events),
                    }
                }
            };

            content.role = Role::Model;
            ToolCallParser::normalize(&mut content);
            ToolCallParser::ensure_ids(&mut content);

            if interrupted || state.cancel.is_cancelled() {
                if !content.is_empty() {
                    self.store.add_content(&conversation_id, content).await?;
                    tracing::info!(
                        conversation_id = %conversation_id,
                        "persisted partial model output"
                    );
                }
                return Ok(self.cancelled(&conversation_id, events));
            }

            let model_index = self
                .store
                .add_content(&conversation_id, content.clone())
                .await?;
            let calls = ToolCallParser::extract(&content);

            if calls.is_empty() {
                let checkpoints: Vec<_> = self
                    .checkpoints
                    .create_for_model_message(
                        &conversation_id,
                        CheckpointPhase::After,
                        Some(iteration),
                    )
                    .await
                    .into_iter()
                    .collect();
                tracing::info!(conversation_id = %conversation_id, iteration, "turn completed");
                emit(
                    events,
                    LoopEvent::Complete {
                        conversation_id: conversation_id.clone(),
                        content: content.clone(),
                        checkpoints,
                    },
                );
                return Ok(TurnOutcome::Completed { content });
            }

            let mode = state.options.mode.clone();
            let pending = PendingCalls::partition(calls, &HashMap::new(), |call| {
                self.executor.needs_confirmation(call, mode.as_deref())
            });
            match self
                .process_calls(state, &content, model_index, pending, events)
                .await?
            {
                CallsStep::Continue => continue,
                CallsStep::Halt(results) => return Ok(TurnOutcome::Halted { results }),
                CallsStep::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// Executes the runnable prefix, persists its responses, then pauses if
    /// a call needs confirmation.
    async fn process_calls(
        &self,
        state: &LoopIterationState,
        model_content: &Content,
        model_index: usize,
        pending: PendingCalls,
        events: &EventSender,
    ) -> Result<CallsStep, SessionError> {
        let conversation_id = state.conversation_id.clone();
        let mut prior_results = Vec::new();
        let mut halts = false;

        if !pending.executable.is_empty() {
            emit(
                events,
                LoopEvent::ToolsExecuting {
                    conversation_id: conversation_id.clone(),
                    pending_calls: pending.executable.clone(),
                },
            );

            let ctx = BatchContext {
                conversation_id: &conversation_id,
                message_index: model_index,
                config: &state.options.config,
                mode: state.options.mode.as_deref(),
                cancel: &state.cancel,
                declined: &pending.declined,
                agent_calls_before: agent_calls_before(
                    model_content,
                    &pending.executable[0].id,
                    &self.settings.settings().tools.agent_tool_name,
                ),
            };
            let batch = self
                .executor
                .execute_batch_with_progress(&pending.executable, ctx, |progress| {
                    let event = match progress {
                        BatchProgress::Start { call } => LoopEvent::ToolStatus {
                            conversation_id: conversation_id.clone(),
                            call,
                            status: crate::events::ToolStatus::Running,
                            result: None,
                        },
                        BatchProgress::End {
                            call,
                            status,
                            result,
                        } => LoopEvent::ToolStatus {
                            conversation_id: conversation_id.clone(),
                            call,
                            status,
                            result: Some(result),
                        },
                    };
                    emit(events, event);
                })
                .await;

            let response = Content::function_responses(batch.response_parts.clone());
            if !batch.response_parts.is_empty() {
                self.store
                    .add_content(&conversation_id, response.clone())
                    .await?;
            }

            if batch.cancelled || state.cancel.is_cancelled() {
                return Ok(CallsStep::Done(self.cancelled(&conversation_id, events)));
            }

            halts = batch.halts_turn();
            if pending.awaiting.is_empty() {
                emit(
                    events,
                    LoopEvent::ToolIteration {
                        conversation_id: conversation_id.clone(),
                        content: response,
                        results: batch.results.clone(),
                        checkpoints: batch.checkpoints,
                    },
                );
            } else if !batch.checkpoints.is_empty() {
                emit(
                    events,
                    LoopEvent::CheckpointsOnly {
                        conversation_id: conversation_id.clone(),
                        checkpoints: batch.checkpoints,
                    },
                );
            }
            prior_results = batch.results;
        }

        if !pending.awaiting.is_empty() {
            tracing::info!(
                conversation_id = %conversation_id,
                tool_name = %pending.awaiting[0].name,
                call_id = %pending.awaiting[0].id,
                "awaiting confirmation"
            );
            emit(
                events,
                LoopEvent::AwaitingConfirmation {
                    conversation_id: conversation_id.clone(),
                    pending_calls: pending.awaiting.clone(),
                    content: model_content.clone(),
                    prior_results,
                },
            );
            return Ok(CallsStep::Done(TurnOutcome::AwaitingConfirmation {
                pending_calls: pending.awaiting,
            }));
        }

        if halts {
            tracing::info!(
                conversation_id = %conversation_id,
                "tool batch declined or cancelled, ending turn"
            );
            return Ok(CallsStep::Halt(prior_results));
        }
        Ok(CallsStep::Continue)
    }

    /// Asks the budget manager for history, summarizing at most once.
    async fn prepare_history(
        &self,
        state: &LoopIterationState,
        events: &EventSender,
    ) -> Result<PreparedHistory, SessionError> {
        let conversation_id = &state.conversation_id;
        let config = &state.options.config;
        let mut options = HistoryOptions::new(state.options.system_prompt.clone());
        let prepared = self
            .budget
            .prepare(
                conversation_id,
                config,
                &options,
                state.dynamic_context.as_deref(),
            )
            .await?;
        if !prepared.needs_auto_summarize {
            return Ok(prepared);
        }

        emit(
            events,
            LoopEvent::AutoSummaryStatus {
                conversation_id: conversation_id.clone(),
                phase: SummaryPhase::Started,
            },
        );
        match self
            .summarizer
            .summarize(conversation_id, config, &state.cancel)
            .await
        {
            Ok(outcome) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    replaced = outcome.replaced_messages,
                    "summary inserted"
                );
                emit(
                    events,
                    LoopEvent::AutoSummaryStatus {
                        conversation_id: conversation_id.clone(),
                        phase: SummaryPhase::Completed,
                    },
                );
                self.repersist_dynamic_context(state).await?;
                options.allow_auto_summarize = false;
                Ok(self
                    .budget
                    .prepare(
                        conversation_id,
                        config,
                        &options,
                        state.dynamic_context.as_deref(),
                    )
                    .await?)
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "summarization failed, continuing with untrimmed history"
                );
                emit(
                    events,
                    LoopEvent::AutoSummaryStatus {
                        conversation_id: conversation_id.clone(),
                        phase: SummaryPhase::Failed,
                    },
                );
                Ok(prepared)
            }
        }
    }

    /// Puts the round's cached context back on its opening message after a
    /// summary rewrote history.
    async fn repersist_dynamic_context(
        &self,
        state: &LoopIterationState,
    ) -> Result<(), SessionError> {
        let Some(text) = state.dynamic_context.as_ref() else {
            return Ok(());
        };
        let history = self.store.get_history(&state.conversation_id).await?;
        let Some(index) = history.iter().rposition(|c| c.is_user_input) else {
            return Ok(());
        };
        if history[index].turn_dynamic_context.as_ref() == Some(text) {
            return Ok(());
        }
        let mut message = history[index].clone();
        message.turn_dynamic_context = Some(text.clone());
        self.store
            .update_message(&state.conversation_id, index, message)
            .await?;
        Ok(())
    }

    /// Drains a provider stream into one message. The flag is true when the
    /// turn was cancelled before the stream ended.
    async fn consume_stream(
        &self,
        state: &LoopIterationState,
        mut stream: ChunkStream,
        events: &EventSender,
    ) -> Result<(Content, bool), ProviderError> {
        let mut acc = StreamAccumulator::new();
        loop {
            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return Ok((acc.into_content(), true)),
                item = stream.next() => match item {
                    Some(Ok(chunk)) => {
                        if !matches!(chunk, StreamChunk::Usage(_) | StreamChunk::Done) {
                            emit(
                                events,
                                LoopEvent::Chunk {
                                    conversation_id: state.conversation_id.clone(),
                                    chunk: chunk.clone(),
                                },
                            );
                        }
                        acc.push(chunk);
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }
        Ok((acc.into_content(), false))
    }

    fn provider_failure(
        &self,
        state: &LoopIterationState,
        error: ProviderError,
        events: &EventSender,
    ) -> Result<TurnOutcome, SessionError> {
        if error.is_contract_violation() {
            return Err(SessionError::ProviderContract(error));
        }
        if state.cancel.is_cancelled() {
            return Ok(self.cancelled(&state.conversation_id, events));
        }
        tracing::error!(
            conversation_id = %state.conversation_id,
            iteration = state.iteration,
            error = %error,
            retryable = error.is_retryable(),
            "provider call failed"
        );
        let message = error.to_string();
        Ok(self.fail(
            &state.conversation_id,
            TurnFailure::Provider {
                code: error.code().to_string(),
                message: message.clone(),
            },
            message,
            events,
        ))
    }

    fn cancelled(&self, conversation_id: &str, events: &EventSender) -> TurnOutcome {
        tracing::info!(conversation_id = %conversation_id, "turn cancelled");
        emit(
            events,
            LoopEvent::Cancelled {
                conversation_id: conversation_id.to_string(),
            },
        );
        TurnOutcome::Cancelled
    }

    async fn generate_dynamic_context(&self, conversation_id: &str) -> Option<String> {
        match &self.dynamic_context {
            Some(provider) => provider.generate(conversation_id).await,
            None => None,
        }
    }

    /// Answers calls left without a response by an earlier turn so every
    /// call in history is paired before the provider sees it.
    async fn close_unanswered_calls(&self, conversation_id: &str) -> Result<(), SessionError> {
        let history = self.store.get_history(conversation_id).await?;
        let Some((_, calls)) = unanswered_calls(&history) else {
            return Ok(());
        };
        let response = serde_json::to_value(ToolPayload::cancelled())
            .unwrap_or_else(|_| serde_json::json!({ "success": false, "cancelled": true }));
        let parts = calls
            .iter()
            .map(|call| {
                Part::FunctionResponse(FunctionResponse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    response: response.clone(),
                    parts: Vec::new(),
                })
            })
            .collect();
        self.store
            .add_content(conversation_id, Content::function_responses(parts))
            .await?;
        tracing::info!(
            conversation_id = %conversation_id,
            count = calls.len(),
            "closed unanswered tool calls from an earlier turn"
        );
        Ok(())
    }
}
