use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use agentloop_config::{Settings, SettingsProvider};
use agentloop_provider::ProviderConfig;
use agentloop_tool::{
    normalize_args, parse_mcp_tool_name, McpToolProvider, ToolContext, ToolError, ToolRegistry,
    ToolResult, ToolSchema,
};
use agentloop_types::{
    Checkpoint, CheckpointPhase, FunctionCall, FunctionResponse, InlineData, Part,
    ToolExecutionResult, ToolOutcome, ToolPayload,
};

use crate::checkpoint::{CheckpointCoordinator, TOOL_BATCH_LABEL};
use crate::events::ToolStatus;

/// Argument keys that carry the target path of a file tool.
const PATH_ARG_KEYS: &[&str] = &["path", "file_path", "filePath"];

pub struct BatchContext<'a> {
    pub conversation_id: &'a str,
    /// Index of the model message holding the calls.
    pub message_index: usize,
    pub config: &'a ProviderConfig,
    pub mode: Option<&'a str>,
    pub cancel: &'a CancellationToken,
    /// Calls the user declined at confirmation. They get a rejection result
    /// in place and are never invoked.
    pub declined: &'a HashSet<String>,
    /// Sub-agent calls of the same model message already handled by an
    /// earlier batch. They count against the per-message cap.
    pub agent_calls_before: usize,
}

#[derive(Debug, Clone)]
pub enum BatchProgress {
    Start {
        call: FunctionCall,
    },
    End {
        call: FunctionCall,
        status: ToolStatus,
        result: ToolExecutionResult,
    },
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Function responses in call order, each preceded by any attachment parts
    /// routed in front of it.
    pub response_parts: Vec<Part>,
    pub results: Vec<ToolExecutionResult>,
    pub checkpoints: Vec<Checkpoint>,
    /// Every attachment that made it into the response message.
    pub multimodal_attachments: Vec<InlineData>,
    /// The batch stopped early because the turn was cancelled.
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn halts_turn(&self) -> bool {
        self.cancelled || self.results.iter().any(|r| r.outcome.halts_turn())
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    mcp: Option<Arc<dyn McpToolProvider>>,
    settings: Arc<dyn SettingsProvider>,
    checkpoints: Arc<CheckpointCoordinator>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        settings: Arc<dyn SettingsProvider>,
        checkpoints: Arc<CheckpointCoordinator>,
    ) -> Self {
        Self {
            registry,
            mcp: None,
            settings,
            checkpoints,
        }
    }

    pub fn with_mcp(mut self, mcp: Arc<dyn McpToolProvider>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    /// False when the call would be policy-rejected anyway; otherwise true
    /// unless the tool is on the auto-exec allowlist.
    pub fn needs_confirmation(&self, call: &FunctionCall, mode: Option<&str>) -> bool {
        let settings = self.settings.settings();
        if policy_rejection(&settings, &call.name, &call.args, mode).is_some() {
            return false;
        }
        !settings
            .tools
            .auto_exec
            .get(&call.name)
            .copied()
            .unwrap_or(settings.tools.auto_exec_default)
    }

    /// Schemas of the registered tools the model may call under the current
    /// settings. Globally disabled execution declares nothing.
    pub async fn declared_tools(&self) -> Vec<ToolSchema> {
        let settings = self.settings.settings();
        if settings.tools.disabled {
            return Vec::new();
        }
        self.registry
            .list_schemas()
            .await
            .into_iter()
            .filter(|schema| !settings.tools.disabled_tools.contains(&schema.name))
            .collect()
    }

    pub async fn execute_batch(
        &self,
        calls: &[FunctionCall],
        ctx: BatchContext<'_>,
    ) -> BatchOutcome {
        self.execute_batch_with_progress(calls, ctx, |_| {}).await
    }

    /// Runs `calls` sequentially, reporting each start and end to `on_progress`.
    pub async fn execute_batch_with_progress<F>(
        &self,
        calls: &[FunctionCall],
        ctx: BatchContext<'_>,
        mut on_progress: F,
    ) -> BatchOutcome
    where
        F: FnMut(BatchProgress) + Send,
    {
        let settings = self.settings.settings();
        let mut outcome = BatchOutcome::default();
        if calls.is_empty() {
            return outcome;
        }

        let over_limit = agent_limit_overflow(&settings, calls, ctx.agent_calls_before);

        let label = match calls {
            [single] => single.name.as_str(),
            _ => TOOL_BATCH_LABEL,
        };
        if let Some(cp) = self
            .checkpoints
            .create_for_tool_batch(
                ctx.conversation_id,
                ctx.message_index,
                label,
                CheckpointPhase::Before,
            )
            .await
        {
            outcome.checkpoints.push(cp);
        }

        for (position, call) in calls.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                tracing::info!(
                    conversation_id = %ctx.conversation_id,
                    remaining = calls.len() - position,
                    "batch cancelled before remaining calls"
                );
                outcome.cancelled = true;
                break;
            }

            on_progress(BatchProgress::Start { call: call.clone() });

            let result = if ctx.declined.contains(&call.id) {
                ToolExecutionResult::new(
                    &call.id,
                    &call.name,
                    ToolOutcome::UserRejected,
                    ToolPayload::rejected("The user declined this tool call"),
                )
            } else if over_limit.contains(&position) {
                tracing::info!(
                    conversation_id = %ctx.conversation_id,
                    tool_name = %call.name,
                    call_id = %call.id,
                    limit = settings.tools.max_concurrent_agents,
                    "agent call over the concurrency limit"
                );
                ToolExecutionResult::new(
                    &call.id,
                    &call.name,
                    ToolOutcome::LimitExceeded,
                    ToolPayload::rejected(format!(
                        "Concurrent {} limit of {} reached for this response",
                        call.name, settings.tools.max_concurrent_agents
                    )),
                )
            } else if let Some(reason) = policy_rejection(&settings, &call.name, &call.args, ctx.mode)
            {
                tracing::info!(
                    conversation_id = %ctx.conversation_id,
                    tool_name = %call.name,
                    call_id = %call.id,
                    reason = %reason,
                    "tool call rejected by policy"
                );
                ToolExecutionResult::new(
                    &call.id,
                    &call.name,
                    ToolOutcome::PolicyRejected,
                    ToolPayload::rejected(reason),
                )
            } else {
                self.dispatch(call, &ctx).await
            };

            let status = ToolStatus::from_result(&result);
            self.route_response(&mut outcome, &result, ctx.config);
            on_progress(BatchProgress::End {
                call: call.clone(),
                status,
                result: result.clone(),
            });
            outcome.results.push(result);
        }

        if let Some(cp) = self
            .checkpoints
            .create_for_tool_batch(
                ctx.conversation_id,
                ctx.message_index + 1,
                label,
                CheckpointPhase::After,
            )
            .await
        {
            outcome.checkpoints.push(cp);
        }

        outcome
    }

    async fn dispatch(&self, call: &FunctionCall, ctx: &BatchContext<'_>) -> ToolExecutionResult {
        let tool_ctx = ToolContext::new(ctx.conversation_id, ctx.message_index)
            .with_call_id(&call.id)
            .with_mode(ctx.mode.map(str::to_string))
            .with_abort(ctx.cancel.clone());

        let fut = async {
            match parse_mcp_tool_name(&call.name) {
                Some((server, tool)) => match &self.mcp {
                    Some(mcp) => {
                        let args = normalize_args(&call.name, call.args.clone());
                        mcp.call_tool(server, tool, args, tool_ctx).await
                    }
                    None => Err(ToolError::NotFound(format!(
                        "MCP server '{}' is not available",
                        server
                    ))),
                },
                None => {
                    self.registry
                        .execute(&call.name, call.args.clone(), tool_ctx)
                        .await
                }
            }
        };

        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ToolError::ExecutionError(format!(
                "Tool '{}' panicked",
                call.name
            ))),
        };

        match result {
            Ok(result) => success_result(call, result),
            Err(ToolError::Cancelled) => {
                tracing::info!(tool_name = %call.name, call_id = %call.id, "tool call cancelled");
                ToolExecutionResult::new(
                    &call.id,
                    &call.name,
                    ToolOutcome::Cancelled,
                    ToolPayload::cancelled(),
                )
            }
            Err(e) => {
                tracing::error!(
                    tool_name = %call.name,
                    call_id = %call.id,
                    error = %e,
                    "tool call failed"
                );
                ToolExecutionResult::new(
                    &call.id,
                    &call.name,
                    ToolOutcome::Failed,
                    ToolPayload::failure(e.to_string()),
                )
            }
        }
    }

    /// Appends the function response for `result`, placing its attachments
    /// where the active provider can take them.
    fn route_response(
        &self,
        outcome: &mut BatchOutcome,
        result: &ToolExecutionResult,
        config: &ProviderConfig,
    ) {
        let mut response = FunctionResponse {
            id: result.id.clone(),
            name: result.name.clone(),
            response: result.response_value(),
            parts: Vec::new(),
        };

        if !result.attachments.is_empty() {
            if config.supports_multimodal_function_response {
                response.parts = result.attachments.clone();
                outcome
                    .multimodal_attachments
                    .extend(result.attachments.iter().cloned());
            } else if config.tool_call_format.is_text_encoded() || config.supports_inline_attachments
            {
                for attachment in &result.attachments {
                    outcome
                        .response_parts
                        .push(Part::InlineData(attachment.clone()));
                    outcome.multimodal_attachments.push(attachment.clone());
                }
            } else {
                tracing::warn!(
                    provider_id = %config.provider_id,
                    tool_name = %result.name,
                    call_id = %result.id,
                    count = result.attachments.len(),
                    "provider accepts no multimodal tool output, discarding attachments"
                );
            }
        }

        outcome
            .response_parts
            .push(Part::FunctionResponse(response));
    }
}

fn success_result(call: &FunctionCall, result: ToolResult) -> ToolExecutionResult {
    let mut payload = ToolPayload::success(serde_json::Value::String(result.output));
    if !result.title.is_empty() {
        payload.title = Some(result.title);
    }
    if !result.metadata.is_empty() {
        payload.metadata = serde_json::to_value(&result.metadata).ok();
    }
    let mut execution =
        ToolExecutionResult::new(&call.id, &call.name, ToolOutcome::Success, payload);
    execution.attachments = result.attachments;
    execution
}

/// Positions of agent-class calls beyond the per-batch cap.
fn agent_limit_overflow(
    settings: &Settings,
    calls: &[FunctionCall],
    already_handled: usize,
) -> HashSet<usize> {
    let limit = settings.tools.max_concurrent_agents;
    // Negative means unlimited.
    if limit < 0 {
        return HashSet::new();
    }
    calls
        .iter()
        .enumerate()
        .filter(|(_, call)| call.name == settings.tools.agent_tool_name)
        .skip((limit as usize).saturating_sub(already_handled))
        .map(|(position, _)| position)
        .collect()
}

/// Returns the rejection reason when configuration forbids the call.
pub(crate) fn policy_rejection(
    settings: &Settings,
    tool_name: &str,
    args: &serde_json::Value,
    mode: Option<&str>,
) -> Option<String> {
    let tools = &settings.tools;
    if tools.disabled {
        return Some("Tool execution is disabled".to_string());
    }
    if tools.disabled_tools.iter().any(|t| t == tool_name) {
        return Some(format!("Tool '{}' is disabled", tool_name));
    }

    let mode_name = mode?;
    let mode_settings = tools.modes.get(mode_name)?;
    if mode_settings.tools.is_empty() || mode_settings.tools.iter().any(|t| t == tool_name) {
        return None;
    }

    if let Some(patterns) = mode_settings.path_exceptions.get(tool_name) {
        return match target_path(args) {
            Some(path) if path_matches(path, patterns) => None,
            Some(path) => Some(format!(
                "Tool '{}' may only write to {} in mode '{}', not '{}'",
                tool_name,
                patterns.join(", "),
                mode_name,
                path
            )),
            None => Some(format!(
                "Tool '{}' needs a path matching {} in mode '{}'",
                tool_name,
                patterns.join(", "),
                mode_name
            )),
        };
    }

    Some(format!(
        "Tool '{}' is not available in mode '{}'",
        tool_name, mode_name
    ))
}

fn target_path(args: &serde_json::Value) -> Option<&str> {
    PATH_ARG_KEYS
        .iter()
        .find_map(|key| args.get(*key).and_then(|v| v.as_str()))
}

fn path_matches(path: &str, patterns: &[String]) -> bool {
    let normalized = path.trim_start_matches("./");
    patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(normalized))
            .unwrap_or_else(|e| {
                tracing::warn!(pattern = %pattern, error = %e, "invalid path exception glob");
                false
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_config::{ModeSettings, StaticSettings};
    use agentloop_provider::ToolCallFormat;
    use agentloop_storage::{CheckpointBackend, MemoryCheckpointBackend, MemoryConversationStore};
    use agentloop_tool::{Tool, ToolResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct RecordingTool {
        id: &'static str,
        calls: Arc<StdMutex<Vec<String>>>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Screenshot,
        Partial,
        CancelTurn,
        Panic,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn id(&self) -> &str {
            self.id
        }

        fn description(&self) -> &str {
            "records invocations"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            ctx: ToolContext,
        ) -> Result<ToolResult, ToolError> {
            self.calls
                .lock()
                .expect("lock should succeed")
                .push(ctx.call_id.clone().unwrap_or_default());
            match self.behaviour {
                Behaviour::Succeed => Ok(ToolResult::simple(self.id, "ok")),
                Behaviour::Fail => Err(ToolError::ExecutionError("boom".into())),
                Behaviour::Screenshot => {
                    Ok(ToolResult::simple(self.id, "shot").with_attachment("image/png", b"png", None))
                }
                Behaviour::Partial => Ok(ToolResult::simple(self.id, "2 of 3")
                    .with_metadata("successCount", json!(2))
                    .with_metadata("failedCount", json!(1))),
                Behaviour::CancelTurn => {
                    ctx.abort.cancel();
                    Ok(ToolResult::simple(self.id, "finished anyway"))
                }
                Behaviour::Panic => panic!("tool bug"),
            }
        }
    }

    struct Harness {
        executor: ToolExecutor,
        settings: Arc<StaticSettings>,
        calls: Arc<StdMutex<Vec<String>>>,
        backend: Arc<MemoryCheckpointBackend>,
        registry: Arc<ToolRegistry>,
        checkpoints: Arc<CheckpointCoordinator>,
    }

    async fn harness(tools: &[(&'static str, Behaviour)]) -> Harness {
        let registry = Arc::new(ToolRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));
        for (id, behaviour) in tools {
            registry
                .register(RecordingTool {
                    id: *id,
                    calls: calls.clone(),
                    behaviour: *behaviour,
                })
                .await;
        }
        let settings = Arc::new(StaticSettings::default());
        let backend = Arc::new(MemoryCheckpointBackend::new());
        let checkpoints = Arc::new(CheckpointCoordinator::new(
            Some(backend.clone()),
            Arc::new(MemoryConversationStore::new()),
            settings.clone(),
        ));
        Harness {
            executor: ToolExecutor::new(
                registry.clone(),
                settings.clone(),
                checkpoints.clone(),
            ),
            settings,
            calls,
            backend,
            registry,
            checkpoints,
        }
    }

    fn call(name: &str, id: &str) -> FunctionCall {
        FunctionCall::new(name, json!({})).with_id(id)
    }

    fn context<'a>(
        config: &'a ProviderConfig,
        cancel: &'a CancellationToken,
        declined: &'a HashSet<String>,
        mode: Option<&'a str>,
    ) -> BatchContext<'a> {
        BatchContext {
            conversation_id: "cnv_test",
            message_index: 3,
            config,
            mode,
            cancel,
            declined,
            agent_calls_before: 0,
        }
    }

    type McpCall = (String, String, serde_json::Value);

    struct RecordingMcp {
        calls: Arc<StdMutex<Vec<McpCall>>>,
    }

    #[async_trait]
    impl McpToolProvider for RecordingMcp {
        async fn call_tool(
            &self,
            server: &str,
            tool: &str,
            args: serde_json::Value,
            _ctx: ToolContext,
        ) -> Result<ToolResult, ToolError> {
            self.calls
                .lock()
                .expect("lock should succeed")
                .push((server.to_string(), tool.to_string(), args));
            Ok(ToolResult::simple(tool, "issue #12 created"))
        }
    }

    #[tokio::test]
    async fn mcp_calls_reach_the_mcp_provider_with_normalized_args() {
        let h = harness(&[("create_issue", Behaviour::Succeed)]).await;
        let recorded = Arc::new(StdMutex::new(Vec::new()));
        let executor = ToolExecutor::new(
            h.registry.clone(),
            h.settings.clone(),
            h.checkpoints.clone(),
        )
        .with_mcp(Arc::new(RecordingMcp {
            calls: recorded.clone(),
        }));
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();
        let mcp_call =
            FunctionCall::new("mcp__github__create_issue", json!("{\"title\": \"bug\"}"))
                .with_id("call_mcp");

        let outcome = executor
            .execute_batch(&[mcp_call], context(&config, &cancel, &declined, None))
            .await;

        assert_eq!(outcome.results[0].outcome, ToolOutcome::Success);
        assert_eq!(
            *recorded.lock().expect("lock"),
            vec![(
                "github".to_string(),
                "create_issue".to_string(),
                json!({"title": "bug"})
            )]
        );
        assert!(
            h.calls.lock().expect("lock").is_empty(),
            "the registry tool with the bare name must not run"
        );
    }

    #[tokio::test]
    async fn mcp_calls_without_a_provider_fail_as_not_found() {
        let h = harness(&[]).await;
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();

        let outcome = h
            .executor
            .execute_batch(
                &[call("mcp__github__create_issue", "call_mcp")],
                context(&config, &cancel, &declined, None),
            )
            .await;

        let result = &outcome.results[0];
        assert_eq!(result.outcome, ToolOutcome::Failed);
        assert!(!result.result.success);
        let error = result.result.error.as_deref().unwrap_or_default();
        assert!(error.contains("github"), "unexpected error: {}", error);
        assert_eq!(outcome.response_parts.len(), 1);
    }

    #[tokio::test]
    async fn agent_calls_handled_earlier_count_against_the_cap() {
        let h = harness(&[("subagents", Behaviour::Succeed)]).await;
        h.settings.update(|s| s.tools.max_concurrent_agents = 2);
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();
        let mut ctx = context(&config, &cancel, &declined, None);
        ctx.agent_calls_before = 1;

        let outcome = h
            .executor
            .execute_batch(
                &[call("subagents", "call_b"), call("subagents", "call_c")],
                ctx,
            )
            .await;

        assert_eq!(outcome.results[0].outcome, ToolOutcome::Success);
        assert_eq!(outcome.results[1].outcome, ToolOutcome::LimitExceeded);
        assert_eq!(*h.calls.lock().expect("lock"), vec!["call_b".to_string()]);
    }

    #[tokio::test]
    async fn declared_tools_skip_disabled_ones() {
        let h = harness(&[
            ("read_file", Behaviour::Succeed),
            ("write_file", Behaviour::Succeed),
        ])
        .await;
        h.settings
            .update(|s| s.tools.disabled_tools = vec!["write_file".to_string()]);

        let names: Vec<String> = h
            .executor
            .declared_tools()
            .await
            .into_iter()
            .map(|schema| schema.name)
            .collect();
        assert_eq!(names, vec!["read_file".to_string()]);

        h.settings.update(|s| s.tools.disabled = true);
        assert!(h.executor.declared_tools().await.is_empty());
    }

    #[tokio::test]
    async fn agent_calls_over_the_cap_are_rejected_without_invocation() {
        let h = harness(&[("subagents", Behaviour::Succeed)]).await;
        h.settings.update(|s| s.tools.max_concurrent_agents = 1);
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();

        let outcome = h
            .executor
            .execute_batch(
                &[call("subagents", "call_a"), call("subagents", "call_b")],
                context(&config, &cancel, &declined, None),
            )
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].outcome, ToolOutcome::Success);
        assert_eq!(outcome.results[1].outcome, ToolOutcome::LimitExceeded);
        assert!(outcome.results[1].result.rejected);
        assert_eq!(*h.calls.lock().expect("lock"), vec!["call_a".to_string()]);
        assert!(!outcome.halts_turn());
    }

    #[tokio::test]
    async fn failures_are_contained_and_siblings_still_run() {
        let h = harness(&[
            ("explode", Behaviour::Fail),
            ("crash", Behaviour::Panic),
            ("ls", Behaviour::Succeed),
        ])
        .await;
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();

        let outcome = h
            .executor
            .execute_batch(
                &[
                    call("explode", "call_1"),
                    call("crash", "call_2"),
                    call("missing_tool", "call_3"),
                    call("ls", "call_4"),
                ],
                context(&config, &cancel, &declined, None),
            )
            .await;

        let outcomes: Vec<ToolOutcome> = outcome.results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                ToolOutcome::Failed,
                ToolOutcome::Failed,
                ToolOutcome::Failed,
                ToolOutcome::Success
            ]
        );
        let ids: Vec<&str> = outcome
            .response_parts
            .iter()
            .filter_map(Part::as_function_response)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["call_1", "call_2", "call_3", "call_4"]);
    }

    #[tokio::test]
    async fn single_call_batch_is_bracketed_by_named_checkpoints() {
        let h = harness(&[("ls", Behaviour::Succeed)]).await;
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();

        let outcome = h
            .executor
            .execute_batch(&[call("ls", "call_1")], context(&config, &cancel, &declined, None))
            .await;

        assert_eq!(outcome.checkpoints.len(), 2);
        assert!(outcome.checkpoints.iter().all(|cp| cp.label == "ls"));
        assert_eq!(outcome.checkpoints[0].phase, CheckpointPhase::Before);
        assert_eq!(outcome.checkpoints[1].phase, CheckpointPhase::After);
        assert_eq!(h.backend.list("cnv_test").await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_call() {
        let h = harness(&[("stopper", Behaviour::CancelTurn), ("ls", Behaviour::Succeed)]).await;
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();

        let outcome = h
            .executor
            .execute_batch(
                &[call("stopper", "call_1"), call("ls", "call_2")],
                context(&config, &cancel, &declined, None),
            )
            .await;

        assert!(outcome.cancelled);
        assert!(outcome.halts_turn());
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].outcome, ToolOutcome::Success);
        assert_eq!(*h.calls.lock().expect("lock"), vec!["call_1".to_string()]);
        // The after checkpoint is still taken.
        assert_eq!(
            outcome.checkpoints.last().map(|cp| cp.phase),
            Some(CheckpointPhase::After)
        );
    }

    #[tokio::test]
    async fn mode_allowlist_and_path_exceptions() {
        let h = harness(&[("read_file", Behaviour::Succeed), ("write_file", Behaviour::Succeed)]).await;
        h.settings.update(|s| {
            s.tools.modes.insert(
                "plan".to_string(),
                ModeSettings {
                    tools: vec!["read_file".to_string()],
                    path_exceptions: [("write_file".to_string(), vec!["docs/**/*.md".to_string()])]
                        .into_iter()
                        .collect(),
                },
            );
        });
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();

        let calls = [
            call("read_file", "call_1"),
            FunctionCall::new("write_file", json!({"path": "docs/plan/step.md"})).with_id("call_2"),
            FunctionCall::new("write_file", json!({"path": "src/main.rs"})).with_id("call_3"),
        ];
        let outcome = h
            .executor
            .execute_batch(&calls, context(&config, &cancel, &declined, Some("plan")))
            .await;

        let outcomes: Vec<ToolOutcome> = outcome.results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                ToolOutcome::Success,
                ToolOutcome::Success,
                ToolOutcome::PolicyRejected
            ]
        );
        assert!(outcome.results[2].result.rejected);
        assert!(!h.executor.needs_confirmation(&calls[2], Some("plan")));
    }

    #[tokio::test]
    async fn declined_calls_are_user_rejections() {
        let h = harness(&[("rm", Behaviour::Succeed)]).await;
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined: HashSet<String> = ["call_1".to_string()].into_iter().collect();

        let outcome = h
            .executor
            .execute_batch(&[call("rm", "call_1")], context(&config, &cancel, &declined, None))
            .await;

        assert_eq!(outcome.results[0].outcome, ToolOutcome::UserRejected);
        assert!(outcome.halts_turn());
        assert!(h.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn attachments_follow_provider_capabilities() {
        let h = harness(&[("screenshot", Behaviour::Screenshot)]).await;
        let cancel = CancellationToken::new();
        let declined = HashSet::new();
        let calls = [call("screenshot", "call_1")];

        let mut native = ProviderConfig::new("mock", "m", 1000);
        native.supports_multimodal_function_response = true;
        let outcome = h
            .executor
            .execute_batch(&calls, context(&native, &cancel, &declined, None))
            .await;
        assert_eq!(outcome.response_parts.len(), 1);
        let response = outcome.response_parts[0]
            .as_function_response()
            .expect("response part");
        assert_eq!(response.parts.len(), 1);

        let xml = ProviderConfig::new("mock", "m", 1000).with_tool_call_format(ToolCallFormat::Xml);
        let outcome = h
            .executor
            .execute_batch(&calls, context(&xml, &cancel, &declined, None))
            .await;
        assert_eq!(outcome.response_parts.len(), 2);
        assert!(matches!(outcome.response_parts[0], Part::InlineData(_)));
        assert_eq!(outcome.multimodal_attachments.len(), 1);

        let plain = ProviderConfig::new("mock", "m", 1000);
        let outcome = h
            .executor
            .execute_batch(&calls, context(&plain, &cancel, &declined, None))
            .await;
        assert_eq!(outcome.response_parts.len(), 1);
        assert!(outcome.multimodal_attachments.is_empty());
    }

    #[tokio::test]
    async fn progress_reports_start_then_end_with_status() {
        let h = harness(&[("multi_edit", Behaviour::Partial)]).await;
        let config = ProviderConfig::new("mock", "m", 1000);
        let cancel = CancellationToken::new();
        let declined = HashSet::new();
        let mut seen = Vec::new();

        h.executor
            .execute_batch_with_progress(
                &[call("multi_edit", "call_1")],
                context(&config, &cancel, &declined, None),
                |progress| seen.push(progress),
            )
            .await;

        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], BatchProgress::Start { .. }));
        assert!(matches!(
            seen[1],
            BatchProgress::End {
                status: ToolStatus::Warning,
                ..
            }
        ));
    }

    #[test]
    fn confirmation_follows_auto_exec_settings() {
        let mut settings = Settings::default();
        settings.tools.auto_exec.insert("ls".to_string(), true);
        assert!(policy_rejection(&settings, "ls", &json!({}), None).is_none());
        settings.tools.disabled_tools.push("rm".to_string());
        assert!(policy_rejection(&settings, "rm", &json!({}), None).is_some());
        settings.tools.disabled = true;
        assert!(policy_rejection(&settings, "ls", &json!({}), None).is_some());
    }
}
