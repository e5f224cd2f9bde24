use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Tool, ToolContext, ToolError, ToolResult, ToolSchema};

/// True when a string payload is most likely broken JSON rather than `key=value` lines.
fn looks_like_jsonish_payload(s: &str) -> bool {
    let trimmed = s.trim_start();
    trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || trimmed.starts_with("\"{")
        || s.contains("\":")
}

/// Coerces loosely encoded tool arguments into a JSON object.
///
/// Handles a JSON object delivered as a string (optionally double encoded) and
/// `key=value` lines. Anything else is returned untouched.
pub fn normalize_args(tool_id: &str, args: serde_json::Value) -> serde_json::Value {
    let Some(s) = args.as_str() else {
        if args.is_null() {
            return serde_json::Value::Object(serde_json::Map::new());
        }
        return args;
    };

    if let Ok(parsed @ serde_json::Value::Object(_)) = serde_json::from_str(s) {
        tracing::debug!(tool = %tool_id, "parsed stringified tool arguments");
        return parsed;
    }
    if let Ok(inner) = serde_json::from_str::<String>(s) {
        if let Ok(parsed @ serde_json::Value::Object(_)) = serde_json::from_str(&inner) {
            tracing::debug!(tool = %tool_id, "parsed double-encoded tool arguments");
            return parsed;
        }
    }

    if looks_like_jsonish_payload(s) {
        return args;
    }

    let mut obj = serde_json::Map::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let json_value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            obj.insert(key.trim().to_string(), json_value);
        }
    }
    if obj.is_empty() {
        return args;
    }
    tracing::info!(
        tool = %tool_id,
        "normalized non-JSON tool arguments from key=value format"
    );
    serde_json::Value::Object(obj)
}

fn rewrite_invalid_arguments(tool_id: &str, err: ToolError) -> ToolError {
    match err {
        ToolError::InvalidArguments(msg) | ToolError::ValidationError(msg) => {
            ToolError::InvalidArguments(format!(
                "The {} tool was called with invalid arguments: {}.\nPlease rewrite the input so it satisfies the expected schema.",
                tool_id, msg
            ))
        }
        other => other,
    }
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register<T: Tool + 'static>(&self, tool: T) {
        self.register_arc(Arc::new(tool)).await;
    }

    pub async fn register_arc(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().await;
        tools.insert(tool.id().to_string(), tool);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(id).cloned()
    }

    /// Returns all registered tool IDs, sorted.
    pub async fn list_ids(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut ids: Vec<String> = tools.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list_schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().await;
        let mut schemas: Vec<ToolSchema> = tools
            .values()
            .map(|t| ToolSchema {
                name: t.id().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Maps a requested tool name onto a registered one.
    ///
    /// Exact matches win; otherwise a unique case-insensitive match is accepted.
    pub async fn resolve_name(&self, requested: &str) -> Option<String> {
        let tools = self.tools.read().await;
        if tools.contains_key(requested) {
            return Some(requested.to_string());
        }
        let lower = requested.to_ascii_lowercase();
        let mut matches = tools
            .keys()
            .filter(|name| name.to_ascii_lowercase() == lower);
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        tracing::info!(requested = %requested, repaired = %first, "repaired tool name");
        Some(first.clone())
    }

    pub async fn execute(
        &self,
        tool_id: &str,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let resolved = match self.resolve_name(tool_id).await {
            Some(name) => name,
            None => {
                let available = self.list_ids().await;
                return Err(ToolError::NotFound(format!(
                    "Tool '{}' not found in registry. Available tools: {}",
                    tool_id,
                    available.join(", ")
                )));
            }
        };
        let tool = self
            .get(&resolved)
            .await
            .ok_or_else(|| ToolError::NotFound(resolved.clone()))?;

        let args = normalize_args(&resolved, args);
        if args.as_object().is_some_and(|o| o.is_empty()) {
            tracing::debug!(tool = %resolved, "tool called with empty arguments object");
        }

        tool.validate(&args)
            .map_err(|e| rewrite_invalid_arguments(&resolved, e))?;

        if ctx.is_aborted() {
            return Err(ToolError::Cancelled);
        }

        tool.execute(args, ctx)
            .await
            .map_err(|e| rewrite_invalid_arguments(&resolved, e))
    }
}
