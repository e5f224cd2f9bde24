use async_trait::async_trait;

use crate::{ToolContext, ToolError, ToolResult};

pub const MCP_TOOL_PREFIX: &str = "mcp__";
const MCP_SEPARATOR: &str = "__";

/// Builds the dispatch name of an MCP tool: `mcp__{server}__{tool}`.
pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("{}{}{}{}", MCP_TOOL_PREFIX, server, MCP_SEPARATOR, tool)
}

/// Splits `mcp__{server}__{tool}` into server and tool names.
///
/// The server name may not contain `__`; the tool name may.
pub fn parse_mcp_tool_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_TOOL_PREFIX)?;
    let (server, tool) = rest.split_once(MCP_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Calls tools exposed by connected MCP servers. Transport is up to the host.
#[async_trait]
pub trait McpToolProvider: Send + Sync {
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError>;
}
