//! MCP stdio transport: the tool registry exported as an MCP server.
//!
//! The HTTP variant of the same surface lives in `handlers` (`/mcp/*`);
//! both go through the registry with an MCP caller context, so behavior is
//! identical whether a client speaks stdio directly or proxies to the HTTP
//! endpoints.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
    model::{
        CallToolRequestParams, CallToolResult, Content, InitializeRequestParams,
        InitializeResult, ListToolsResult, PaginatedRequestParams, ServerCapabilities,
        ServerInfo, Tool, ToolsCapability,
    },
    service::RequestContext,
};

use osaurus_core::{CallerContext, ToolRegistry, ToolSpec};

pub struct OsaurusMcp {
    registry: Arc<ToolRegistry>,
}

impl OsaurusMcp {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        tools: Some(ToolsCapability {
            list_changed: Some(true),
        }),
        ..Default::default()
    }
}

fn osaurus_info() -> InitializeResult {
    InitializeResult {
        protocol_version: Default::default(),
        capabilities: server_capabilities(),
        server_info: rmcp::model::Implementation::from_build_env(),
        instructions: Some("Osaurus — local LLM gateway tool registry".into()),
    }
}

fn to_mcp_tool(spec: ToolSpec) -> Tool {
    let schema = match spec.parameters {
        serde_json::Value::Object(map) => map,
        // Non-object schemas are degenerate; advertise an open object.
        _ => {
            let mut map = serde_json::Map::new();
            map.insert("type".into(), serde_json::Value::String("object".into()));
            map
        }
    };
    Tool::new(
        Cow::Owned(spec.name),
        Cow::Owned(spec.description),
        Arc::new(schema),
    )
}

impl ServerHandler for OsaurusMcp {
    fn initialize(
        &self,
        _request: InitializeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<InitializeResult, McpError>> + Send + '_ {
        async { Ok(osaurus_info()) }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            tracing::debug!("MCP list_tools");
            let tools = self
                .registry
                .list()
                .await
                .into_iter()
                .map(to_mcp_tool)
                .collect();
            Ok(ListToolsResult {
                tools,
                ..Default::default()
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            tracing::info!(tool = %request.name, "MCP call_tool");
            let arguments = match request.arguments {
                Some(map) => serde_json::Value::Object(map).to_string(),
                None => "{}".to_string(),
            };

            match self
                .registry
                .execute(&request.name, &arguments, &CallerContext::mcp())
                .await
            {
                Ok(result) => Ok(CallToolResult::success(vec![Content::text(result)])),
                // Tool failures are results with isError, not protocol errors.
                Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
            }
        }
    }

    fn get_info(&self) -> ServerInfo {
        let result = osaurus_info();
        ServerInfo {
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
            server_info: result.server_info,
            instructions: result.instructions,
        }
    }
}

/// Serve the registry on stdin/stdout until the client disconnects.
/// Logging must already be routed to stderr.
pub async fn serve_stdio(registry: Arc<ToolRegistry>) -> anyhow::Result<()> {
    let server = OsaurusMcp::new(registry)
        .serve(rmcp::transport::io::stdio())
        .await?;
    tracing::info!("MCP server on stdio");
    server.waiting().await?;
    tracing::info!("MCP stdio client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_announce_tool_list_changes() {
        let caps = server_capabilities();
        assert_eq!(caps.tools.unwrap().list_changed, Some(true));
    }

    #[test]
    fn non_object_schema_degrades_to_open_object() {
        let tool = to_mcp_tool(ToolSpec::builtin(
            "t",
            "d",
            serde_json::Value::String("bogus".into()),
        ));
        assert_eq!(
            tool.input_schema.get("type"),
            Some(&serde_json::Value::String("object".into()))
        );
    }

    #[test]
    fn tool_schema_passes_through() {
        let tool = to_mcp_tool(ToolSpec::builtin(
            "t",
            "d",
            serde_json::json!({
                "type": "object",
                "properties": { "x": { "type": "number" } }
            }),
        ));
        assert_eq!(tool.name.as_ref(), "t");
        assert!(tool.input_schema.get("properties").is_some());
    }
}
