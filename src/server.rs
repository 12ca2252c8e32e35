//! MCP server implementation using rmcp.
//!
//! Provides the protocol handler and the Streamable HTTP endpoint. Identity is
//! resolved per tool call from the HTTP request that carried it.

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::get;
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
};
use tower_http::trace::TraceLayer;

use crate::auth::IdentityResolver;
use crate::tools::ToolRegistry;

/// Type alias for HTTP request parts stored in rmcp extensions.
type HttpParts = http::request::Parts;

/// MCP server that handles protocol requests and delegates to tool handlers.
#[derive(Clone)]
pub struct McpServer {
    resolver: Arc<IdentityResolver>,
    tool_registry: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(resolver: Arc<IdentityResolver>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            resolver,
            tool_registry,
        }
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }
}

impl ServerHandler for McpServer {
    fn ping(
        &self,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<(), McpError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let result = ListToolsResult {
            tools: self.tool_registry.list_tools(self.resolver.settings()),
            next_cursor: None,
            ..Default::default()
        };
        std::future::ready(Ok(result))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_name = request.name.to_string();
        let args = request.arguments.unwrap_or_default();
        let registry = self.tool_registry.clone();
        let resolver = self.resolver.clone();

        // rmcp stores http::request::Parts in extensions for HTTP transport;
        // stdio calls carry no headers and use the fallback identity.
        let headers = context
            .extensions
            .get::<HttpParts>()
            .map(|parts| parts.headers.clone())
            .unwrap_or_default();

        async move {
            registry
                .call_tool(&resolver, &headers, &tool_name, args)
                .await
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Atlassian gateway exposing Jira and Confluence tools. Send \
                 'Authorization: Bearer <OAuth token>' or 'Authorization: Token <PAT>' \
                 to act as yourself; without it the server's configured identity is used."
                    .to_string(),
            ),
        }
    }
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// Router with the MCP endpoint at `/mcp` and a liveness check at `/healthz`.
pub fn mcp_router(server: McpServer) -> Router {
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    Router::new()
        .route("/healthz", get(healthz))
        .nest_service("/mcp", service)
        .layer(TraceLayer::new_for_http())
}

/// Start the gateway as an MCP Streamable HTTP server.
///
/// This exposes the MCP endpoint at `/mcp` on the given bind address,
/// e.g. `127.0.0.1:8000` or `0.0.0.0:8000`.
pub async fn start_mcp_http(server: McpServer, bind: &str) -> Result<()> {
    let router = mcp_router(server);
    let listener = tokio::net::TcpListener::bind(bind).await?;

    tracing::info!("MCP HTTP server listening on http://{}/mcp", bind);
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{CountingFactory, CountingRefresher, MemoryVault};
    use crate::auth::{Backend, TokenStore};
    use crate::client::ClientCache;
    use crate::config::{BackendSettings, Settings};
    use crate::tools::default_registry;

    fn server() -> McpServer {
        let mut settings = Settings::default();
        settings.backends.insert(
            Backend::Wiki,
            BackendSettings::new(Backend::Wiki, "https://acme.atlassian.net/wiki"),
        );
        let store = TokenStore::new(
            Arc::new(MemoryVault::default()),
            Arc::new(CountingRefresher::succeeding("unused")),
        );
        let resolver = IdentityResolver::new(
            Arc::new(settings),
            Arc::new(store),
            Arc::new(ClientCache::new()),
            Arc::new(CountingFactory::default()),
        );
        McpServer::new(Arc::new(resolver), Arc::new(default_registry()))
    }

    #[test]
    fn test_get_info_enables_tools() {
        let info = server().get_info();
        assert!(info.capabilities.tools.is_some());
    }

    #[test]
    fn test_registry_lists_only_configured_backend() {
        let server = server();
        let tools = server.tool_registry().list_tools(server.resolver().settings());
        let names: Vec<_> = tools.iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["confluence_get_page", "confluence_search"]);
    }

    #[tokio::test]
    async fn test_healthz() {
        let axum::Json(body) = healthz().await;
        assert_eq!(body, serde_json::json!({ "status": "ok" }));
    }
}
