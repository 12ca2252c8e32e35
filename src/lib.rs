// Identity, credentials and token lifecycle
pub mod auth;
pub mod client;
pub mod config;

// MCP surface
pub mod server;
pub mod tools;
pub mod types;

// Re-export key types and functions
pub use auth::{AuthError, Backend, IdentityResolver, ResolverOptions};
pub use config::Settings;
pub use server::{McpServer, start_mcp_http};
pub use tools::{ToolHandler, ToolRegistry};

use std::sync::Arc;
use anyhow::Result;

/// Convenience function to create a fully configured MCP server.
///
/// This builds the identity resolver from `settings`, registers the default
/// tools, and returns a McpServer that implements rmcp's ServerHandler.
pub fn create_server(settings: Settings, options: &ResolverOptions) -> Result<Arc<McpServer>> {
    let resolver = Arc::new(IdentityResolver::from_settings(settings, options)?);
    let tool_registry = Arc::new(tools::default_registry());

    let server = McpServer::new(resolver, tool_registry);

    Ok(Arc::new(server))
}
