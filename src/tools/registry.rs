//! Tool registry for managing MCP tool handlers.
//!
//! Provides a `ToolHandler` trait for implementing tools and a `ToolRegistry`
//! that filters what is advertised and dispatches invocations with a freshly
//! resolved identity.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::HeaderMap;
use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolResult, Content, ErrorCode, JsonObject, Tool as McpTool};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::auth::{
    AUTHENTICATION_ERROR_CODE, AuthError, Backend, IdentityResolver, RequestContext,
    UPSTREAM_UNAVAILABLE_ERROR_CODE,
};
use crate::client::{BackendClient, BackendError};
use crate::config::Settings;

/// Errors a tool handler can report.
#[derive(Debug)]
pub enum ToolError {
    /// Arguments are missing or have the wrong type.
    InvalidArguments(String),
    /// The backend call failed.
    Backend(BackendError),
    /// Identity resolution failed.
    Auth(AuthError),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            Self::Backend(e) => write!(f, "{}", e),
            Self::Auth(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<BackendError> for ToolError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

impl From<AuthError> for ToolError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}

impl ToolError {
    /// Convert to the protocol response: identity and transport problems are
    /// protocol errors, anything the backend answered is a tool error result.
    pub fn into_result(self) -> Result<CallToolResult, McpError> {
        match self {
            Self::InvalidArguments(msg) => Err(McpError::invalid_params(msg, None)),
            Self::Auth(e) => Err(e.to_mcp_error()),
            Self::Backend(e) if e.is_auth_failure() => Err(McpError::new(
                ErrorCode(AUTHENTICATION_ERROR_CODE),
                e.to_string(),
                None,
            )),
            Self::Backend(e) if e.status.is_none_or(|s| s.is_server_error()) => Err(McpError::new(
                ErrorCode(UPSTREAM_UNAVAILABLE_ERROR_CODE),
                e.to_string(),
                Some(json!({ "retryable": true })),
            )),
            Self::Backend(e) => Ok(json_result(
                &json!({
                    "status": "error",
                    "httpStatus": e.status.map(|s| s.as_u16()),
                    "reason": e.message,
                }),
                true,
            )),
        }
    }
}

/// Wrap a JSON payload as tool output.
pub fn json_result(payload: &Value, is_error: bool) -> CallToolResult {
    let text = serde_json::to_string(payload)
        .unwrap_or_else(|_| "internal serialization error".to_string());
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: None,
        is_error: Some(is_error),
        meta: None,
    }
}

/// JSON schema for an object with the given properties.
pub fn object_schema(properties: Value, required: &[&str]) -> JsonObject {
    let mut schema = JsonObject::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), properties);
    schema.insert("required".to_string(), json!(required));
    schema
}

/// Read a required string argument.
pub fn required_str<'a>(args: &'a JsonObject, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' is required", name)))
}

/// Read an optional bounded integer argument.
pub fn optional_u64(args: &JsonObject, name: &str, default: u64, max: u64) -> u64 {
    args.get(name)
        .and_then(|v| v.as_u64())
        .unwrap_or(default)
        .min(max)
}

/// The context's client for `backend`, which the dispatcher always resolves.
pub fn backend_client(ctx: &RequestContext, backend: Backend) -> Result<&Arc<BackendClient>, ToolError> {
    ctx.client(backend).ok_or_else(|| {
        ToolError::Auth(AuthError::NoAuthenticationConfigured(format!(
            "no {} client resolved for this call",
            backend.product()
        )))
    })
}

/// Trait for handling MCP tool invocations.
///
/// Each tool implements this trait to define its schema and execution logic.
pub trait ToolHandler: Send + Sync {
    /// Returns the tool's name (e.g., "jira_get_issue").
    fn name(&self) -> &str;

    /// Returns the tool's human-readable title.
    fn title(&self) -> Option<&str> {
        None
    }

    /// Returns the tool's description.
    fn description(&self) -> &str;

    /// Returns the input schema for this tool.
    fn input_schema(&self) -> JsonObject;

    /// Backend this tool talks to.
    fn backend(&self) -> Backend;

    /// Whether the tool modifies backend state.
    fn is_write(&self) -> bool {
        false
    }

    /// Executes the tool with the given arguments.
    fn execute<'a>(
        &'a self,
        args: JsonObject,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'a>>;

    /// Converts this handler to an `McpTool` for use in `list_tools`.
    fn to_mcp_tool(&self) -> McpTool {
        let mut tool = McpTool::new(
            self.name().to_string(),
            self.description().to_string(),
            Arc::new(self.input_schema()),
        );
        tool.title = self.title().map(|s| s.to_string());
        tool
    }
}

/// Registry for managing tool handlers.
#[derive(Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a tool handler from a type that implements `ToolHandler`.
    pub fn register_handler<T: ToolHandler + 'static>(mut self, handler: T) -> Self {
        self.handlers.insert(handler.name().to_string(), Arc::new(handler));
        self
    }

    /// Get a tool handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `handler` is advertised under `settings`: it must pass the
    /// allow-list, must not write in read-only mode, and its backend must be
    /// configured.
    pub fn is_visible(handler: &dyn ToolHandler, settings: &Settings) -> bool {
        settings.is_tool_enabled(handler.name())
            && !(handler.is_write() && settings.read_only)
            && settings.backend(handler.backend()).is_some()
    }

    /// Tools to advertise in `list_tools`, sorted by name.
    pub fn list_tools(&self, settings: &Settings) -> Vec<McpTool> {
        let mut tools: Vec<McpTool> = self
            .handlers
            .values()
            .filter(|handler| Self::is_visible(handler.as_ref(), settings))
            .map(|handler| handler.to_mcp_tool())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Resolve the caller's identity and execute a tool.
    pub async fn call_tool(
        &self,
        resolver: &IdentityResolver,
        headers: &HeaderMap,
        name: &str,
        args: JsonObject,
    ) -> Result<CallToolResult, McpError> {
        let handler = self
            .get(name)
            .filter(|h| Self::is_visible(h.as_ref(), resolver.settings()))
            .ok_or_else(|| McpError::invalid_params(format!("Tool not found: {}", name), None))?;

        let ctx = resolver
            .resolve_context(headers, handler.backend())
            .await
            .map_err(|e| {
                info!(tool = %name, error = %e, "Identity resolution failed");
                e.to_mcp_error()
            })?;

        if handler.is_write() && ctx.read_only() {
            let reason = if resolver.settings().read_only {
                "the server is in read-only mode"
            } else {
                "the backend refused writes for this identity"
            };
            return Err(McpError::invalid_request(
                format!("Tool '{}' modifies data and {}", name, reason),
                None,
            ));
        }

        debug!(tool = %name, fingerprint = %ctx.fingerprint().short(), "Dispatching tool");
        match handler.execute(args, &ctx).await {
            Ok(result) => Ok(result),
            Err(ToolError::Backend(e)) => {
                if handler.is_write()
                    && let Some(status) = e.status
                {
                    ctx.record_write_status(status);
                }
                ToolError::Backend(e).into_result()
            }
            Err(e) => e.into_result(),
        }
    }

    /// Check if a tool with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Return the number of registered tools.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Return `true` if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
