//! Tool handler registry for managing MCP tool implementations.
//!
//! Each tool declares the backend it talks to and whether it writes; the
//! registry uses that to filter `list_tools` and to refuse writes for
//! read-only identities.

mod registry;

pub use registry::{ToolError, ToolHandler, ToolRegistry, json_result};

// Tool handler implementations
mod confluence;
mod jira;

pub use confluence::{ConfluenceGetPageHandler, ConfluenceSearchHandler};
pub use jira::{JiraAddCommentHandler, JiraGetIssueHandler, JiraSearchHandler};

/// Registry with every built-in tool.
pub fn default_registry() -> ToolRegistry {
    ToolRegistry::new()
        .register_handler(JiraGetIssueHandler)
        .register_handler(JiraSearchHandler)
        .register_handler(JiraAddCommentHandler)
        .register_handler(ConfluenceGetPageHandler)
        .register_handler(ConfluenceSearchHandler)
}
