//! Confluence tools.

use std::pin::Pin;

use rmcp::model::{CallToolResult, JsonObject};
use serde_json::json;

use crate::auth::{Backend, RequestContext};
use crate::tools::registry::{backend_client, json_result, object_schema, optional_u64, required_str};
use crate::tools::{ToolError, ToolHandler};

const DEFAULT_SEARCH_LIMIT: u64 = 10;
const MAX_SEARCH_LIMIT: u64 = 50;

/// Operators that mark a query as CQL rather than free text.
const CQL_MARKERS: [&str; 8] = ["=", "~", ">", "<", " AND ", " OR ", " NOT ", "currentUser()"];

/// Plain text becomes a `siteSearch`; anything that already looks like CQL
/// passes through.
fn to_cql(query: &str) -> String {
    if CQL_MARKERS.iter().any(|marker| query.contains(marker)) {
        query.to_string()
    } else {
        format!("siteSearch ~ \"{}\"", query.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Handler for the `confluence_get_page` tool.
pub struct ConfluenceGetPageHandler;

impl ToolHandler for ConfluenceGetPageHandler {
    fn name(&self) -> &str {
        "confluence_get_page"
    }

    fn title(&self) -> Option<&str> {
        Some("Confluence: Get Page")
    }

    fn description(&self) -> &str {
        "Get a Confluence page by ID, including its storage-format body."
    }

    fn input_schema(&self) -> JsonObject {
        object_schema(
            json!({
                "page_id": {
                    "type": "string",
                    "description": "Numeric page ID, e.g. 123456789."
                }
            }),
            &["page_id"],
        )
    }

    fn backend(&self) -> Backend {
        Backend::Wiki
    }

    fn execute<'a>(
        &'a self,
        args: JsonObject,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            let page_id = required_str(&args, "page_id")?;
            if !page_id.chars().all(|c| c.is_ascii_digit()) {
                return Err(ToolError::InvalidArguments(format!(
                    "'{}' is not a numeric page ID",
                    page_id
                )));
            }
            let client = backend_client(ctx, Backend::Wiki)?;

            let page = client
                .get_json(
                    &client.api_path(&format!("content/{}", page_id)),
                    &[("expand", "body.storage,version,space")],
                )
                .await?;
            Ok(json_result(&json!({ "status": "ok", "page": page }), false))
        })
    }
}

/// Handler for the `confluence_search` tool.
pub struct ConfluenceSearchHandler;

impl ToolHandler for ConfluenceSearchHandler {
    fn name(&self) -> &str {
        "confluence_search"
    }

    fn title(&self) -> Option<&str> {
        Some("Confluence: Search")
    }

    fn description(&self) -> &str {
        "Search Confluence content with CQL or plain text."
    }

    fn input_schema(&self) -> JsonObject {
        object_schema(
            json!({
                "query": {
                    "type": "string",
                    "description": "CQL query, or plain text to search the whole site."
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_SEARCH_LIMIT,
                    "default": DEFAULT_SEARCH_LIMIT
                }
            }),
            &["query"],
        )
    }

    fn backend(&self) -> Backend {
        Backend::Wiki
    }

    fn execute<'a>(
        &'a self,
        args: JsonObject,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            let cql = to_cql(required_str(&args, "query")?);
            let limit = optional_u64(&args, "limit", DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT)
                .max(1)
                .to_string();
            let client = backend_client(ctx, Backend::Wiki)?;

            let result = client
                .get_json(
                    &client.api_path("search"),
                    &[("cql", cql.as_str()), ("limit", limit.as_str())],
                )
                .await?;
            Ok(json_result(&json!({ "status": "ok", "result": result }), false))
        })
    }
}
