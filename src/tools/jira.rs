//! Jira tools.

use std::pin::Pin;

use reqwest::Method;
use rmcp::model::{CallToolResult, JsonObject};
use serde_json::json;

use crate::auth::{Backend, RequestContext};
use crate::tools::registry::{backend_client, json_result, object_schema, optional_u64, required_str};
use crate::tools::{ToolError, ToolHandler};

const DEFAULT_SEARCH_LIMIT: u64 = 10;
const MAX_SEARCH_LIMIT: u64 = 50;

/// Issue keys end up in URL paths; accept only `PROJ-123` shapes.
fn issue_key(args: &JsonObject) -> Result<String, ToolError> {
    let key = required_str(args, "issue_key")?;
    let valid = key.split_once('-').is_some_and(|(project, number)| {
        !project.is_empty()
            && project.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !number.is_empty()
            && number.chars().all(|c| c.is_ascii_digit())
    });
    if !valid {
        return Err(ToolError::InvalidArguments(format!(
            "'{}' is not an issue key like PROJ-123",
            key
        )));
    }
    Ok(key.to_ascii_uppercase())
}

/// Handler for the `jira_get_issue` tool.
pub struct JiraGetIssueHandler;

impl ToolHandler for JiraGetIssueHandler {
    fn name(&self) -> &str {
        "jira_get_issue"
    }

    fn title(&self) -> Option<&str> {
        Some("Jira: Get Issue")
    }

    fn description(&self) -> &str {
        "Get the details of a Jira issue by key."
    }

    fn input_schema(&self) -> JsonObject {
        object_schema(
            json!({
                "issue_key": {
                    "type": "string",
                    "description": "Issue key, e.g. PROJ-123."
                },
                "fields": {
                    "type": "string",
                    "description": "Comma-separated fields to return; defaults to all navigable fields."
                }
            }),
            &["issue_key"],
        )
    }

    fn backend(&self) -> Backend {
        Backend::IssueTracker
    }

    fn execute<'a>(
        &'a self,
        args: JsonObject,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            let key = issue_key(&args)?;
            let fields = args.get("fields").and_then(|v| v.as_str()).unwrap_or("*navigable");
            let client = backend_client(ctx, Backend::IssueTracker)?;

            let issue = client
                .get_json(&client.api_path(&format!("issue/{}", key)), &[("fields", fields)])
                .await?;
            Ok(json_result(&json!({ "status": "ok", "issue": issue }), false))
        })
    }
}

/// Handler for the `jira_search` tool.
pub struct JiraSearchHandler;

impl ToolHandler for JiraSearchHandler {
    fn name(&self) -> &str {
        "jira_search"
    }

    fn title(&self) -> Option<&str> {
        Some("Jira: Search Issues")
    }

    fn description(&self) -> &str {
        "Search Jira issues with JQL."
    }

    fn input_schema(&self) -> JsonObject {
        object_schema(
            json!({
                "jql": {
                    "type": "string",
                    "description": "JQL query, e.g. project = PROJ AND status = \"In Progress\"."
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_SEARCH_LIMIT,
                    "default": DEFAULT_SEARCH_LIMIT
                },
                "fields": {
                    "type": "string",
                    "description": "Comma-separated fields to return."
                }
            }),
            &["jql"],
        )
    }

    fn backend(&self) -> Backend {
        Backend::IssueTracker
    }

    fn execute<'a>(
        &'a self,
        args: JsonObject,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            let jql = required_str(&args, "jql")?;
            let limit = optional_u64(&args, "limit", DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT).max(1);
            let limit = limit.to_string();
            let fields = args
                .get("fields")
                .and_then(|v| v.as_str())
                .unwrap_or("summary,status,assignee,updated");
            let client = backend_client(ctx, Backend::IssueTracker)?;

            let result = client
                .get_json(
                    &client.api_path("search"),
                    &[("jql", jql), ("maxResults", limit.as_str()), ("fields", fields)],
                )
                .await?;
            Ok(json_result(&json!({ "status": "ok", "result": result }), false))
        })
    }
}

/// Handler for the `jira_add_comment` tool.
pub struct JiraAddCommentHandler;

impl ToolHandler for JiraAddCommentHandler {
    fn name(&self) -> &str {
        "jira_add_comment"
    }

    fn title(&self) -> Option<&str> {
        Some("Jira: Add Comment")
    }

    fn description(&self) -> &str {
        "Add a comment to a Jira issue."
    }

    fn input_schema(&self) -> JsonObject {
        object_schema(
            json!({
                "issue_key": {
                    "type": "string",
                    "description": "Issue key, e.g. PROJ-123."
                },
                "comment": {
                    "type": "string",
                    "description": "Comment text."
                }
            }),
            &["issue_key", "comment"],
        )
    }

    fn backend(&self) -> Backend {
        Backend::IssueTracker
    }

    fn is_write(&self) -> bool {
        true
    }

    fn execute<'a>(
        &'a self,
        args: JsonObject,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            let key = issue_key(&args)?;
            let comment = required_str(&args, "comment")?;
            let client = backend_client(ctx, Backend::IssueTracker)?;

            let created = client
                .send_json(
                    Method::POST,
                    &client.api_path(&format!("issue/{}/comment", key)),
                    &json!({ "body": comment }),
                )
                .await?;
            Ok(json_result(&json!({ "status": "ok", "comment": created }), false))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_issue_key_validation() {
        assert_eq!(issue_key(&args(json!({ "issue_key": "proj-12" }))).unwrap(), "PROJ-12");
        assert_eq!(issue_key(&args(json!({ "issue_key": " AB_C-1 " }))).unwrap(), "AB_C-1");
        for bad in ["PROJ", "PROJ-", "-1", "PROJ-1/../x", "PROJ-1a", ""] {
            assert!(issue_key(&args(json!({ "issue_key": bad }))).is_err(), "{}", bad);
        }
        assert!(issue_key(&args(json!({}))).is_err());
    }

    #[test]
    fn test_only_comment_tool_writes() {
        assert!(!JiraGetIssueHandler.is_write());
        assert!(!JiraSearchHandler.is_write());
        assert!(JiraAddCommentHandler.is_write());
    }

    #[test]
    fn test_schemas_list_required_arguments() {
        let schema = JiraAddCommentHandler.input_schema();
        assert_eq!(schema["required"], json!(["issue_key", "comment"]));
    }
}
