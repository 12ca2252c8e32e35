//! Identity resolution errors.

use std::fmt;

use rmcp::model::ErrorCode;

/// MCP error code used for authentication failures.
pub const AUTHENTICATION_ERROR_CODE: i32 = -32001;

/// MCP error code used for transient upstream failures.
pub const UPSTREAM_UNAVAILABLE_ERROR_CODE: i32 = -32000;

/// Errors produced while resolving a request identity.
///
/// Messages carried by these variants are built from redacted material only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The `Authorization` header is present but malformed or uses an
    /// unsupported scheme. The request is rejected rather than falling back.
    InvalidCredentialFormat(String),
    /// Neither a per-request credential nor a usable fallback identity exists.
    NoAuthenticationConfigured(String),
    /// The identity's token is expired and could not be refreshed, or the
    /// backend rejected the credential.
    AuthenticationExpiredUnrefreshable(String),
    /// A network failure during refresh or client construction. Retryable.
    UpstreamUnavailable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentialFormat(msg) => write!(f, "Invalid credential format: {}", msg),
            Self::NoAuthenticationConfigured(msg) => {
                write!(f, "No authentication configured: {}", msg)
            }
            Self::AuthenticationExpiredUnrefreshable(msg) => {
                write!(f, "Authentication expired and could not be refreshed: {}", msg)
            }
            Self::UpstreamUnavailable(msg) => write!(f, "Upstream unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

impl AuthError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }

    /// Convert this error to an MCP ErrorData for protocol responses.
    pub fn to_mcp_error(&self) -> rmcp::ErrorData {
        match self {
            Self::InvalidCredentialFormat(_) => rmcp::ErrorData::invalid_params(self.to_string(), None),
            Self::AuthenticationExpiredUnrefreshable(_) => rmcp::ErrorData::new(
                ErrorCode(AUTHENTICATION_ERROR_CODE),
                self.to_string(),
                None,
            ),
            Self::NoAuthenticationConfigured(_) => {
                rmcp::ErrorData::internal_error(self.to_string(), None)
            }
            Self::UpstreamUnavailable(_) => rmcp::ErrorData::new(
                ErrorCode(UPSTREAM_UNAVAILABLE_ERROR_CODE),
                self.to_string(),
                Some(serde_json::json!({ "retryable": true })),
            ),
        }
    }
}
