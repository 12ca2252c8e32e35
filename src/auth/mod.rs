//! Identity resolution for backend calls.
//!
//! Every tool invocation runs as some backend identity. This module decides
//! which one and hands back a ready client:
//!
//! - **Per-request credentials**: `Authorization: Bearer <oauth token>` or
//!   `Authorization: Token <personal access token>` on the inbound request
//! - **Fallback identity**: the operator-configured OAuth pair, PAT or basic
//!   credentials, used when the request carries no header
//!
//! ## Security Model
//!
//! - Secrets live in `SecretString` and are only exposed when building the
//!   outbound `Authorization` header or talking to the token endpoint
//! - Diagnostics show the credential kind and the last four characters only
//! - A malformed header is rejected; it never silently becomes the fallback
//!
//! ## Usage
//!
//! ```ignore
//! let resolver = IdentityResolver::from_settings(Settings::from_env(), &ResolverOptions::default())?;
//! let ctx = resolver.resolve_context(&parts.headers, Backend::IssueTracker).await?;
//! let client = ctx.client(Backend::IssueTracker);
//! ```

mod context;
mod credential;
mod error;
mod extractor;
mod fingerprint;
mod refresher;
mod resolver;
mod token_store;
mod vault;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::{RequestContext, WriteDenials};
pub use credential::{Credential, CredentialKind, VISIBLE_SUFFIX_CHARS, mask_secret};
pub use error::{AUTHENTICATION_ERROR_CODE, AuthError, UPSTREAM_UNAVAILABLE_ERROR_CODE};
pub use extractor::CredentialExtractor;
pub use fingerprint::{Backend, Deployment, Fingerprint};
pub use refresher::{ATLASSIAN_TOKEN_URL, AtlassianTokenEndpoint, RefreshedTokens, TokenRefresher};
pub use resolver::{BackendStatus, IdentityResolver, ResolverOptions, gateway_base_url};
pub use token_store::{
    DEFAULT_REFRESH_MARGIN_SECONDS, DEFAULT_REFRESH_TIMEOUT_SECONDS, TokenKey, TokenRecord,
    TokenState, TokenStore,
};
pub use vault::{FileTokenVault, TokenVault};
