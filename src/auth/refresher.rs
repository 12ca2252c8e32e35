//! OAuth refresh-token exchange.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::auth::error::AuthError;
use crate::config::OAuthClientSettings;

/// Atlassian's OAuth 2.0 token endpoint.
pub const ATLASSIAN_TOKEN_URL: &str = "https://auth.atlassian.com/oauth/token";

/// Default timeout for a single refresh exchange.
const DEFAULT_REFRESH_HTTP_TIMEOUT_SECONDS: u64 = 30;

/// Result of a successful refresh exchange.
#[derive(Clone)]
pub struct RefreshedTokens {
    pub access_token: SecretString,
    /// Present when the authorization server rotated the refresh token.
    pub refresh_token: Option<SecretString>,
    /// Lifetime of the new access token in seconds.
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
}

impl RefreshedTokens {
    pub fn new(access_token: impl Into<String>, expires_in: Option<i64>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: None,
            expires_in,
            scope: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.into()));
        self
    }
}

/// Exchanges a refresh token for a new access token.
///
/// Implementations classify failures: network problems, timeouts and 5xx are
/// [`AuthError::UpstreamUnavailable`]; a rejected grant is
/// [`AuthError::AuthenticationExpiredUnrefreshable`].
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        client: &'a OAuthClientSettings,
        refresh_token: &'a SecretString,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedTokens, AuthError>> + Send + 'a>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
}

/// [`TokenRefresher`] that talks to the Atlassian token endpoint.
#[derive(Clone)]
pub struct AtlassianTokenEndpoint {
    http: reqwest::Client,
    token_url: String,
}

impl AtlassianTokenEndpoint {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_token_url(ATLASSIAN_TOKEN_URL)
    }

    /// Endpoint at a custom URL (useful for testing).
    pub fn with_token_url(token_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REFRESH_HTTP_TIMEOUT_SECONDS))
            .build()?;
        Ok(Self {
            http,
            token_url: token_url.into(),
        })
    }

    async fn exchange(
        &self,
        client: &OAuthClientSettings,
        refresh_token: &SecretString,
    ) -> Result<RefreshedTokens, AuthError> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "client_id": client.client_id.as_str(),
            "client_secret": client.client_secret.expose_secret(),
            "refresh_token": refresh_token.expose_secret(),
        });

        debug!(client_id = %client.client_id, "Exchanging refresh token");

        let response = self
            .http
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AuthError::UpstreamUnavailable(format!(
                    "token endpoint unreachable: {}",
                    e.without_url()
                ))
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::UpstreamUnavailable(format!(
                "token endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            let code = response
                .json::<TokenErrorResponse>()
                .await
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| "unknown_error".to_string());
            return Err(AuthError::AuthenticationExpiredUnrefreshable(format!(
                "token endpoint rejected the refresh token ({}: {})",
                status, code
            )));
        }

        let tokens: TokenResponse = response.json().await.map_err(|_| {
            AuthError::UpstreamUnavailable("token endpoint returned a malformed response".to_string())
        })?;

        Ok(RefreshedTokens {
            access_token: SecretString::new(tokens.access_token),
            refresh_token: tokens.refresh_token.map(SecretString::new),
            expires_in: tokens.expires_in,
            scope: tokens.scope,
        })
    }
}

impl TokenRefresher for AtlassianTokenEndpoint {
    fn refresh<'a>(
        &'a self,
        client: &'a OAuthClientSettings,
        refresh_token: &'a SecretString,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedTokens, AuthError>> + Send + 'a>> {
        Box::pin(self.exchange(client, refresh_token))
    }
}
