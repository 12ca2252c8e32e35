//! Backend REST clients bound to a single identity.
//!
//! A [`BackendClient`] is built once per identity fingerprint and shared
//! through the [`ClientCache`]. Its `Authorization` header is fixed at
//! construction, so a different credential always means a different client.

mod cache;

pub use cache::{ClientCache, DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECONDS};

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{AuthError, Backend, Credential, CredentialKind, Deployment, Fingerprint};
use crate::config::NetworkSettings;

/// Base URL of the Atlassian OAuth API gateway.
pub const OAUTH_GATEWAY_BASE: &str = "https://api.atlassian.com/ex";

/// Failure of a call made through a [`BackendClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// HTTP status, or `None` when no response was received.
    pub status: Option<StatusCode>,
    pub message: String,
}

impl BackendError {
    fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the backend refused the identity.
    pub fn is_auth_failure(&self) -> bool {
        self.status
            .is_some_and(|s| s == StatusCode::UNAUTHORIZED || s == StatusCode::FORBIDDEN)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "backend returned {}: {}", status, self.message),
            None => write!(f, "backend unreachable: {}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// Everything needed to build a client for one identity.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub backend: Backend,
    pub deployment: Deployment,
    pub fingerprint: Fingerprint,
    pub base_url: String,
    /// Whether `base_url` is the OAuth API gateway rather than the site URL.
    pub via_gateway: bool,
    pub credential: Credential,
    pub network: NetworkSettings,
    /// Whether the credential came from the caller rather than the
    /// server's configured fallback identity.
    pub per_request: bool,
}

/// Immutable HTTP client bound to one backend and one identity.
pub struct BackendClient {
    backend: Backend,
    deployment: Deployment,
    fingerprint: Fingerprint,
    kind: Option<CredentialKind>,
    base_url: Url,
    via_gateway: bool,
    http: reqwest::Client,
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("backend", &self.backend)
            .field("deployment", &self.deployment)
            .field("fingerprint", &self.fingerprint.short())
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl BackendClient {
    /// Build the client without any network traffic.
    pub fn from_spec(spec: &ClientSpec) -> Result<Self, AuthError> {
        let base_url = Url::parse(spec.base_url.trim_end_matches('/')).map_err(|e| {
            AuthError::NoAuthenticationConfigured(format!(
                "invalid {} URL '{}': {}",
                spec.backend.product(),
                spec.base_url,
                e
            ))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(value) = spec.credential.authorization_value() {
            let mut value = HeaderValue::from_str(value.expose_secret()).map_err(|_| {
                AuthError::InvalidCredentialFormat(format!(
                    "{} contains characters not allowed in a header",
                    spec.credential.redacted()
                ))
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let network = &spec.network;
        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(network.timeout);

        if !network.ssl_verify {
            warn!(backend = %spec.backend, "TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let no_proxy = network.no_proxy.as_deref().and_then(reqwest::NoProxy::from_string);
        for (scheme, proxy_url) in [("http", &network.http_proxy), ("https", &network.https_proxy)] {
            let Some(proxy_url) = proxy_url else { continue };
            let proxy = match scheme {
                "http" => reqwest::Proxy::http(proxy_url),
                _ => reqwest::Proxy::https(proxy_url),
            }
            .map_err(|e| {
                AuthError::NoAuthenticationConfigured(format!(
                    "invalid {} proxy for {}: {}",
                    scheme,
                    spec.backend.product(),
                    e
                ))
            })?;
            builder = builder.proxy(proxy.no_proxy(no_proxy.clone()));
        }

        let http = builder.build().map_err(|e| {
            AuthError::NoAuthenticationConfigured(format!(
                "could not build {} client: {}",
                spec.backend.product(),
                e
            ))
        })?;

        Ok(Self {
            backend: spec.backend,
            deployment: spec.deployment,
            fingerprint: spec.fingerprint.clone(),
            kind: spec.credential.kind(),
            base_url,
            via_gateway: spec.via_gateway,
            http,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn deployment(&self) -> Deployment {
        self.deployment
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn credential_kind(&self) -> Option<CredentialKind> {
        self.kind
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// REST API root for this backend, relative to the base URL.
    ///
    /// Confluence behind the OAuth gateway lives under `/wiki`; the site URL of
    /// a Cloud Confluence already includes it.
    pub fn api_root(&self) -> &'static str {
        match (self.backend, self.via_gateway) {
            (Backend::IssueTracker, _) => "/rest/api/2",
            (Backend::Wiki, true) => "/wiki/rest/api",
            (Backend::Wiki, false) => "/rest/api",
        }
    }

    /// Path of an API resource, e.g. `api_path("issue/PROJ-1")`.
    pub fn api_path(&self, resource: &str) -> String {
        format!("{}/{}", self.api_root(), resource.trim_start_matches('/'))
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().copied());
        }
        url
    }

    /// `GET` a JSON resource.
    pub async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, BackendError> {
        let request = self.http.get(self.url(path, query));
        self.execute(request).await
    }

    /// Send a JSON body with `method` and decode the JSON response.
    pub async fn send_json(&self, method: Method, path: &str, body: &Value) -> Result<Value, BackendError> {
        let request = self.http.request(method, self.url(path, &[])).json(body);
        self.execute(request).await
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::transport(e.without_url().to_string()))?;

        let status = response.status();
        debug!(
            backend = %self.backend,
            fingerprint = %self.fingerprint.short(),
            status = %status,
            "Backend call completed"
        );

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError {
                status: Some(status),
                message: error_summary(&text),
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::transport(e.without_url().to_string()))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| BackendError {
            status: Some(status),
            message: format!("response is not JSON: {}", e),
        })
    }
}

/// First useful error message from an Atlassian error body.
fn error_summary(body: &str) -> String {
    const MAX_LEN: usize = 200;
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json
            .get("errorMessages")
            .and_then(|m| m.as_array())
            .and_then(|m| m.first())
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = json.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    body.chars().take(MAX_LEN).collect()
}

/// Builds [`BackendClient`]s for the cache.
///
/// The returned future must own everything it needs: it runs in a task
/// detached from the request that triggered it.
pub trait ClientFactory: Send + Sync {
    fn build(&self, spec: ClientSpec) -> Pin<Box<dyn Future<Output = Result<BackendClient, AuthError>> + Send + 'static>>;
}

/// Factory producing real HTTP clients, optionally checking a caller's
/// identity against the backend before handing the client out.
///
/// Only per-request credentials are checked; the fallback identity is
/// reported by `check-config` instead.
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
    validate_on_connect: bool,
}

impl HttpClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call the backend's current-user endpoint when constructing a client
    /// for a per-request credential.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_on_connect = enabled;
        self
    }
}

/// Current-user resource used to validate an identity.
fn current_user_resource(backend: Backend) -> &'static str {
    match backend {
        Backend::IssueTracker => "myself",
        Backend::Wiki => "user/current",
    }
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, spec: ClientSpec) -> Pin<Box<dyn Future<Output = Result<BackendClient, AuthError>> + Send + 'static>> {
        let validate = self.validate_on_connect && spec.per_request;
        Box::pin(async move {
            let client = BackendClient::from_spec(&spec)?;
            if !validate {
                return Ok(client);
            }

            let path = client.api_path(current_user_resource(spec.backend));
            match client.get_json(&path, &[]).await {
                Ok(_) => {
                    debug!(
                        backend = %spec.backend,
                        credential = %spec.credential.redacted(),
                        "Identity validated"
                    );
                    Ok(client)
                }
                Err(e) if e.is_auth_failure() => {
                    warn!(
                        backend = %spec.backend,
                        credential = %spec.credential.redacted(),
                        "Backend rejected credential"
                    );
                    Err(AuthError::AuthenticationExpiredUnrefreshable(format!(
                        "{} rejected {}",
                        spec.backend.product(),
                        spec.credential.redacted()
                    )))
                }
                Err(e) if e.status.is_some_and(|s| s.is_client_error()) => {
                    warn!(
                        backend = %spec.backend,
                        base_url = %spec.base_url,
                        error = %e,
                        "Identity check rejected by backend"
                    );
                    Err(AuthError::NoAuthenticationConfigured(format!(
                        "{} identity check failed at {}: {}",
                        spec.backend.product(),
                        spec.base_url,
                        e
                    )))
                }
                Err(e) => Err(AuthError::UpstreamUnavailable(format!(
                    "{} identity check failed: {}",
                    spec.backend.product(),
                    e
                ))),
            }
        })
    }
}
