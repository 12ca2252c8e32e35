//! Per-request identity resolution.
//!
//! Turns the `Authorization` header of an inbound call into a
//! [`RequestContext`]: a caller-supplied credential is used as is, an absent one
//! falls back to the operator's identity for the backend, and either way the
//! backend client comes from the shared [`ClientCache`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use http::HeaderMap;
use tracing::{debug, info, warn};

use crate::auth::context::{RequestContext, WriteDenials};
use crate::auth::credential::Credential;
use crate::auth::error::AuthError;
use crate::auth::extractor::CredentialExtractor;
use crate::auth::fingerprint::{Backend, Deployment, Fingerprint};
use crate::auth::refresher::AtlassianTokenEndpoint;
use crate::auth::token_store::{DEFAULT_REFRESH_MARGIN_SECONDS, TokenState, TokenStore};
use crate::auth::vault::{FileTokenVault, TokenVault};
use crate::client::{
    BackendClient, ClientCache, ClientFactory, ClientSpec, DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECONDS,
    HttpClientFactory, OAUTH_GATEWAY_BASE,
};
use crate::config::{BackendSettings, FallbackIdentity, Settings};
use crate::types::CloudId;

/// Tuning knobs for [`IdentityResolver::from_settings`].
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    pub refresh_margin: Duration,
    /// Check per-request credentials against the current-user endpoint
    /// before caching a new client.
    pub validate_on_connect: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            cache_ttl: Duration::from_secs(DEFAULT_TTL_SECONDS),
            refresh_margin: Duration::from_secs(DEFAULT_REFRESH_MARGIN_SECONDS),
            validate_on_connect: true,
        }
    }
}

/// Outcome of checking one backend's configuration at startup.
#[derive(Debug)]
pub struct BackendStatus {
    pub backend: Backend,
    pub deployment: Deployment,
    /// Fallback label (`oauth`, `pat`, `basic`) when usable.
    pub fallback: Result<&'static str, AuthError>,
}

/// Resolves inbound credentials to backend clients.
pub struct IdentityResolver {
    settings: Arc<Settings>,
    token_store: Arc<TokenStore>,
    cache: Arc<ClientCache<BackendClient>>,
    factory: Arc<dyn ClientFactory>,
    /// Fingerprints whose writes were refused; forgotten with the cache TTL.
    write_denials: Arc<WriteDenials>,
}

impl IdentityResolver {
    pub fn new(
        settings: Arc<Settings>,
        token_store: Arc<TokenStore>,
        cache: Arc<ClientCache<BackendClient>>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let write_denials = Arc::new(WriteDenials::new(cache.ttl()));
        Self {
            settings,
            token_store,
            cache,
            factory,
            write_denials,
        }
    }

    /// Wire up the production collaborators: file vault, Atlassian token
    /// endpoint and HTTP client factory.
    pub fn from_settings(settings: Settings, options: &ResolverOptions) -> Result<Self> {
        let vault: Arc<dyn TokenVault> = match &settings.token_file {
            Some(path) => Arc::new(FileTokenVault::with_path(path.clone())),
            None => Arc::new(FileTokenVault::new()?),
        };

        let mut token_store = TokenStore::new(vault, Arc::new(AtlassianTokenEndpoint::new()?))
            .with_margin(options.refresh_margin);
        for client in settings.oauth_clients() {
            token_store = token_store.with_client(client);
        }

        let cache = ClientCache::with_limits(options.cache_max_entries, options.cache_ttl);
        let factory = HttpClientFactory::new().with_validation(options.validate_on_connect);

        Ok(Self::new(
            Arc::new(settings),
            Arc::new(token_store),
            Arc::new(cache),
            Arc::new(factory),
        ))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    pub fn cache(&self) -> &Arc<ClientCache<BackendClient>> {
        &self.cache
    }

    pub fn write_denials(&self) -> &Arc<WriteDenials> {
        &self.write_denials
    }

    /// Resolve the identity for one tool invocation against `backend`.
    pub async fn resolve_context(&self, headers: &HeaderMap, backend: Backend) -> Result<RequestContext, AuthError> {
        let credential = CredentialExtractor::from_headers(headers)?;
        self.resolve_with_credential(credential, backend).await
    }

    /// Resolve an already extracted credential. [`Credential::None`] selects
    /// the backend's fallback identity.
    pub async fn resolve_with_credential(
        &self,
        credential: Credential,
        backend: Backend,
    ) -> Result<RequestContext, AuthError> {
        let settings = self.settings.backend(backend).ok_or_else(|| {
            AuthError::NoAuthenticationConfigured(format!("{} is not configured", backend.product()))
        })?;

        let route = if credential.is_none() {
            self.fallback_route(settings).await?
        } else {
            per_request_route(settings, credential)
        };

        let fingerprint = Fingerprint::derive(&route.credential, backend, settings.deployment)
            .ok_or_else(|| {
                AuthError::NoAuthenticationConfigured(format!(
                    "no credential available for {}",
                    backend.product()
                ))
            })?;

        debug!(
            backend = %backend,
            credential = %route.credential.redacted(),
            fingerprint = %fingerprint.short(),
            fallback = route.fallback,
            "Resolved identity"
        );

        let spec = ClientSpec {
            backend,
            deployment: settings.deployment,
            fingerprint: fingerprint.clone(),
            base_url: route.base_url,
            via_gateway: route.via_gateway,
            per_request: !route.fallback,
            credential: route.credential,
            network: settings.network.clone(),
        };
        let factory = self.factory.clone();
        let client = self
            .cache
            .get_or_create(&fingerprint, move || {
                let build = factory.build(spec);
                async move { build.await.map(Arc::new) }
            })
            .await?;

        let write_denied = self.write_denials.is_denied(&fingerprint);
        if write_denied {
            debug!(fingerprint = %fingerprint.short(), "Identity was refused a write earlier; read-only");
        }
        Ok(
            RequestContext::new(backend, client, self.settings.read_only || write_denied)
                .with_denials(self.write_denials.clone()),
        )
    }

    async fn fallback_route(&self, settings: &BackendSettings) -> Result<Route, AuthError> {
        let Some(fallback) = &settings.fallback else {
            return Err(AuthError::NoAuthenticationConfigured(format!(
                "request has no Authorization header and no fallback identity is configured for {}",
                settings.backend.product()
            )));
        };

        let route = match fallback {
            FallbackIdentity::OAuth(oauth) => {
                let token = self.token_store.get_valid_access_token(&oauth.token_key()).await?;
                Route {
                    credential: Credential::BearerOAuth { token },
                    base_url: gateway_base_url(settings.backend, &oauth.cloud_id),
                    via_gateway: true,
                    fallback: true,
                }
            }
            FallbackIdentity::PersonalAccessToken(token) => Route {
                credential: Credential::PersonalAccessToken { token: token.clone() },
                base_url: settings.url.clone(),
                via_gateway: false,
                fallback: true,
            },
            FallbackIdentity::Basic { username, token } => Route {
                credential: Credential::BasicAuth {
                    username: username.clone(),
                    token: token.clone(),
                },
                base_url: settings.url.clone(),
                via_gateway: false,
                fallback: true,
            },
        };
        Ok(route)
    }

    /// Report, per configured backend, whether requests without credentials
    /// can be served.
    pub async fn check_configuration(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::new();
        for settings in self.settings.backends.values() {
            let fallback = match &settings.fallback {
                None => Err(AuthError::NoAuthenticationConfigured(format!(
                    "{} has no fallback identity; only requests with an Authorization header will work",
                    settings.backend.product()
                ))),
                Some(FallbackIdentity::OAuth(oauth)) => {
                    let key = oauth.token_key();
                    match self.token_store.state(&key).await {
                        None => Err(AuthError::NoAuthenticationConfigured(format!(
                            "no stored OAuth token for {}",
                            key
                        ))),
                        Some(TokenState::Invalid) => Err(AuthError::AuthenticationExpiredUnrefreshable(
                            format!("stored OAuth token for {} is invalid", key),
                        )),
                        Some(_) => Ok("oauth"),
                    }
                }
                Some(other) => Ok(other.label()),
            };

            match &fallback {
                Ok(label) => info!(
                    backend = %settings.backend,
                    deployment = %settings.deployment,
                    fallback = *label,
                    "{} configured",
                    settings.backend.product()
                ),
                Err(e) => warn!(
                    backend = %settings.backend,
                    deployment = %settings.deployment,
                    error = %e,
                    "{} fallback identity unavailable",
                    settings.backend.product()
                ),
            }

            statuses.push(BackendStatus {
                backend: settings.backend,
                deployment: settings.deployment,
                fallback,
            });
        }
        statuses
    }
}

/// Where and as whom a client talks to its backend.
struct Route {
    credential: Credential,
    base_url: String,
    via_gateway: bool,
    fallback: bool,
}

fn per_request_route(settings: &BackendSettings, credential: Credential) -> Route {
    let gateway = match (&credential, settings.deployment, &settings.oauth_cloud_id) {
        (Credential::BearerOAuth { .. }, Deployment::Cloud, Some(cloud_id)) => Some(cloud_id),
        _ => None,
    };
    match gateway {
        Some(cloud_id) => Route {
            credential,
            base_url: gateway_base_url(settings.backend, cloud_id),
            via_gateway: true,
            fallback: false,
        },
        None => Route {
            credential,
            base_url: settings.url.clone(),
            via_gateway: false,
            fallback: false,
        },
    }
}

/// `https://api.atlassian.com/ex/{jira|confluence}/{cloud_id}`
pub fn gateway_base_url(backend: Backend, cloud_id: &CloudId) -> String {
    format!("{}/{}/{}", OAUTH_GATEWAY_BASE, backend.gateway_segment(), cloud_id)
}
