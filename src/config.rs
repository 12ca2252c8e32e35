//! Gateway configuration.
//!
//! Settings are read from the environment using the variable names operators
//! already use for Atlassian MCP servers (`JIRA_URL`, `CONFLUENCE_PERSONAL_TOKEN`,
//! `ATLASSIAN_OAUTH_CLIENT_ID`, ...). Lookups go through a closure so tests can
//! supply a map instead of the process environment.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::auth::{Backend, Deployment, TokenKey};
use crate::types::{CloudId, OAuthClientId};

/// Default timeout for backend HTTP calls.
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;

/// OAuth 2.0 (3LO) application settings for the server's own identity.
#[derive(Debug, Clone)]
pub struct OAuthClientSettings {
    pub client_id: OAuthClientId,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub scope: String,
    pub cloud_id: CloudId,
}

impl OAuthClientSettings {
    /// Key under which this application's token pair is persisted.
    pub fn token_key(&self) -> TokenKey {
        TokenKey::new(self.client_id.clone(), self.cloud_id.clone())
    }
}

/// Network and TLS settings applied to every client built for a backend.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub ssl_verify: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub timeout: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ssl_verify: true,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECONDS),
        }
    }
}

/// The operator-configured identity used when a request carries no credential.
#[derive(Debug, Clone)]
pub enum FallbackIdentity {
    /// OAuth token pair managed by the token store.
    OAuth(OAuthClientSettings),
    /// Server/Data Center personal access token.
    PersonalAccessToken(SecretString),
    /// Username plus API token (Cloud) or password (Server/Data Center).
    Basic { username: String, token: SecretString },
}

impl FallbackIdentity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OAuth(_) => "oauth",
            Self::PersonalAccessToken(_) => "pat",
            Self::Basic { .. } => "basic",
        }
    }
}

/// Everything needed to reach one backend.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub backend: Backend,
    pub url: String,
    pub deployment: Deployment,
    pub fallback: Option<FallbackIdentity>,
    /// Cloud ID of the OAuth application, used to route per-request Bearer
    /// tokens through the OAuth API gateway.
    pub oauth_cloud_id: Option<CloudId>,
    pub network: NetworkSettings,
}

impl BackendSettings {
    /// Settings with no fallback identity and default networking.
    pub fn new(backend: Backend, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            backend,
            deployment: Deployment::from_url(&url),
            url,
            fallback: None,
            oauth_cloud_id: None,
            network: NetworkSettings::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackIdentity) -> Self {
        if let FallbackIdentity::OAuth(oauth) = &fallback {
            self.oauth_cloud_id = Some(oauth.cloud_id.clone());
        }
        self.fallback = Some(fallback);
        self
    }
}

/// Top-level gateway settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub backends: BTreeMap<Backend, BackendSettings>,
    /// Global read-only switch; blocks every write tool regardless of identity.
    pub read_only: bool,
    /// Tool allow-list; `None` enables every tool.
    pub enabled_tools: Option<Vec<String>>,
    /// Override for the OAuth token vault location.
    pub token_file: Option<PathBuf>,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let oauth = oauth_from_lookup(&get);

        let mut backends = BTreeMap::new();
        for (backend, prefix) in [(Backend::IssueTracker, "JIRA"), (Backend::Wiki, "CONFLUENCE")] {
            if let Some(settings) = backend_from_lookup(backend, prefix, oauth.as_ref(), &get) {
                backends.insert(backend, settings);
            }
        }

        Self {
            backends,
            read_only: get("READ_ONLY_MODE").map(|v| parse_flag(&v)).unwrap_or(false),
            enabled_tools: get("ENABLED_TOOLS").and_then(|v| parse_tool_list(&v)),
            token_file: get("MCP_ATLASSIAN_TOKEN_FILE").map(PathBuf::from),
        }
    }

    pub fn backend(&self, backend: Backend) -> Option<&BackendSettings> {
        self.backends.get(&backend)
    }

    /// Every distinct OAuth application used as a fallback identity.
    pub fn oauth_clients(&self) -> Vec<OAuthClientSettings> {
        let mut seen = Vec::<OAuthClientSettings>::new();
        for settings in self.backends.values() {
            if let Some(FallbackIdentity::OAuth(oauth)) = &settings.fallback
                && !seen.iter().any(|s| s.token_key() == oauth.token_key())
            {
                seen.push(oauth.clone());
            }
        }
        seen
    }

    /// Whether `tool` passes the `ENABLED_TOOLS` allow-list.
    pub fn is_tool_enabled(&self, tool: &str) -> bool {
        match &self.enabled_tools {
            Some(list) => list.iter().any(|t| t == tool),
            None => true,
        }
    }
}

fn oauth_from_lookup<G>(get: &G) -> Option<OAuthClientSettings>
where
    G: Fn(&str) -> Option<String>,
{
    Some(OAuthClientSettings {
        client_id: OAuthClientId::new(get("ATLASSIAN_OAUTH_CLIENT_ID")?),
        client_secret: SecretString::new(get("ATLASSIAN_OAUTH_CLIENT_SECRET")?),
        redirect_uri: get("ATLASSIAN_OAUTH_REDIRECT_URI")?,
        scope: get("ATLASSIAN_OAUTH_SCOPE")?,
        cloud_id: CloudId::new(get("ATLASSIAN_OAUTH_CLOUD_ID")?),
    })
}

fn backend_from_lookup<G>(
    backend: Backend,
    prefix: &str,
    oauth: Option<&OAuthClientSettings>,
    get: &G,
) -> Option<BackendSettings>
where
    G: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| get(&format!("{}_{}", prefix, suffix));
    let url = var("URL")?;
    let mut settings = BackendSettings::new(backend, url);

    let username = var("USERNAME");
    let api_token = var("API_TOKEN");
    let personal_token = var("PERSONAL_TOKEN");

    let basic = match (username, api_token) {
        (Some(username), Some(token)) => Some(FallbackIdentity::Basic {
            username,
            token: SecretString::new(token),
        }),
        _ => None,
    };

    // OAuth wins when fully configured; Cloud otherwise needs basic auth,
    // Server/Data Center prefers a PAT.
    let fallback = if let Some(oauth) = oauth {
        Some(FallbackIdentity::OAuth(oauth.clone()))
    } else if settings.deployment == Deployment::Cloud {
        basic
    } else if let Some(pat) = personal_token {
        Some(FallbackIdentity::PersonalAccessToken(SecretString::new(pat)))
    } else {
        basic
    };

    if let Some(fallback) = fallback {
        settings = settings.with_fallback(fallback);
    }

    settings.network = NetworkSettings {
        ssl_verify: var("SSL_VERIFY")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true),
        http_proxy: var("HTTP_PROXY").or_else(|| get("HTTP_PROXY")),
        https_proxy: var("HTTPS_PROXY").or_else(|| get("HTTPS_PROXY")),
        no_proxy: var("NO_PROXY").or_else(|| get("NO_PROXY")),
        timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECONDS),
    };

    Some(settings)
}

/// Parse a boolean switch the way `READ_ONLY_MODE` has always been read.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "on"
    )
}

/// Parse a comma-separated tool list; empty lists mean "no filter".
pub fn parse_tool_list(value: &str) -> Option<Vec<String>> {
    let tools: Vec<String> = value
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tools.is_empty() { None } else { Some(tools) }
}
