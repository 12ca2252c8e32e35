//! Backend identity fingerprints.
//!
//! A fingerprint names an (identity, backend, deployment) triple without
//! carrying the secret itself, and is the key of the client cache.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::credential::Credential;

/// Remote REST backend a tool talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Jira, the issue-tracking service.
    IssueTracker,
    /// Confluence, the content/wiki service.
    Wiki,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueTracker => "issue-tracker",
            Self::Wiki => "wiki",
        }
    }

    /// Product name used in log lines and user-facing messages.
    pub fn product(&self) -> &'static str {
        match self {
            Self::IssueTracker => "Jira",
            Self::Wiki => "Confluence",
        }
    }

    /// Path segment of the Atlassian OAuth API gateway.
    pub fn gateway_segment(&self) -> &'static str {
        match self {
            Self::IssueTracker => "jira",
            Self::Wiki => "confluence",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment flavor of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Deployment {
    Cloud,
    /// Server or Data Center.
    Server,
}

impl Deployment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Server => "server",
        }
    }

    /// Classify a base URL.
    ///
    /// Localhost and private IPv4 hosts are always Server/Data Center; Cloud is
    /// recognised by the Atlassian-hosted domains.
    pub fn from_url(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return Self::Server;
        };
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        if host == "localhost" || is_private_ipv4(&host) {
            return Self::Server;
        }

        let cloud_suffixes = [".atlassian.net", ".jira.com", ".jira-dev.com"];
        if cloud_suffixes.iter().any(|suffix| host.ends_with(suffix)) {
            Self::Cloud
        } else {
            Self::Server
        }
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_private_ipv4(host: &str) -> bool {
    host.parse::<Ipv4Addr>()
        .map(|ip| ip.is_loopback() || ip.is_private())
        .unwrap_or(false)
}

/// Deterministic cache key for a backend identity.
///
/// Rendered as `kind:sha256(secret):backend:deployment`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for a credential. Returns `None` for
    /// [`Credential::None`], which has no identity of its own.
    pub fn derive(credential: &Credential, backend: Backend, deployment: Deployment) -> Option<Self> {
        let kind = credential.kind()?;
        let digest = credential.secret_digest()?;
        Some(Self(format!(
            "{}:{}:{}:{}",
            kind, digest, backend, deployment
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines: kind, first 12 hash characters, backend.
    pub fn short(&self) -> String {
        let mut parts = self.0.splitn(4, ':');
        let kind = parts.next().unwrap_or_default();
        let hash = parts.next().unwrap_or_default();
        let rest = parts.collect::<Vec<_>>().join(":");
        format!("{}:{}…:{}", kind, &hash[..hash.len().min(12)], rest)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
