//! Credential value type and secret redaction helpers.

use std::fmt;

use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Number of trailing characters of a secret that may appear in diagnostics.
pub const VISIBLE_SUFFIX_CHARS: usize = 4;

/// The kind of secret a credential carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// OAuth 2.0 access token sent as `Bearer`.
    OAuth,
    /// Personal access token (Server/Data Center).
    Pat,
    /// Username plus API token or password.
    Basic,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OAuth => "oauth",
            Self::Pat => "pat",
            Self::Basic => "basic",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An extracted authentication secret.
///
/// Credentials are immutable once built. Neither `Debug` nor any helper on
/// this type renders more than the kind and the last four characters of the
/// secret.
#[derive(Clone)]
pub enum Credential {
    /// No caller-supplied credential; triggers the fallback identity.
    None,
    /// `Authorization: Bearer <token>`
    BearerOAuth { token: SecretString },
    /// `Authorization: Token <token>`
    PersonalAccessToken { token: SecretString },
    /// Operator-configured username and API token.
    BasicAuth { username: String, token: SecretString },
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::BearerOAuth {
            token: SecretString::new(token.into()),
        }
    }

    pub fn personal_access_token(token: impl Into<String>) -> Self {
        Self::PersonalAccessToken {
            token: SecretString::new(token.into()),
        }
    }

    pub fn basic(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self::BasicAuth {
            username: username.into(),
            token: SecretString::new(token.into()),
        }
    }

    /// The credential kind, or `None` for the absent credential.
    pub fn kind(&self) -> Option<CredentialKind> {
        match self {
            Self::None => None,
            Self::BearerOAuth { .. } => Some(CredentialKind::OAuth),
            Self::PersonalAccessToken { .. } => Some(CredentialKind::Pat),
            Self::BasicAuth { .. } => Some(CredentialKind::Basic),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    fn token(&self) -> Option<&SecretString> {
        match self {
            Self::None => None,
            Self::BearerOAuth { token }
            | Self::PersonalAccessToken { token }
            | Self::BasicAuth { token, .. } => Some(token),
        }
    }

    /// Diagnostic rendering: kind plus the last four characters of the token.
    pub fn redacted(&self) -> String {
        match (self.kind(), self.token()) {
            (Some(kind), Some(token)) => {
                format!("{}({})", kind, mask_secret(token.expose_secret()))
            }
            _ => "none".to_string(),
        }
    }

    /// Hex SHA-256 over the secret material. Basic credentials hash
    /// `username:token` so two users sharing a token never collide.
    pub fn secret_digest(&self) -> Option<String> {
        let mut hasher = Sha256::new();
        match self {
            Self::None => return None,
            Self::BearerOAuth { token } | Self::PersonalAccessToken { token } => {
                hasher.update(token.expose_secret().as_bytes());
            }
            Self::BasicAuth { username, token } => {
                hasher.update(username.as_bytes());
                hasher.update(b":");
                hasher.update(token.expose_secret().as_bytes());
            }
        }
        Some(format!("{:x}", hasher.finalize()))
    }

    /// Value for the outbound `Authorization` header.
    ///
    /// Atlassian Server/Data Center expects personal access tokens with the
    /// `Bearer` scheme, so both token kinds render identically upstream.
    pub fn authorization_value(&self) -> Option<SecretString> {
        let value = match self {
            Self::None => return None,
            Self::BearerOAuth { token } | Self::PersonalAccessToken { token } => {
                format!("Bearer {}", token.expose_secret())
            }
            Self::BasicAuth { username, token } => {
                let raw = format!("{}:{}", username, token.expose_secret());
                format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                )
            }
        };
        Some(SecretString::new(value))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

/// Mask a secret, keeping only its last four characters.
///
/// Secrets of four characters or fewer are masked entirely.
pub fn mask_secret(value: &str) -> String {
    let count = value.chars().count();
    if count <= VISIBLE_SUFFIX_CHARS {
        return "****".to_string();
    }
    let suffix: String = value.chars().skip(count - VISIBLE_SUFFIX_CHARS).collect();
    format!("****{}", suffix)
}
