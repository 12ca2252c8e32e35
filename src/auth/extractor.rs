//! Credential extraction from inbound request metadata.

use http::HeaderMap;
use http::header::AUTHORIZATION;

use crate::auth::credential::{Credential, mask_secret};
use crate::auth::error::AuthError;

/// Longest scheme name echoed back in an error message.
const MAX_ECHOED_SCHEME_LEN: usize = 16;

/// Parses `Authorization` headers into a [`Credential`].
///
/// Extraction is pure: no I/O, no configuration lookups. An absent header is a
/// valid input and yields [`Credential::None`].
pub struct CredentialExtractor;

impl CredentialExtractor {
    /// Extract a credential from a full header map.
    pub fn from_headers(headers: &HeaderMap) -> Result<Credential, AuthError> {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return Ok(Credential::None);
        };
        let value = value.to_str().map_err(|_| {
            AuthError::InvalidCredentialFormat(
                "Authorization header contains non-ASCII characters".to_string(),
            )
        })?;
        Self::from_authorization(Some(value))
    }

    /// Extract a credential from a raw `Authorization` header value.
    ///
    /// - `Bearer <token>` → [`Credential::BearerOAuth`]
    /// - `Token <token>` → [`Credential::PersonalAccessToken`]
    /// - absent → [`Credential::None`]
    pub fn from_authorization(value: Option<&str>) -> Result<Credential, AuthError> {
        let Some(value) = value else {
            return Ok(Credential::None);
        };

        let value = value.trim();
        if value.is_empty() {
            return Err(AuthError::InvalidCredentialFormat(
                "Authorization header is empty".to_string(),
            ));
        }

        let Some((scheme, token)) = value.split_once(char::is_whitespace) else {
            return Err(AuthError::InvalidCredentialFormat(format!(
                "Authorization header has no scheme (value {})",
                mask_secret(value)
            )));
        };
        let token = token.trim();

        if scheme.eq_ignore_ascii_case("Bearer") {
            if token.is_empty() {
                return Err(AuthError::InvalidCredentialFormat(
                    "empty Bearer token".to_string(),
                ));
            }
            Ok(Credential::bearer(token))
        } else if scheme.eq_ignore_ascii_case("Token") {
            if token.is_empty() {
                return Err(AuthError::InvalidCredentialFormat(
                    "empty personal access token".to_string(),
                ));
            }
            Ok(Credential::personal_access_token(token))
        } else {
            Err(AuthError::InvalidCredentialFormat(format!(
                "unsupported scheme '{}'; only 'Bearer <OAuthToken>' or 'Token <PAT>' are accepted",
                echo_scheme(scheme)
            )))
        }
    }
}

/// Scheme names are echoed only when they look like a scheme; anything else
/// could be a pasted secret.
fn echo_scheme(scheme: &str) -> String {
    if scheme.len() <= MAX_ECHOED_SCHEME_LEN && scheme.chars().all(|c| c.is_ascii_alphabetic()) {
        scheme.to_string()
    } else {
        mask_secret(scheme)
    }
}
