//! NewType wrappers for strong typing throughout the gateway.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a cloud ID where an OAuth client ID is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// OAuth 2.0 (3LO) client identifier registered with the Atlassian
    /// developer console.
    ///
    /// Not a secret; it is one half of the key under which the server's own
    /// token pair is persisted.
    OAuthClientId
);

newtype_string!(
    /// Atlassian Cloud site identifier (the `cloudid` returned by the
    /// accessible-resources endpoint).
    ///
    /// Used to build OAuth gateway URLs such as
    /// `https://api.atlassian.com/ex/jira/{cloud_id}`.
    CloudId
);
