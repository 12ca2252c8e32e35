//! In-memory collaborators shared by the auth and dispatch tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use secrecy::SecretString;

use crate::auth::error::AuthError;
use crate::auth::refresher::{RefreshedTokens, TokenRefresher};
use crate::auth::token_store::{TokenKey, TokenRecord};
use crate::auth::vault::TokenVault;
use crate::client::{BackendClient, ClientFactory, ClientSpec};
use crate::config::OAuthClientSettings;
use crate::types::{CloudId, OAuthClientId};

pub fn oauth_client() -> OAuthClientSettings {
    OAuthClientSettings {
        client_id: OAuthClientId::new("client-1"),
        client_secret: SecretString::new("client-secret".to_string()),
        redirect_uri: "http://localhost:8080/callback".to_string(),
        scope: "read:jira-work write:jira-work offline_access".to_string(),
        cloud_id: CloudId::new("cloud-1"),
    }
}

#[derive(Default)]
pub struct MemoryVault {
    records: Mutex<HashMap<String, TokenRecord>>,
}

impl MemoryVault {
    pub fn put(&self, key: &TokenKey, record: TokenRecord) {
        self.records.lock().unwrap().insert(key.storage_key(), record);
    }

    pub fn get(&self, key: &TokenKey) -> Option<TokenRecord> {
        self.records.lock().unwrap().get(&key.storage_key()).cloned()
    }
}

impl TokenVault for MemoryVault {
    fn load(&self, key: &TokenKey) -> anyhow::Result<Option<TokenRecord>> {
        Ok(self.get(key))
    }

    fn save(&self, key: &TokenKey, record: &TokenRecord) -> anyhow::Result<()> {
        self.put(key, record.clone());
        Ok(())
    }

    fn delete(&self, key: &TokenKey) -> anyhow::Result<()> {
        self.records.lock().unwrap().remove(&key.storage_key());
        Ok(())
    }
}

/// Refresher returning a fixed outcome and counting exchanges.
pub struct CountingRefresher {
    calls: AtomicUsize,
    outcome: Result<RefreshedTokens, AuthError>,
    delay: Duration,
}

impl CountingRefresher {
    pub fn succeeding(access_token: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome: Ok(RefreshedTokens::new(access_token, Some(3600))),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(error: AuthError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome: Err(error),
            delay: Duration::ZERO,
        }
    }

    pub fn rotating(mut self, refresh_token: &str) -> Self {
        if let Ok(tokens) = self.outcome {
            self.outcome = Ok(tokens.with_refresh_token(refresh_token));
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenRefresher for CountingRefresher {
    fn refresh<'a>(
        &'a self,
        _client: &'a OAuthClientSettings,
        _refresh_token: &'a SecretString,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedTokens, AuthError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcome.clone();
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        })
    }
}

/// Factory that builds real, unvalidated clients and counts constructions.
#[derive(Default)]
pub struct CountingFactory {
    builds: AtomicUsize,
    delay: Duration,
}

impl CountingFactory {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            builds: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ClientFactory for CountingFactory {
    fn build(
        &self,
        spec: ClientSpec,
    ) -> Pin<Box<dyn Future<Output = Result<BackendClient, AuthError>> + Send + 'static>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            BackendClient::from_spec(&spec)
        })
    }
}
