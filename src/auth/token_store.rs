//! The server's own OAuth token pairs and their refresh lifecycle.
//!
//! Each [`TokenKey`] has its own async mutex. Whoever finds the token inside the
//! refresh margin spawns the refresh with the lock guard moved into the task, so
//! concurrent callers queue on the lock and pick up the refreshed record, and a
//! caller that goes away does not abort a refresh others are waiting for.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::auth::credential::mask_secret;
use crate::auth::error::AuthError;
use crate::auth::refresher::TokenRefresher;
use crate::auth::vault::TokenVault;
use crate::config::OAuthClientSettings;
use crate::types::{CloudId, OAuthClientId};

/// Default window before expiry in which a token is refreshed.
pub const DEFAULT_REFRESH_MARGIN_SECONDS: u64 = 60;

/// Default bound on a single refresh exchange.
pub const DEFAULT_REFRESH_TIMEOUT_SECONDS: u64 = 30;

/// Identifies one persisted token pair: an OAuth application on one site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub client_id: OAuthClientId,
    pub cloud_id: CloudId,
}

impl TokenKey {
    pub fn new(client_id: OAuthClientId, cloud_id: CloudId) -> Self {
        Self { client_id, cloud_id }
    }

    /// Key used inside the vault file.
    pub fn storage_key(&self) -> String {
        format!("oauth-{}:{}", self.client_id, self.cloud_id)
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

// `SecretString` deserializes through secrecy's serde support but
// deliberately has no `Serialize`; the vault file is the one place it is
// written out.
fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

fn serialize_option_secret<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// A persisted OAuth token pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: SecretString,
    #[serde(default, serialize_with = "serialize_option_secret")]
    pub refresh_token: Option<SecretString>,
    /// `None` means the token does not expire.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenRecord {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: refresh_token.map(|t| SecretString::new(t.to_string())),
            expires_at,
            scope: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at.is_some_and(|at| at - now <= margin)
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &mask_secret(self.access_token.expose_secret()))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|t| mask_secret(t.expose_secret())),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Lifecycle state of a stored token pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    /// Inside the refresh margin, or a previous refresh failed transiently.
    Expiring,
    /// A refresh is in flight.
    Refreshing,
    /// Refresh was rejected; stays here until [`TokenStore::store`].
    Invalid,
}

#[derive(Default)]
struct KeyEntry {
    loaded: bool,
    record: Option<TokenRecord>,
    invalid: bool,
}

#[derive(Default)]
struct KeySlot {
    entry: Arc<AsyncMutex<KeyEntry>>,
    refreshing: AtomicBool,
    /// Bumped each time a new record is installed.
    generation: AtomicU64,
}

/// Clears the `refreshing` flag when the refresh task ends, however it ends.
struct RefreshingFlag(Arc<KeySlot>);

impl RefreshingFlag {
    fn raise(slot: Arc<KeySlot>) -> Self {
        slot.refreshing.store(true, Ordering::SeqCst);
        Self(slot)
    }
}

impl Drop for RefreshingFlag {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::SeqCst);
    }
}

/// Holds and refreshes the fallback OAuth token pairs.
pub struct TokenStore {
    vault: Arc<dyn TokenVault>,
    refresher: Arc<dyn TokenRefresher>,
    clients: HashMap<TokenKey, OAuthClientSettings>,
    slots: Mutex<HashMap<TokenKey, Arc<KeySlot>>>,
    margin: Duration,
    refresh_timeout: Duration,
}

impl TokenStore {
    pub fn new(vault: Arc<dyn TokenVault>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            vault,
            refresher,
            clients: HashMap::new(),
            slots: Mutex::new(HashMap::new()),
            margin: Duration::from_secs(DEFAULT_REFRESH_MARGIN_SECONDS),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECONDS),
        }
    }

    /// Register the OAuth application whose tokens this store refreshes.
    pub fn with_client(mut self, client: OAuthClientSettings) -> Self {
        self.clients.insert(client.token_key(), client);
        self
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    fn slot(&self, key: &TokenKey) -> Arc<KeySlot> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(key.clone()).or_default().clone()
    }

    fn client(&self, key: &TokenKey) -> Result<&OAuthClientSettings, AuthError> {
        self.clients.get(key).ok_or_else(|| {
            AuthError::NoAuthenticationConfigured(format!("no OAuth application registered for {}", key))
        })
    }

    fn ensure_loaded(&self, entry: &mut KeyEntry, key: &TokenKey) -> Result<(), AuthError> {
        if entry.loaded {
            return Ok(());
        }
        let record = self.vault.load(key).map_err(|e| {
            AuthError::NoAuthenticationConfigured(format!("token vault unreadable for {}: {:#}", key, e))
        })?;
        entry.record = record;
        entry.loaded = true;
        Ok(())
    }

    /// Return an access token that is valid beyond the refresh margin,
    /// refreshing it first when needed.
    pub async fn get_valid_access_token(&self, key: &TokenKey) -> Result<SecretString, AuthError> {
        let client = self.client(key)?.clone();
        let slot = self.slot(key);
        let mut guard = slot.entry.clone().lock_owned().await;
        self.ensure_loaded(&mut guard, key)?;

        if guard.invalid {
            return Err(unrefreshable(key));
        }
        let Some(record) = guard.record.clone() else {
            return Err(AuthError::NoAuthenticationConfigured(format!(
                "no stored OAuth token for {}; complete the OAuth setup first",
                key
            )));
        };

        let now = Utc::now();
        if !record.expires_within(self.margin, now) {
            return Ok(record.access_token);
        }

        if record.refresh_token.is_none() {
            if !record.is_expired(now) {
                return Ok(record.access_token);
            }
            warn!(key = %key, "OAuth token expired and no refresh token is stored");
            guard.invalid = true;
            return Err(unrefreshable(key));
        }

        debug!(key = %key, "OAuth token inside refresh margin");
        let refreshed = self.spawn_refresh(slot, guard, key.clone(), client).await?;
        Ok(refreshed.access_token)
    }

    /// Force a refresh of the stored token pair.
    ///
    /// Callers that queued behind a refresh which completed while they waited
    /// get that refresh's record instead of refreshing again.
    pub async fn refresh(&self, key: &TokenKey) -> Result<TokenRecord, AuthError> {
        let client = self.client(key)?.clone();
        let slot = self.slot(key);
        let seen = slot.generation.load(Ordering::SeqCst);
        let mut guard = slot.entry.clone().lock_owned().await;
        self.ensure_loaded(&mut guard, key)?;

        if guard.invalid {
            return Err(unrefreshable(key));
        }
        if slot.generation.load(Ordering::SeqCst) != seen
            && let Some(record) = guard.record.clone()
        {
            return Ok(record);
        }
        if guard.record.is_none() {
            return Err(AuthError::NoAuthenticationConfigured(format!(
                "no stored OAuth token for {}",
                key
            )));
        }

        self.spawn_refresh(slot, guard, key.clone(), client).await
    }

    /// Current lifecycle state, or `None` when nothing is stored for `key`.
    pub async fn state(&self, key: &TokenKey) -> Option<TokenState> {
        let slot = self.slot(key);
        if slot.refreshing.load(Ordering::SeqCst) {
            return Some(TokenState::Refreshing);
        }
        let mut guard = slot.entry.lock().await;
        self.ensure_loaded(&mut guard, key).ok()?;

        if guard.invalid {
            return Some(TokenState::Invalid);
        }
        let record = guard.record.as_ref()?;
        let now = Utc::now();
        let state = if record.refresh_token.is_none() && record.is_expired(now) {
            TokenState::Invalid
        } else if record.expires_within(self.margin, now) {
            TokenState::Expiring
        } else {
            TokenState::Valid
        };
        Some(state)
    }

    /// Install a token pair obtained outside the store (initial setup or
    /// re-authorization). Clears the `Invalid` state.
    pub async fn store(&self, key: &TokenKey, record: TokenRecord) -> anyhow::Result<()> {
        let slot = self.slot(key);
        let mut guard = slot.entry.lock().await;
        self.vault.save(key, &record)?;
        guard.record = Some(record);
        guard.loaded = true;
        guard.invalid = false;
        slot.generation.fetch_add(1, Ordering::SeqCst);
        info!(key = %key, "Stored OAuth token");
        Ok(())
    }

    async fn spawn_refresh(
        &self,
        slot: Arc<KeySlot>,
        guard: OwnedMutexGuard<KeyEntry>,
        key: TokenKey,
        client: OAuthClientSettings,
    ) -> Result<TokenRecord, AuthError> {
        let flag = RefreshingFlag::raise(slot.clone());
        let task = RefreshTask {
            refresher: self.refresher.clone(),
            vault: self.vault.clone(),
            timeout: self.refresh_timeout,
            slot,
            key,
            client,
        };
        tokio::spawn(async move {
            let _flag = flag;
            task.run(guard).await
        })
        .await
        .map_err(|e| AuthError::UpstreamUnavailable(format!("token refresh task failed: {}", e)))?
    }
}

/// Everything the spawned refresh owns.
struct RefreshTask {
    refresher: Arc<dyn TokenRefresher>,
    vault: Arc<dyn TokenVault>,
    timeout: Duration,
    slot: Arc<KeySlot>,
    key: TokenKey,
    client: OAuthClientSettings,
}

impl RefreshTask {
    async fn run(self, mut guard: OwnedMutexGuard<KeyEntry>) -> Result<TokenRecord, AuthError> {
        let Some(current) = guard.record.clone() else {
            return Err(AuthError::NoAuthenticationConfigured(format!(
                "no stored OAuth token for {}",
                self.key
            )));
        };
        let Some(refresh_token) = current.refresh_token.clone() else {
            guard.invalid = true;
            return Err(unrefreshable(&self.key));
        };

        info!(key = %self.key, "Refreshing OAuth token");
        let outcome =
            tokio::time::timeout(self.timeout, self.refresher.refresh(&self.client, &refresh_token)).await;

        let tokens = match outcome {
            Err(_) => {
                warn!(key = %self.key, timeout = ?self.timeout, "OAuth token refresh timed out");
                return Err(AuthError::UpstreamUnavailable(format!(
                    "token refresh timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!(key = %self.key, error = %e, "OAuth token refresh failed transiently");
                return Err(e);
            }
            Ok(Err(e)) => {
                error!(key = %self.key, error = %e, "OAuth refresh token rejected");
                guard.invalid = true;
                return Err(unrefreshable(&self.key));
            }
            Ok(Ok(tokens)) => tokens,
        };

        let record = TokenRecord {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(Some(refresh_token)),
            expires_at: tokens
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scope: tokens.scope.or(current.scope),
        };

        // The old refresh token may already be revoked by rotation, so the new
        // pair is kept in memory even when persisting fails.
        guard.record = Some(record.clone());
        guard.invalid = false;
        self.slot.generation.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.vault.save(&self.key, &record) {
            error!(key = %self.key, error = %e, "Failed to persist refreshed OAuth token");
            return Err(AuthError::UpstreamUnavailable(format!(
                "refreshed token for {} could not be persisted",
                self.key
            )));
        }

        info!(key = %self.key, expires_at = ?record.expires_at, "OAuth token refreshed");
        Ok(record)
    }
}

fn unrefreshable(key: &TokenKey) -> AuthError {
    AuthError::AuthenticationExpiredUnrefreshable(format!(
        "OAuth token for {} is no longer valid; re-authorize the application",
        key
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{CountingRefresher, MemoryVault, oauth_client};

    fn store_with(vault: Arc<MemoryVault>, refresher: Arc<CountingRefresher>) -> (TokenStore, TokenKey) {
        let client = oauth_client();
        let key = client.token_key();
        (TokenStore::new(vault, refresher).with_client(client), key)
    }

    fn expiring_in(secs: i64, refresh: Option<&str>) -> TokenRecord {
        TokenRecord::new("old-access", refresh, Some(Utc::now() + chrono::Duration::seconds(secs)))
    }

    #[test]
    fn test_token_key_storage_key() {
        let key = TokenKey::new(OAuthClientId::new("abc"), CloudId::new("site-1"));
        assert_eq!(key.storage_key(), "oauth-abc:site-1");
        assert_eq!(key.to_string(), "oauth-abc:site-1");
    }

    #[test]
    fn test_record_debug_is_redacted() {
        let record = TokenRecord::new("abcdefgh12345678", Some("zyxwvuts87654321"), None);
        let debug = format!("{:?}", record);
        assert!(!debug.contains("abcdefgh1234"));
        assert!(!debug.contains("zyxwvuts8765"));
        assert!(debug.contains("****5678"));
    }

    #[test]
    fn test_record_serde_keeps_secrets() {
        let record = TokenRecord::new("a-token", Some("r-token"), None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["access_token"], "a-token");
        assert_eq!(json["refresh_token"], "r-token");

        let back: TokenRecord = serde_json::from_value(serde_json::json!({
            "access_token": "x"
        }))
        .unwrap();
        assert!(back.refresh_token.is_none());
        assert!(back.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_fresh_token_served_without_refresh() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::succeeding("new-access"));
        let (store, key) = store_with(vault.clone(), refresher.clone());
        vault.put(&key, expiring_in(3600, Some("r1")));

        let token = store.get_valid_access_token(&key).await.unwrap();
        assert_eq!(token.expose_secret(), "old-access");
        assert_eq!(refresher.calls(), 0);
        assert_eq!(store.state(&key).await, Some(TokenState::Valid));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_refresh_once() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(
            CountingRefresher::succeeding("new-access").with_delay(Duration::from_millis(100)),
        );
        let (store, key) = store_with(vault.clone(), refresher.clone());
        let store = Arc::new(store);
        vault.put(&key, expiring_in(30, Some("r1")));
        assert_eq!(store.state(&key).await, Some(TokenState::Expiring));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.get_valid_access_token(&key).await
            }));
        }
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.expose_secret(), "new-access");
        }

        assert_eq!(refresher.calls(), 1);
        assert_eq!(store.state(&key).await, Some(TokenState::Valid));
        let persisted = vault.get(&key).unwrap();
        assert_eq!(persisted.access_token.expose_secret(), "new-access");
    }

    #[tokio::test]
    async fn test_rotation_replaces_refresh_token_and_absence_keeps_it() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::succeeding("a2").rotating("r2"));
        let (store, key) = store_with(vault.clone(), refresher);
        vault.put(&key, expiring_in(10, Some("r1")));
        store.get_valid_access_token(&key).await.unwrap();
        let rotated = vault.get(&key).unwrap();
        assert_eq!(rotated.refresh_token.unwrap().expose_secret(), "r2");

        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::succeeding("a2"));
        let (store, key) = store_with(vault.clone(), refresher);
        vault.put(&key, expiring_in(10, Some("r1")));
        store.get_valid_access_token(&key).await.unwrap();
        let kept = vault.get(&key).unwrap();
        assert_eq!(kept.refresh_token.unwrap().expose_secret(), "r1");
    }

    #[tokio::test]
    async fn test_transient_failure_stays_expiring() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::failing(AuthError::UpstreamUnavailable(
            "connection reset".to_string(),
        )));
        let (store, key) = store_with(vault.clone(), refresher.clone());
        vault.put(&key, expiring_in(30, Some("r1")));

        let err = store.get_valid_access_token(&key).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.state(&key).await, Some(TokenState::Expiring));

        // A later attempt tries again.
        let _ = store.get_valid_access_token(&key).await;
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_terminal_until_store() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::failing(
            AuthError::AuthenticationExpiredUnrefreshable("invalid_grant".to_string()),
        ));
        let (store, key) = store_with(vault.clone(), refresher.clone());
        vault.put(&key, expiring_in(-5, Some("r1")));

        let err = store.get_valid_access_token(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationExpiredUnrefreshable(_)));
        assert_eq!(store.state(&key).await, Some(TokenState::Invalid));

        let err = store.get_valid_access_token(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationExpiredUnrefreshable(_)));
        assert_eq!(refresher.calls(), 1);

        store
            .store(&key, TokenRecord::new("fresh", Some("r9"), None))
            .await
            .unwrap();
        assert_eq!(store.state(&key).await, Some(TokenState::Valid));
        let token = store.get_valid_access_token(&key).await.unwrap();
        assert_eq!(token.expose_secret(), "fresh");
    }

    #[tokio::test]
    async fn test_no_refresh_token_served_until_expiry() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::succeeding("unused"));
        let (store, key) = store_with(vault.clone(), refresher.clone());

        vault.put(&key, expiring_in(20, None));
        let token = store.get_valid_access_token(&key).await.unwrap();
        assert_eq!(token.expose_secret(), "old-access");

        store.store(&key, expiring_in(-1, None)).await.unwrap();
        let err = store.get_valid_access_token(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationExpiredUnrefreshable(_)));
        assert_eq!(store.state(&key).await, Some(TokenState::Invalid));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forced_refresh_is_idempotent_for_queued_callers() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(
            CountingRefresher::succeeding("forced").with_delay(Duration::from_millis(250)),
        );
        let (store, key) = store_with(vault.clone(), refresher.clone());
        let store = Arc::new(store);
        vault.put(&key, expiring_in(3600, Some("r1")));
        // Load the record so every caller observes the same generation.
        store.get_valid_access_token(&key).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.refresh(&key).await }));
        }
        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            assert_eq!(record.access_token.expose_secret(), "forced");
        }
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_refresh_sees_invalidation() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::succeeding("unused"));
        let (store, key) = store_with(vault.clone(), refresher.clone());
        let store = Arc::new(store);
        vault.put(&key, expiring_in(3600, Some("r1")));
        store.get_valid_access_token(&key).await.unwrap();

        // Hold the entry so the refresh queues after recording its generation.
        let slot = store.slot(&key);
        let mut guard = slot.entry.lock().await;
        let queued = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.refresh(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        guard.invalid = true;
        slot.generation.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationExpiredUnrefreshable(_)));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_configured() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(CountingRefresher::succeeding("x"));
        let store = TokenStore::new(vault, refresher);
        let key = TokenKey::new(OAuthClientId::new("nobody"), CloudId::new("nowhere"));

        let err = store.get_valid_access_token(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::NoAuthenticationConfigured(_)));
        assert_eq!(store.state(&key).await, None);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_configured() {
        let (store, key) = store_with(
            Arc::new(MemoryVault::default()),
            Arc::new(CountingRefresher::succeeding("x")),
        );
        let err = store.get_valid_access_token(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::NoAuthenticationConfigured(_)));
    }

    #[tokio::test]
    async fn test_refresh_timeout_is_retryable() {
        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(
            CountingRefresher::succeeding("late").with_delay(Duration::from_millis(500)),
        );
        let client = oauth_client();
        let key = client.token_key();
        let store = TokenStore::new(vault.clone(), refresher)
            .with_client(client)
            .with_refresh_timeout(Duration::from_millis(50));
        vault.put(&key, expiring_in(30, Some("r1")));

        let err = store.get_valid_access_token(&key).await.unwrap_err();
        assert!(matches!(err, AuthError::UpstreamUnavailable(_)));
        assert_eq!(store.state(&key).await, Some(TokenState::Expiring));
    }
}
