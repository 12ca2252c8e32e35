//! Process-wide cache of backend client handles keyed by identity fingerprint.
//!
//! Every fingerprint owns a slot with its own async mutex. The first caller to
//! find a slot empty moves the slot's lock guard into a spawned task that runs
//! the constructor; everyone else queues on the lock and sees the finished
//! handle. Waiters only await the task, so dropping a waiter never cancels a
//! construction that others depend on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::auth::{AuthError, Fingerprint};

/// Default upper bound on cached handles.
pub const DEFAULT_MAX_ENTRIES: usize = 256;

/// Default handle lifetime.
pub const DEFAULT_TTL_SECONDS: u64 = 3600;

struct Slot<H> {
    handle: Arc<AsyncMutex<Option<Arc<H>>>>,
    created_at: Mutex<Option<Instant>>,
    last_used: Mutex<Instant>,
}

impl<H> Slot<H> {
    fn new() -> Self {
        Self {
            handle: Arc::new(AsyncMutex::new(None)),
            created_at: Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *lock(&self.last_used)
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        lock(&self.created_at).is_some_and(|created| now.duration_since(created) >= ttl)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bounded, TTL-expiring, single-flight cache of `Arc<H>` handles.
pub struct ClientCache<H> {
    slots: Arc<Mutex<HashMap<Fingerprint, Arc<Slot<H>>>>>,
    max_entries: usize,
    ttl: Duration,
}

impl<H> ClientCache<H>
where
    H: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, Duration::from_secs(DEFAULT_TTL_SECONDS))
    }

    pub fn with_limits(max_entries: usize, ttl: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Return the handle for `fingerprint`, constructing it with `ctor` when
    /// absent or expired.
    ///
    /// Concurrent callers for the same fingerprint share one construction.
    /// A failed construction is reported to every waiter and is not cached.
    pub async fn get_or_create<F, Fut>(&self, fingerprint: &Fingerprint, ctor: F) -> Result<Arc<H>, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<H>, AuthError>> + Send + 'static,
    {
        let mut ctor = Some(ctor);
        loop {
            let slot = self.slot_for(fingerprint);
            let mut guard = slot.handle.clone().lock_owned().await;

            if let Some(handle) = guard.as_ref() {
                slot.touch();
                debug!(fingerprint = %fingerprint.short(), "Client cache hit");
                return Ok(handle.clone());
            }

            // The slot may have been evicted or failed while we waited; retry
            // against whatever the map holds now.
            if !self.is_current(fingerprint, &slot) {
                continue;
            }

            let Some(ctor) = ctor.take() else {
                return Err(AuthError::UpstreamUnavailable(
                    "client construction was abandoned".to_string(),
                ));
            };
            let fut = ctor();
            let slots = self.slots.clone();
            let key = fingerprint.clone();
            let task_slot = slot.clone();

            debug!(fingerprint = %fingerprint.short(), "Constructing backend client");
            return tokio::spawn(async move {
                match fut.await {
                    Ok(handle) => {
                        *guard = Some(handle.clone());
                        *lock(&task_slot.created_at) = Some(Instant::now());
                        task_slot.touch();
                        Ok(handle)
                    }
                    Err(e) => {
                        let mut map = lock(&slots);
                        if map.get(&key).is_some_and(|s| Arc::ptr_eq(s, &task_slot)) {
                            map.remove(&key);
                        }
                        drop(map);
                        drop(guard);
                        Err(e)
                    }
                }
            })
            .await
            .map_err(|e| AuthError::UpstreamUnavailable(format!("client construction failed: {}", e)))?;
        }
    }

    fn is_current(&self, fingerprint: &Fingerprint, slot: &Arc<Slot<H>>) -> bool {
        lock(&self.slots)
            .get(fingerprint)
            .is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Look up or insert the slot for `fingerprint`, dropping expired slots and
    /// evicting the least recently used one when full.
    fn slot_for(&self, fingerprint: &Fingerprint) -> Arc<Slot<H>> {
        let now = Instant::now();
        let mut map = lock(&self.slots);

        if let Some(slot) = map.get(fingerprint) {
            if !slot.is_expired(self.ttl, now) {
                return slot.clone();
            }
            debug!(fingerprint = %fingerprint.short(), "Client handle expired");
            map.remove(fingerprint);
        }

        while map.len() >= self.max_entries {
            let victim = map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used())
                .map(|(fp, _)| fp.clone());
            match victim {
                Some(fp) => {
                    info!(fingerprint = %fp.short(), "Evicting least recently used client");
                    map.remove(&fp);
                }
                None => break,
            }
        }

        let slot = Arc::new(Slot::new());
        map.insert(fingerprint.clone(), slot.clone());
        slot
    }

    /// Lifetime of a cached handle.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of entries, including constructions still in flight.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the entry for `fingerprint`. Handles already handed out stay valid.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        lock(&self.slots).remove(fingerprint).is_some()
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }

    /// Remove every entry older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = lock(&self.slots);
        let before = map.len();
        map.retain(|_, slot| !slot.is_expired(self.ttl, now));
        before - map.len()
    }
}

impl<H> Default for ClientCache<H>
where
    H: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Backend, Credential, Deployment};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fp(token: &str) -> Fingerprint {
        Fingerprint::derive(&Credential::bearer(token), Backend::IssueTracker, Deployment::Cloud).unwrap()
    }

    fn counting_ctor(
        counter: &Arc<AtomicUsize>,
        value: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<Arc<String>, AuthError>> + Send>> {
        let counter = counter.clone();
        move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(Arc::new(value.to_string()))
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_construction() {
        let cache = Arc::new(ClientCache::<String>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let key = fp("T1");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let counter = counter.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create(&key, counting_ctor(&counter, "client", Duration::from_millis(50)))
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_get_distinct_handles() {
        let cache = ClientCache::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let a = cache
            .get_or_create(&fp("A"), counting_ctor(&counter, "a", Duration::ZERO))
            .await
            .unwrap();
        let b = cache
            .get_or_create(&fp("B"), counting_ctor(&counter, "b", Duration::ZERO))
            .await
            .unwrap();
        let a_again = cache
            .get_or_create(&fp("A"), counting_ctor(&counter, "other", Duration::ZERO))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &a_again));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ClientCache::<String>::new();
        let key = fp("T1");

        let err = cache
            .get_or_create(&key, || async {
                Err::<Arc<String>, _>(AuthError::UpstreamUnavailable("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.is_empty());

        let counter = Arc::new(AtomicUsize::new(0));
        let handle = cache
            .get_or_create(&key, counting_ctor(&counter, "ok", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(handle.as_str(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_see_failure_then_retry_once() {
        let cache = Arc::new(ClientCache::<String>::new());
        let key = fp("T1");
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            let attempts = attempts.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create(&key, move || async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        if n == 0 {
                            Err(AuthError::UpstreamUnavailable("first attempt".to_string()))
                        } else {
                            Ok(Arc::new("second".to_string()))
                        }
                    })
                    .await
            }));
        }

        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(value) => assert_eq!(value.as_str(), "second"),
                Err(_) => failures += 1,
            }
        }
        assert_eq!(failures, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_rebuilds() {
        let cache = ClientCache::<String>::with_limits(8, Duration::from_millis(20));
        let counter = Arc::new(AtomicUsize::new(0));
        let key = fp("T1");

        let first = cache
            .get_or_create(&key, counting_ctor(&counter, "v1", Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = cache
            .get_or_create(&key, counting_ctor(&counter, "v2", Duration::ZERO))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.as_str(), "v1");
        assert_eq!(second.as_str(), "v2");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = ClientCache::<String>::with_limits(8, Duration::from_millis(20));
        let counter = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_create(&fp("A"), counting_ctor(&counter, "a", Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_handed_out_handles_alive() {
        let cache = ClientCache::<String>::with_limits(2, Duration::from_secs(60));
        let counter = Arc::new(AtomicUsize::new(0));

        let a = cache
            .get_or_create(&fp("A"), counting_ctor(&counter, "a", Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache
            .get_or_create(&fp("B"), counting_ctor(&counter, "b", Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch A so B becomes the least recently used.
        cache
            .get_or_create(&fp("A"), counting_ctor(&counter, "unused", Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache
            .get_or_create(&fp("C"), counting_ctor(&counter, "c", Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(a.as_str(), "a");

        let before = counter.load(Ordering::SeqCst);
        cache
            .get_or_create(&fp("A"), counting_ctor(&counter, "a2", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), before);

        cache
            .get_or_create(&fp("B"), counting_ctor(&counter, "b2", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_waiter_does_not_cancel_construction() {
        let cache = Arc::new(ClientCache::<String>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let key = fp("T1");

        let first = {
            let cache = cache.clone();
            let counter = counter.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create(&key, counting_ctor(&counter, "shared", Duration::from_millis(100)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        let handle = cache
            .get_or_create(&key, counting_ctor(&counter, "second", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(handle.as_str(), "shared");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = ClientCache::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let held = cache
            .get_or_create(&fp("A"), counting_ctor(&counter, "a", Duration::ZERO))
            .await
            .unwrap();
        cache
            .get_or_create(&fp("B"), counting_ctor(&counter, "b", Duration::ZERO))
            .await
            .unwrap();

        assert!(cache.invalidate(&fp("A")));
        assert!(!cache.invalidate(&fp("A")));
        assert_eq!(held.as_str(), "a");
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
