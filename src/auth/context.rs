//! Per-invocation identity carrier.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::StatusCode;
use tracing::warn;

use crate::auth::fingerprint::{Backend, Fingerprint};
use crate::client::BackendClient;

/// Identities whose writes a backend has refused, remembered for `ttl`.
///
/// Owned by the identity resolver and shared with every context it builds, so
/// a 401/403 on one call makes later calls for the same fingerprint read-only.
#[derive(Debug)]
pub struct WriteDenials {
    ttl: Duration,
    denied: Mutex<HashMap<Fingerprint, Instant>>,
}

impl WriteDenials {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            denied: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, Instant>> {
        match self.denied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn deny(&self, fingerprint: &Fingerprint) {
        self.entries().insert(fingerprint.clone(), Instant::now());
    }

    /// Whether writes for `fingerprint` were refused within the last `ttl`.
    pub fn is_denied(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        let mut denied = self.entries();
        denied.retain(|_, at| now.duration_since(*at) < self.ttl);
        denied.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolved identity for one tool invocation.
///
/// Built by the identity resolver, handed to the tool dispatcher, and dropped
/// when the call ends. Client handles are shared with the client cache.
pub struct RequestContext {
    clients: BTreeMap<Backend, Arc<BackendClient>>,
    fingerprint: Fingerprint,
    /// Global read-only switch, or an earlier refused write, at resolution time.
    read_only: bool,
    /// Set once the backend refuses a write during this call.
    write_denied: AtomicBool,
    denials: Option<Arc<WriteDenials>>,
}

impl RequestContext {
    pub fn new(backend: Backend, client: Arc<BackendClient>, read_only: bool) -> Self {
        let fingerprint = client.fingerprint().clone();
        let mut clients = BTreeMap::new();
        clients.insert(backend, client);
        Self {
            clients,
            fingerprint,
            read_only,
            write_denied: AtomicBool::new(false),
            denials: None,
        }
    }

    /// Report refused writes to a registry that outlives this call.
    pub fn with_denials(mut self, denials: Arc<WriteDenials>) -> Self {
        self.denials = Some(denials);
        self
    }

    /// Attach the handle for another backend resolved for the same call.
    pub fn with_client(mut self, backend: Backend, client: Arc<BackendClient>) -> Self {
        self.clients.insert(backend, client);
        self
    }

    pub fn client(&self, backend: Backend) -> Option<&Arc<BackendClient>> {
        self.clients.get(&backend)
    }

    /// Fingerprint of the identity the context was resolved for.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Whether write tools must be refused for this call.
    pub fn read_only(&self) -> bool {
        self.read_only || self.write_denied.load(Ordering::SeqCst)
    }

    /// Record the status of a backend write. 401 and 403 make this identity
    /// read-only for the rest of the call and, through the shared registry,
    /// for later calls.
    pub fn record_write_status(&self, status: StatusCode) {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(
                fingerprint = %self.fingerprint.short(),
                status = %status,
                "Backend refused write; treating identity as read-only"
            );
            self.write_denied.store(true, Ordering::SeqCst);
            if let Some(denials) = &self.denials {
                denials.deny(&self.fingerprint);
            }
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("backends", &self.clients.keys().collect::<Vec<_>>())
            .field("fingerprint", &self.fingerprint.short())
            .field("read_only", &self.read_only())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, Deployment};
    use crate::client::ClientSpec;
    use crate::config::NetworkSettings;

    fn client(backend: Backend, token: &str) -> Arc<BackendClient> {
        let credential = Credential::bearer(token);
        let fingerprint = Fingerprint::derive(&credential, backend, Deployment::Cloud).unwrap();
        Arc::new(
            BackendClient::from_spec(&ClientSpec {
                backend,
                deployment: Deployment::Cloud,
                fingerprint,
                base_url: "https://acme.atlassian.net".to_string(),
                via_gateway: false,
                credential,
                network: NetworkSettings::default(),
                per_request: true,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_global_read_only() {
        let ctx = RequestContext::new(Backend::IssueTracker, client(Backend::IssueTracker, "t"), true);
        assert!(ctx.read_only());
    }

    #[test]
    fn test_write_denial_makes_read_only() {
        let ctx = RequestContext::new(Backend::IssueTracker, client(Backend::IssueTracker, "t"), false);
        ctx.record_write_status(StatusCode::CREATED);
        assert!(!ctx.read_only());
        ctx.record_write_status(StatusCode::NOT_FOUND);
        assert!(!ctx.read_only());
        ctx.record_write_status(StatusCode::FORBIDDEN);
        assert!(ctx.read_only());
    }

    #[test]
    fn test_refused_write_is_remembered_for_the_identity() {
        let denials = Arc::new(WriteDenials::new(Duration::from_secs(60)));
        let jira = client(Backend::IssueTracker, "t");
        let other = client(Backend::IssueTracker, "u");

        let ctx = RequestContext::new(Backend::IssueTracker, jira.clone(), false)
            .with_denials(denials.clone());
        ctx.record_write_status(StatusCode::UNAUTHORIZED);

        assert!(denials.is_denied(jira.fingerprint()));
        assert!(!denials.is_denied(other.fingerprint()));
    }

    #[test]
    fn test_write_denials_expire() {
        let denials = WriteDenials::new(Duration::from_millis(20));
        let jira = client(Backend::IssueTracker, "t");
        denials.deny(jira.fingerprint());
        assert!(denials.is_denied(jira.fingerprint()));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!denials.is_denied(jira.fingerprint()));
        assert!(denials.is_empty());
    }

    #[test]
    fn test_clients_by_backend() {
        let jira = client(Backend::IssueTracker, "t");
        let ctx = RequestContext::new(Backend::IssueTracker, jira.clone(), false)
            .with_client(Backend::Wiki, client(Backend::Wiki, "t"));
        assert!(Arc::ptr_eq(ctx.client(Backend::IssueTracker).unwrap(), &jira));
        assert!(ctx.client(Backend::Wiki).is_some());
        assert_eq!(ctx.fingerprint(), jira.fingerprint());
        assert!(!format!("{:?}", ctx).contains(jira.fingerprint().as_str()));
    }
}
