//! Forwards and the sockets bridged through them

use burrow_proto::{strip_access_suffix, Access, ForwardRequestId, ScriptInjection};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A private service endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

#[derive(Debug, Default)]
struct Sockets {
    open: HashMap<u64, CancellationToken>,
    /// Set by `terminate_all`; no new sockets are admitted
    draining: bool,
}

/// Bridged connections of one forward
#[derive(Debug, Default)]
pub struct SocketSet {
    sockets: Mutex<Sockets>,
    next_id: AtomicU64,
    idle: Notify,
}

impl SocketSet {
    fn lock(&self) -> MutexGuard<'_, Sockets> {
        self.sockets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a new socket. Its token is cancelled by [`SocketSet::terminate_all`].
    ///
    /// Returns `None` once the forward is being torn down.
    pub fn register(&self) -> Option<(u64, CancellationToken)> {
        let mut sockets = self.lock();
        if sockets.draining {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        sockets.open.insert(id, token.clone());
        Some((id, token))
    }

    pub fn remove(&self, id: u64) {
        let mut sockets = self.lock();
        sockets.open.remove(&id);
        if sockets.open.is_empty() {
            self.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// Close every bridged socket and refuse new ones
    pub fn terminate_all(&self) -> usize {
        let tokens: Vec<_> = {
            let mut sockets = self.lock();
            sockets.draining = true;
            sockets.open.values().cloned().collect()
        };
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Admit sockets again after a tear-down that did not go through
    pub fn reopen(&self) {
        self.lock().draining = false;
    }

    /// Resolves once every bridged socket has been released
    pub async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.is_empty() {
                return;
            }
            idle.await;
        }
    }
}

/// One exposed service port
#[derive(Debug)]
pub struct Forward {
    pub service: ServiceIdentity,
    pub request_id: ForwardRequestId,
    pub inject: Vec<ScriptInjection>,
    sockets: SocketSet,
}

impl Forward {
    pub fn new(service: ServiceIdentity, access: Access) -> Self {
        let request_id = ForwardRequestId::for_service(&service.name, service.port, access);
        Self {
            service,
            request_id,
            inject: Vec::new(),
            sockets: SocketSet::default(),
        }
    }

    pub fn with_inject(mut self, inject: Vec<ScriptInjection>) -> Self {
        self.inject = inject;
        self
    }

    /// Reconciliation key, without the access suffix
    pub fn key(&self) -> &str {
        self.request_id.key()
    }

    pub fn access(&self) -> Access {
        self.request_id.access()
    }

    /// Tunnel path registered with the gateway, `/<forwardRequestId>`
    pub fn external_name(&self) -> String {
        self.request_id.path()
    }

    pub fn sockets(&self) -> &SocketSet {
        &self.sockets
    }
}

/// Forwards keyed by forward request id
#[derive(Debug, Clone, Default)]
pub struct ForwardSet {
    forwards: BTreeMap<String, Arc<Forward>>,
}

impl ForwardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a forward, replacing any with the same key
    pub fn insert(&mut self, forward: impl Into<Arc<Forward>>) {
        let forward = forward.into();
        if let Some(old) = self.forwards.insert(forward.key().to_string(), forward) {
            debug!("Replaced forward {}", old.request_id);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<Forward>> {
        self.forwards.remove(strip_access_suffix(key))
    }

    /// Look up by key, path or wire id
    pub fn get(&self, id: &str) -> Option<&Arc<Forward>> {
        self.forwards.get(strip_access_suffix(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Forward>> {
        self.forwards.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.forwards.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }
}

impl FromIterator<Forward> for ForwardSet {
    fn from_iter<I: IntoIterator<Item = Forward>>(iter: I) -> Self {
        let mut set = ForwardSet::new();
        for forward in iter {
            set.insert(forward);
        }
        set
    }
}

impl FromIterator<Arc<Forward>> for ForwardSet {
    fn from_iter<I: IntoIterator<Item = Arc<Forward>>>(iter: I) -> Self {
        let mut set = ForwardSet::new();
        for forward in iter {
            set.insert(forward);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_ids() {
        let forward = Forward::new(ServiceIdentity::new("web", "10.0.0.5", 80), Access::Private);
        assert_eq!(forward.key(), "web-80");
        assert_eq!(forward.external_name(), "/web-80#access=private");
        assert_eq!(forward.service.address(), "10.0.0.5:80");
    }

    #[test]
    fn test_lookup_ignores_access_suffix() {
        let set: ForwardSet = [Forward::new(
            ServiceIdentity::new("db", "db.internal", 5432),
            Access::Private,
        )]
        .into_iter()
        .collect();

        assert!(set.contains("db-5432"));
        assert!(set.contains("/db-5432#access=private"));
        assert!(!set.contains("db-5433"));
    }

    #[test]
    fn test_terminate_all_cancels_and_drains() {
        let sockets = SocketSet::default();
        let (id_a, a) = sockets.register().unwrap();
        let (id_b, b) = sockets.register().unwrap();
        sockets.remove(id_b);

        assert_eq!(sockets.terminate_all(), 1);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(sockets.is_draining());

        // Sockets leave the set once their bridge has shut them down
        assert_eq!(sockets.len(), 1);
        sockets.remove(id_a);
        assert!(sockets.is_empty());
    }

    #[test]
    fn test_draining_set_refuses_new_sockets() {
        let sockets = SocketSet::default();
        sockets.terminate_all();
        assert!(sockets.register().is_none());

        sockets.reopen();
        assert!(sockets.register().is_some());
    }

    #[tokio::test]
    async fn test_drained_waits_for_last_socket() {
        let sockets = Arc::new(SocketSet::default());
        let (id, token) = sockets.register().unwrap();

        let bridge = {
            let sockets = sockets.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                sockets.remove(id);
            })
        };

        sockets.terminate_all();
        tokio::time::timeout(std::time::Duration::from_secs(5), sockets.drained())
            .await
            .expect("sockets not drained");
        bridge.await.unwrap();
        SocketSet::default().drained().await;
    }
}
