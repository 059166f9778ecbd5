//! Registry of active tunnels, keyed by hostname
//!
//! Each entry carries a transaction token and a watch channel. The token lets
//! a control connection remove only the entries it still owns; the watcher
//! lets in-flight bridges notice when their tunnel goes away, whether by an
//! explicit delete or by a newer `set` for the same hostname.

use burrow_inject::RuleSet;
use burrow_proto::{Access, ForwardRequestId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::target::TunnelTarget;

/// Identifies one `set` of a hostname
pub type TxToken = u64;

/// A tunnel reachable through the gateway
pub struct ActiveTunnel {
    pub hostname: String,
    /// Raw Ed25519 key of the owning agent
    pub public_key: Vec<u8>,
    pub public_key_thumbprint: String,
    pub access: Access,
    pub client_id: String,
    pub forward_request_id: ForwardRequestId,
    /// Injection rules registered with the forward
    pub inject: RuleSet,
    pub target: Arc<dyn TunnelTarget>,
}

impl std::fmt::Debug for ActiveTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTunnel")
            .field("hostname", &self.hostname)
            .field("thumbprint", &self.public_key_thumbprint)
            .field("access", &self.access)
            .field("client_id", &self.client_id)
            .field("forward", &self.forward_request_id.key())
            .field("target", &self.target.describe())
            .finish()
    }
}

/// Resolves once the watched entry is removed
#[derive(Debug, Clone)]
pub struct TunnelWatcher {
    rx: watch::Receiver<bool>,
}

impl TunnelWatcher {
    pub async fn deleted(&self) {
        let mut rx = self.rx.clone();
        // A dropped sender means the registry itself is gone
        let _ = rx.wait_for(|deleted| *deleted).await;
    }

    pub fn is_deleted(&self) -> bool {
        *self.rx.borrow()
    }
}

struct Entry {
    tunnel: Arc<ActiveTunnel>,
    tx_token: TxToken,
    deleted: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    by_thumbprint: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn unindex(&mut self, thumbprint: &str, hostname: &str) {
        if let Some(hosts) = self.by_thumbprint.get_mut(thumbprint) {
            hosts.remove(hostname);
            if hosts.is_empty() {
                self.by_thumbprint.remove(thumbprint);
            }
        }
    }
}

/// Concurrent hostname -> tunnel map with a secondary thumbprint index
#[derive(Default)]
pub struct TunnelRegistry {
    inner: RwLock<Inner>,
    next_token: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace the tunnel for `hostname`. A replaced entry's
    /// watcher fires.
    pub fn set(&self, hostname: &str, tunnel: ActiveTunnel) -> (TxToken, TunnelWatcher) {
        let tx_token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let (deleted, rx) = watch::channel(false);
        let thumbprint = tunnel.public_key_thumbprint.clone();
        let entry = Entry {
            tunnel: Arc::new(tunnel),
            tx_token,
            deleted,
        };

        let mut inner = self.write();
        if let Some(old) = inner.entries.insert(hostname.to_string(), entry) {
            inner.unindex(&old.tunnel.public_key_thumbprint, hostname);
            old.deleted.send_replace(true);
            debug!("Replaced tunnel {} (token {})", hostname, old.tx_token);
        }
        inner
            .by_thumbprint
            .entry(thumbprint)
            .or_default()
            .insert(hostname.to_string());
        drop(inner);

        trace!("Registered tunnel {} with token {}", hostname, tx_token);
        (tx_token, TunnelWatcher { rx })
    }

    pub fn get(&self, hostname: &str) -> Option<(Arc<ActiveTunnel>, TunnelWatcher)> {
        let inner = self.read();
        inner.entries.get(hostname).map(|entry| {
            (
                entry.tunnel.clone(),
                TunnelWatcher {
                    rx: entry.deleted.subscribe(),
                },
            )
        })
    }

    /// All tunnels owned by the key with `thumbprint`
    pub fn get_by_thumbprint(&self, thumbprint: &str) -> Option<Vec<Arc<ActiveTunnel>>> {
        let inner = self.read();
        let hosts = inner.by_thumbprint.get(thumbprint)?;
        let tunnels: Vec<_> = hosts
            .iter()
            .filter_map(|h| inner.entries.get(h))
            .map(|entry| entry.tunnel.clone())
            .collect();
        (!tunnels.is_empty()).then_some(tunnels)
    }

    /// Remove `hostname`. With a token, only if it still names the current entry.
    pub fn delete(&self, hostname: &str, tx_token: Option<TxToken>) -> bool {
        let mut inner = self.write();

        let current = match inner.entries.get(hostname) {
            Some(entry) => entry.tx_token,
            None => return false,
        };
        if tx_token.is_some_and(|token| token != current) {
            trace!(
                "Ignoring stale delete of {} (token {:?}, current {})",
                hostname,
                tx_token,
                current
            );
            return false;
        }

        let Some(entry) = inner.entries.remove(hostname) else {
            return false;
        };
        inner.unindex(&entry.tunnel.public_key_thumbprint, hostname);
        drop(inner);

        entry.deleted.send_replace(true);
        debug!("Removed tunnel {}", hostname);
        true
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.read().entries.keys().cloned().collect()
    }
}
