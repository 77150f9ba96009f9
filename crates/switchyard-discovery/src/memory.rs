//! In-process coordination store.
//!
//! Implements leases (with TTL expiry and keepalive streams), prefix reads
//! and prefix watches on top of a single mutex-guarded map. Used by
//! single-process deployments and by tests, which can also simulate an
//! outage ([`MemoryStore::set_available`]) or a store restart that drops
//! every lease ([`MemoryStore::restart`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::DiscoveryError;
use crate::store::{CoordinationStore, KeepAliveResponse, KeyValue, LeaseId, WatchEvent};

const WATCH_CAPACITY: usize = 256;
const KEEPALIVE_CAPACITY: usize = 16;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keepalives: Vec<mpsc::Sender<KeepAliveResponse>>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

struct Inner {
    kv: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
    next_lease: LeaseId,
    available: bool,
}

impl Inner {
    fn check_available(&self) -> Result<(), DiscoveryError> {
        if self.available {
            Ok(())
        } else {
            Err(DiscoveryError::Unavailable("memory store offline".into()))
        }
    }

    fn notify(&mut self, event: &WatchEvent) {
        let key = match event {
            WatchEvent::Put(kv) => kv.key.as_str(),
            WatchEvent::Delete { key } => key.as_str(),
        };
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if key.starts_with(&watcher.prefix) && watcher.tx.try_send(event.clone()).is_err() {
                tracing::warn!(prefix = %watcher.prefix, key, "watch queue full, dropping event");
            }
        }
    }

    fn delete_key(&mut self, key: &str) -> bool {
        if self.kv.remove(key).is_some() {
            self.notify(&WatchEvent::Delete {
                key: key.to_string(),
            });
            true
        } else {
            false
        }
    }

    /// Drop a lease and every key bound to it. Dropping the lease also drops
    /// its keepalive senders, which ends their streams.
    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let bound: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in bound {
            self.delete_key(&key);
        }
        true
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            tracing::debug!(lease, "lease expired");
            self.drop_lease(lease);
        }
    }
}

/// In-process [`CoordinationStore`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                kv: BTreeMap::new(),
                leases: HashMap::new(),
                watchers: Vec::new(),
                next_lease: 1,
                available: true,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a task that expires overdue leases every `interval`.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if Arc::strong_count(&store.inner) == 1 {
                    break;
                }
                store.expire_leases();
            }
        })
    }

    /// Expire every lease whose TTL has lapsed.
    pub fn expire_leases(&self) {
        self.lock().expire(Instant::now());
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Simulate a store restart: every lease is lost, along with the keys
    /// bound to it, and every keepalive stream ends.
    pub fn restart(&self) {
        let mut inner = self.lock();
        let leases: Vec<LeaseId> = inner.leases.keys().copied().collect();
        for lease in leases {
            inner.drop_lease(lease);
        }
    }

    /// Simulate the store cancelling every watch (e.g. after compaction).
    /// Watch streams end; subsequent changes produce no events for them.
    pub fn cancel_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    /// Current value of `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().kv.get(key).map(|e| e.value.clone())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl_secs: u64) -> Result<LeaseId, DiscoveryError> {
        let mut inner = self.lock();
        inner.check_available()?;
        if ttl_secs == 0 {
            return Err(DiscoveryError::GrantFailed("ttl must be positive".into()));
        }
        let id = inner.next_lease;
        inner.next_lease += 1;
        let ttl = Duration::from_secs(ttl_secs);
        inner.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
                keepalives: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), DiscoveryError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.expire(Instant::now());
        if let Some(lease) = lease
            && !inner.leases.contains_key(&lease)
        {
            return Err(DiscoveryError::LeaseNotFound(lease));
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        inner.notify(&WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        }));
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<KeepAliveResponse>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(KEEPALIVE_CAPACITY);
        let period = {
            let mut inner = self.lock();
            inner.check_available()?;
            let state = inner
                .leases
                .get_mut(&lease)
                .ok_or(DiscoveryError::LeaseNotFound(lease))?;
            state.keepalives.push(tx);
            (state.ttl / 3).max(Duration::from_millis(10))
        };

        // Renew at a third of the TTL, like a real client. Only the lease
        // owns the senders, so its streams end the moment it is dropped.
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let (senders, response) = {
                    let mut inner = store.lock();
                    if !inner.available {
                        continue;
                    }
                    let Some(state) = inner.leases.get_mut(&lease) else {
                        break;
                    };
                    state.keepalives.retain(|tx| !tx.is_closed());
                    if state.keepalives.is_empty() {
                        break;
                    }
                    state.expires_at = Instant::now() + state.ttl;
                    let response = KeepAliveResponse {
                        lease,
                        ttl: state.ttl.as_secs(),
                    };
                    (state.keepalives.clone(), response)
                };
                for tx in senders {
                    let _ = tx.try_send(response);
                }
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), DiscoveryError> {
        let mut inner = self.lock();
        inner.check_available()?;
        if inner.drop_lease(lease) {
            Ok(())
        } else {
            Err(DiscoveryError::LeaseNotFound(lease))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), DiscoveryError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.delete_key(key);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, DiscoveryError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.expire(Instant::now());
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        let mut inner = self.lock();
        inner.check_available()?;
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn close(&self) {
        // Nothing to tear down: the store lives in this process.
        tracing::debug!("memory store client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_prefix_filters_keys() {
        let store = MemoryStore::new();
        store.put("/game/a", "1", None).await.unwrap();
        store.put("/game/b", "2", None).await.unwrap();
        store.put("/gamehall/c", "3", None).await.unwrap();

        let kvs = store.get_prefix("/game/").await.unwrap();
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["/game/a", "/game/b"]);
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let store = MemoryStore::new();
        let result = store.put("/game/a", "1", Some(42)).await;
        assert!(matches!(result, Err(DiscoveryError::LeaseNotFound(42))));
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys_and_notifies() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/game/").await.unwrap();
        let lease = store.grant(5).await.unwrap();
        store.put("/game/a", "1", Some(lease)).await.unwrap();
        store.put("/game/b", "2", None).await.unwrap();

        store.revoke(lease).await.unwrap();
        assert_eq!(store.value("/game/a"), None);
        assert_eq!(store.value("/game/b").as_deref(), Some("2"));

        assert!(matches!(watch.recv().await, Some(WatchEvent::Put(_))));
        assert!(matches!(watch.recv().await, Some(WatchEvent::Put(_))));
        assert_eq!(
            watch.recv().await,
            Some(WatchEvent::Delete {
                key: "/game/a".into()
            })
        );
    }

    #[tokio::test]
    async fn test_lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant(1).await.unwrap();
        store.put("/game/a", "1", Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.get_prefix("/game/").await.unwrap().is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_renews_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(1).await.unwrap();
        store.put("/game/a", "1", Some(lease)).await.unwrap();
        let mut keepalive = store.keep_alive(lease).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.value("/game/a").as_deref(), Some("1"));
        let response = keepalive.recv().await.unwrap();
        assert_eq!(response.lease, lease);
    }

    #[tokio::test]
    async fn test_restart_ends_keepalive_stream() {
        let store = MemoryStore::new();
        let lease = store.grant(30).await.unwrap();
        let mut keepalive = store.keep_alive(lease).await.unwrap();

        store.restart();
        // Drain any response sent before the restart, then observe the end.
        while keepalive.recv().await.is_some() {}
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_requests() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.grant(5).await,
            Err(DiscoveryError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.grant(5).await.is_ok());
    }
}
