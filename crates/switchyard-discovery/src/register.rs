//! Lease-based self-registration.
//!
//! [`Register::start`] grants a lease, binds the service record to it and
//! keeps the lease alive for the lifetime of the process. A background loop
//! re-registers when the keepalive stream ends (the store lost the lease), on
//! a periodic tick when no keepalive is active, and on close deletes the key,
//! revokes the lease and closes the store client.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;
use crate::record::ServiceRecord;
use crate::store::{CoordinationStore, KeepAliveResponse, LeaseId};

/// Timing knobs for [`Register`].
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Upper bound on the lease grant and the initial put.
    pub dial_timeout: Duration,
    /// How often the loop checks whether it must re-register.
    pub retry_interval: Duration,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of a [`Register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState {
    /// Not registered yet, or waiting to re-register.
    Idle,
    /// The record is bound to a live lease.
    Active,
    /// Closed; the record has been removed.
    Closed,
}

struct Status {
    state: RegisterState,
    lease: Option<LeaseId>,
}

/// Keeps one [`ServiceRecord`] registered under a lease.
pub struct Register {
    store: Arc<dyn CoordinationStore>,
    record: ServiceRecord,
    options: RegisterOptions,
    status: Mutex<Status>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Register {
    /// Create a register for `record`. Nothing is written until [`Self::start`].
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        record: ServiceRecord,
        options: RegisterOptions,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            record,
            options,
            status: Mutex::new(Status {
                state: RegisterState::Idle,
                lease: None,
            }),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// The registered record.
    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegisterState {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Lease currently backing the record.
    pub fn lease(&self) -> Option<LeaseId> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lease
    }

    fn set_status(&self, state: RegisterState, lease: Option<LeaseId>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.state = state;
        status.lease = lease;
    }

    /// Register once and spawn the keep-registered loop.
    ///
    /// Failure here is a startup failure and is returned to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        let keepalive = self.register().await?;
        let this = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            this.keep_registered(Some(keepalive), shutdown_rx).await;
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Grant a lease, bind the record to it and start keepalive.
    pub async fn register(&self) -> Result<mpsc::Receiver<KeepAliveResponse>, DiscoveryError> {
        let timeout = self.options.dial_timeout;
        let key = self.record.key();
        let value = self.record.to_value()?;

        let lease = tokio::time::timeout(timeout, self.store.grant(self.record.ttl))
            .await
            .map_err(|_| DiscoveryError::Timeout(timeout))??;
        let attached = async {
            tokio::time::timeout(timeout, self.store.put(&key, &value, Some(lease)))
                .await
                .map_err(|_| DiscoveryError::Timeout(timeout))??;
            // Keepalive itself is unbounded: it lives until close.
            self.store.keep_alive(lease).await
        };
        let keepalive = match attached.await {
            Ok(keepalive) => keepalive,
            Err(e) => {
                self.release(lease).await;
                return Err(e);
            }
        };

        self.set_status(RegisterState::Active, Some(lease));
        tracing::info!(key = %key, lease, ttl = self.record.ttl, "service registered");
        Ok(keepalive)
    }

    /// Revoke a lease that never got a live record attached.
    async fn release(&self, lease: LeaseId) {
        let timeout = self.options.dial_timeout;
        match tokio::time::timeout(timeout, self.store.revoke(lease)).await {
            Ok(Ok(())) => tracing::debug!(lease, "unused lease revoked"),
            Ok(Err(e)) => tracing::warn!(lease, "unused lease not revoked: {e}"),
            Err(_) => tracing::warn!(lease, "unused lease not revoked: timed out"),
        }
    }

    async fn try_register(&self) -> Option<mpsc::Receiver<KeepAliveResponse>> {
        match self.register().await {
            Ok(keepalive) => Some(keepalive),
            Err(e) => {
                tracing::warn!(name = %self.record.name, "re-registration failed: {e}");
                None
            }
        }
    }

    async fn keep_registered(
        &self,
        mut keepalive: Option<mpsc::Receiver<KeepAliveResponse>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.options.retry_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                response = next_keepalive(&mut keepalive) => match response {
                    Some(response) => {
                        tracing::trace!(lease = response.lease, ttl = response.ttl, "lease renewed");
                    }
                    None => {
                        tracing::warn!(name = %self.record.name, "keepalive stream ended, re-registering");
                        self.set_status(RegisterState::Idle, None);
                        keepalive = self.try_register().await;
                    }
                },
                _ = ticker.tick() => {
                    if keepalive.is_none() {
                        keepalive = self.try_register().await;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        drop(keepalive.take());
                        self.unregister().await;
                        break;
                    }
                }
            }
        }
    }

    async fn unregister(&self) {
        let key = self.record.key();
        if let Err(e) = self.store.delete(&key).await {
            tracing::warn!(key = %key, "failed to delete service key: {e}");
        }
        if let Some(lease) = self.lease()
            && let Err(e) = self.store.revoke(lease).await
        {
            tracing::warn!(lease, "failed to revoke lease: {e}");
        }
        self.store.close().await;
        self.set_status(RegisterState::Closed, None);
        tracing::info!(key = %key, "service unregistered");
    }

    /// Stop the loop, delete the record and revoke the lease.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => self.unregister().await,
        }
    }
}

async fn next_keepalive(
    keepalive: &mut Option<mpsc::Receiver<KeepAliveResponse>>,
) -> Option<KeepAliveResponse> {
    match keepalive {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn record(ttl: u64) -> ServiceRecord {
        ServiceRecord {
            name: "game".into(),
            address: "game-1".into(),
            weight: 1,
            version: String::new(),
            ttl,
        }
    }

    fn fast() -> RegisterOptions {
        RegisterOptions {
            dial_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_start_writes_record_under_lease() {
        let store = MemoryStore::new();
        let register = Register::new(Arc::new(store.clone()), record(5), fast());
        register.start().await.unwrap();

        assert_eq!(register.state(), RegisterState::Active);
        assert!(register.lease().is_some());
        let value = store.value("/game/game-1").unwrap();
        assert_eq!(ServiceRecord::from_value("/game/game-1", &value).unwrap(), record(5));
        register.close().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_store_down() {
        let store = MemoryStore::new();
        store.set_available(false);
        let register = Register::new(Arc::new(store), record(5), fast());
        assert!(matches!(
            register.start().await,
            Err(DiscoveryError::Unavailable(_))
        ));
        assert_eq!(register.state(), RegisterState::Idle);
    }

    /// Grants leases but rejects every write.
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for ReadOnlyStore {
        async fn grant(&self, ttl_secs: u64) -> Result<LeaseId, DiscoveryError> {
            self.inner.grant(ttl_secs).await
        }
        async fn put(&self, _key: &str, _value: &str, _lease: Option<LeaseId>) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::Unavailable("read-only".into()))
        }
        async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<KeepAliveResponse>, DiscoveryError> {
            self.inner.keep_alive(lease).await
        }
        async fn revoke(&self, lease: LeaseId) -> Result<(), DiscoveryError> {
            self.inner.revoke(lease).await
        }
        async fn delete(&self, key: &str) -> Result<(), DiscoveryError> {
            self.inner.delete(key).await
        }
        async fn get_prefix(&self, prefix: &str) -> Result<Vec<crate::store::KeyValue>, DiscoveryError> {
            self.inner.get_prefix(prefix).await
        }
        async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<crate::store::WatchEvent>, DiscoveryError> {
            self.inner.watch_prefix(prefix).await
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_failed_put_revokes_granted_lease() {
        let store = MemoryStore::new();
        let register = Register::new(
            Arc::new(ReadOnlyStore {
                inner: store.clone(),
            }),
            record(5),
            fast(),
        );

        assert!(matches!(
            register.register().await,
            Err(DiscoveryError::Unavailable(_))
        ));
        assert_eq!(store.lease_count(), 0);
        assert_eq!(register.state(), RegisterState::Idle);
        assert!(register.lease().is_none());
    }

    #[tokio::test]
    async fn test_close_deletes_key_and_revokes_lease() {
        let store = MemoryStore::new();
        let register = Register::new(Arc::new(store.clone()), record(5), fast());
        register.start().await.unwrap();

        register.close().await;
        assert_eq!(register.state(), RegisterState::Closed);
        assert_eq!(store.value("/game/game-1"), None);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_reregisters_after_store_restart() {
        let store = MemoryStore::new();
        let register = Register::new(Arc::new(store.clone()), record(5), fast());
        register.start().await.unwrap();
        let first = register.lease().unwrap();

        store.restart();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(register.state(), RegisterState::Active);
        let second = register.lease().unwrap();
        assert_ne!(first, second);
        assert!(store.value("/game/game-1").is_some());
        register.close().await;
    }

    #[tokio::test]
    async fn test_tick_recovers_after_outage() {
        let store = MemoryStore::new();
        let register = Register::new(Arc::new(store.clone()), record(5), fast());
        register.start().await.unwrap();

        store.set_available(false);
        store.restart();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(register.state(), RegisterState::Idle);

        store.set_available(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(register.state(), RegisterState::Active);
        assert!(store.value("/game/game-1").is_some());
        register.close().await;
    }
}
