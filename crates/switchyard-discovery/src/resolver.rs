//! Watch-based resolution of a service name to its live address set.
//!
//! A [`Resolver`] reads every record under the service prefix once, then
//! follows prefix watch events, applying puts (add if absent) and deletes
//! (remove by the address parsed from the key). A periodic full resync backs
//! up the watch in case an event is missed. Every change republishes the full
//! [`ResolverState`] on a [`watch`] channel, which is what load balancers
//! subscribe to.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;
use crate::record::{ServiceRecord, address_from_key, service_prefix};
use crate::store::{CoordinationStore, KeyValue, WatchEvent};

/// Per-address metadata exposed to the load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    /// Load-balancing weight.
    pub weight: u32,
}

/// One resolved instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Instance address (bus identity).
    pub address: String,
    /// Balancer attributes.
    pub attributes: Attributes,
}

impl Address {
    fn from_record(record: &ServiceRecord) -> Self {
        Self {
            address: record.address.clone(),
            attributes: Attributes {
                weight: record.weight,
            },
        }
    }
}

/// Full resolver view, republished after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    /// Known instances, in discovery order.
    pub addresses: Vec<Address>,
}

impl ResolverState {
    /// Whether `address` is present.
    pub fn contains(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a.address == address)
    }
}

/// Timing knobs for [`Resolver`].
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Upper bound on the initial prefix read.
    pub dial_timeout: Duration,
    /// Interval between full resyncs.
    pub resync_interval: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            resync_interval: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// A resolution target of the form `scheme:///service[/version]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// URI scheme the target was written with.
    pub scheme: String,
    /// Logical service name.
    pub service: String,
    /// Optional version segment.
    pub version: Option<String>,
}

impl Target {
    /// Parse `scheme:///service[/version]`.
    pub fn parse(uri: &str) -> Result<Self, DiscoveryError> {
        let invalid = || DiscoveryError::InvalidTarget(uri.to_string());
        let (scheme, rest) = uri.split_once(":///").ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }
        let mut parts = rest.split('/').filter(|s| !s.is_empty());
        let service = parts.next().ok_or_else(invalid)?;
        let version = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            scheme: scheme.to_string(),
            service: service.to_string(),
            version,
        })
    }

    /// Key prefix this target resolves.
    pub fn prefix(&self) -> String {
        service_prefix(&self.service, self.version.as_deref())
    }
}

/// Builds resolvers for targets of one scheme.
pub struct ResolverBuilder {
    scheme: String,
    store: Arc<dyn CoordinationStore>,
    options: ResolverOptions,
}

impl ResolverBuilder {
    /// Create a builder that answers for `scheme`.
    pub fn new(
        scheme: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            store,
            options,
        }
    }

    /// Scheme this builder handles.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Parse `uri` and start a resolver for it.
    pub async fn build(&self, uri: &str) -> Result<Resolver, DiscoveryError> {
        let target = Target::parse(uri)?;
        if target.scheme != self.scheme {
            return Err(DiscoveryError::InvalidTarget(uri.to_string()));
        }
        Resolver::start(Arc::clone(&self.store), target.prefix(), self.options.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Live view of every instance under one key prefix.
pub struct Resolver {
    prefix: String,
    state_rx: watch::Receiver<ResolverState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    /// Read the initial address set and start the background watcher.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        prefix: String,
        options: ResolverOptions,
    ) -> Result<Self, DiscoveryError> {
        let timeout = options.dial_timeout;
        let kvs = tokio::time::timeout(timeout, store.get_prefix(&prefix))
            .await
            .map_err(|_| DiscoveryError::Timeout(timeout))??;
        let addresses = parse_all(&kvs);
        tracing::info!(prefix = %prefix, count = addresses.len(), "resolver started");

        let (state_tx, state_rx) = watch::channel(ResolverState { addresses });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = Watcher {
            store,
            prefix: prefix.clone(),
            resync_interval: options.resync_interval,
            state_tx,
        };
        let task = tokio::spawn(watcher.run(shutdown_rx));

        Ok(Self {
            prefix,
            state_rx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// The key prefix this resolver follows.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subscribe to address set updates.
    pub fn subscribe(&self) -> watch::Receiver<ResolverState> {
        self.state_rx.clone()
    }

    /// Current address set.
    pub fn state(&self) -> ResolverState {
        self.state_rx.borrow().clone()
    }

    /// Stop the background watcher.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn parse_all(kvs: &[KeyValue]) -> Vec<Address> {
    let mut addresses: Vec<Address> = Vec::with_capacity(kvs.len());
    for kv in kvs {
        match ServiceRecord::from_value(&kv.key, &kv.value) {
            Ok(record) if !addresses.iter().any(|a| a.address == record.address) => {
                addresses.push(Address::from_record(&record));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("skipping record: {e}"),
        }
    }
    addresses
}

/// Apply one watch event. Returns whether the list changed.
pub(crate) fn apply_event(addresses: &mut Vec<Address>, event: &WatchEvent) -> bool {
    match event {
        WatchEvent::Put(kv) => match ServiceRecord::from_value(&kv.key, &kv.value) {
            Ok(record) => {
                if addresses.iter().any(|a| a.address == record.address) {
                    false
                } else {
                    addresses.push(Address::from_record(&record));
                    true
                }
            }
            Err(e) => {
                tracing::warn!("ignoring put: {e}");
                false
            }
        },
        WatchEvent::Delete { key } => {
            let Some(address) = address_from_key(key) else {
                return false;
            };
            let before = addresses.len();
            addresses.retain(|a| a.address != address);
            addresses.len() != before
        }
    }
}

struct Watcher {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    resync_interval: Duration,
    state_tx: watch::Sender<ResolverState>,
}

impl Watcher {
    async fn subscribe(&self) -> Option<mpsc::Receiver<WatchEvent>> {
        match self.store.watch_prefix(&self.prefix).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!(prefix = %self.prefix, "watch failed, relying on resync: {e}");
                None
            }
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut events = self.subscribe().await;
        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = next_event(&mut events) => match event {
                    Some(event) => {
                        let mut addresses = self.state_tx.borrow().addresses.clone();
                        if apply_event(&mut addresses, &event) {
                            tracing::debug!(prefix = %self.prefix, ?event, "address set changed");
                            self.state_tx.send_replace(ResolverState { addresses });
                        }
                    }
                    None => {
                        tracing::warn!(prefix = %self.prefix, "watch stream ended");
                        events = None;
                    }
                },
                _ = ticker.tick() => {
                    self.resync().await;
                    if events.is_none() {
                        events = self.subscribe().await;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn resync(&self) {
        match self.store.get_prefix(&self.prefix).await {
            Ok(kvs) => {
                let addresses = parse_all(&kvs);
                self.state_tx.send_if_modified(|state| {
                    if state.addresses == addresses {
                        false
                    } else {
                        tracing::debug!(prefix = %self.prefix, "resync corrected address set");
                        state.addresses = addresses;
                        true
                    }
                });
            }
            Err(e) => tracing::warn!(prefix = %self.prefix, "resync failed: {e}"),
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<WatchEvent>>) -> Option<WatchEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
