//! The coordination store seam.
//!
//! Registration and resolution only need a handful of primitives from a
//! strongly-consistent key-value store: leases with keepalive, prefix reads
//! and prefix watches. [`crate::MemoryStore`] implements them in-process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DiscoveryError;

/// Lease identifier handed out by [`CoordinationStore::grant`].
pub type LeaseId = i64;

/// A stored key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key.
    pub key: String,
    /// Raw value.
    pub value: String,
}

/// Change notification delivered by [`CoordinationStore::watch_prefix`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or overwritten.
    Put(KeyValue),
    /// A key was deleted (explicitly or by lease expiry). Only the key is known.
    Delete {
        /// Deleted key.
        key: String,
    },
}

/// One successful lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    /// Renewed lease.
    pub lease: LeaseId,
    /// Remaining time-to-live in seconds.
    pub ttl: u64,
}

/// Primitives the service directory needs from the coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a lease that expires after `ttl_secs` unless renewed.
    async fn grant(&self, ttl_secs: u64) -> Result<LeaseId, DiscoveryError>;

    /// Write `key = value`, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), DiscoveryError>;

    /// Keep `lease` alive indefinitely.
    ///
    /// The returned stream yields one response per renewal. It ends (yields
    /// `None`) when the store loses the lease, e.g. after a store restart.
    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<KeepAliveResponse>, DiscoveryError>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), DiscoveryError>;

    /// Delete a single key.
    async fn delete(&self, key: &str) -> Result<(), DiscoveryError>;

    /// Read every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, DiscoveryError>;

    /// Stream changes to keys under `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, DiscoveryError>;

    /// Release the client connection.
    async fn close(&self);
}
