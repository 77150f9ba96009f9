//! Coordination store on a Redis server.
//!
//! Key layout under a configurable namespace `ns`:
//!
//! | key                     | holds                                     |
//! |-------------------------|-------------------------------------------|
//! | `ns:kv:<key>`           | a stored value, expiring with its lease   |
//! | `ns:lease:<id>`         | the lease TTL in seconds, with that TTL   |
//! | `ns:lease:<id>:keys`    | set of value keys attached to the lease   |
//! | `ns:lease-seq`          | lease id counter                          |
//!
//! Every put and delete is published as a JSON event on the `ns:events`
//! channel, which is what prefix watches subscribe to. Keys that expire
//! because their lease was not renewed are reported through Redis keyspace
//! notifications (`notify-keyspace-events Ex`) when the server has them
//! enabled; the resolver's periodic resync covers servers that do not.
//!
//! Lease scripts touch value keys that are not declared up front, so the
//! store targets a standalone server or a single-shard deployment.

use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::DiscoveryError;
use crate::store::{CoordinationStore, KeepAliveResponse, KeyValue, LeaseId, WatchEvent};

const WATCH_CAPACITY: usize = 256;
const KEEPALIVE_CAPACITY: usize = 16;
const SCAN_COUNT: usize = 256;
const EXPIRED_EVENTS: &str = "__keyevent@*__:expired";

const PUT_WITH_LEASE: &str = r"
local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then return 0 end
redis.call('SET', KEYS[3], ARGV[1], 'PX', ttl)
redis.call('SADD', KEYS[2], KEYS[3])
redis.call('PEXPIRE', KEYS[2], ttl)
redis.call('PUBLISH', KEYS[4], ARGV[2])
return 1
";

const RENEW_LEASE: &str = r"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then return 0 end
for _, key in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  if redis.call('EXPIRE', key, ARGV[1]) == 0 then redis.call('SREM', KEYS[2], key) end
end
redis.call('EXPIRE', KEYS[2], ARGV[1])
return 1
";

const REVOKE_LEASE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local removed = 0
for _, key in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  if redis.call('DEL', key) == 1 then
    removed = removed + 1
    redis.call('PUBLISH', KEYS[3], cjson.encode({op = 'delete', key = string.sub(key, #ARGV[1] + 1)}))
  end
end
redis.call('DEL', KEYS[1], KEYS[2])
return removed
";

/// Change notification published on the events channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum StoreEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl From<StoreEvent> for WatchEvent {
    fn from(event: StoreEvent) -> Self {
        match event {
            StoreEvent::Put { key, value } => WatchEvent::Put(KeyValue { key, value }),
            StoreEvent::Delete { key } => WatchEvent::Delete { key },
        }
    }
}

/// Redis key names for one namespace.
#[derive(Debug, Clone)]
struct Keys {
    namespace: String,
}

impl Keys {
    fn value_prefix(&self) -> String {
        format!("{}:kv:", self.namespace)
    }

    fn value(&self, key: &str) -> String {
        format!("{}:kv:{key}", self.namespace)
    }

    fn lease(&self, lease: LeaseId) -> String {
        format!("{}:lease:{lease}", self.namespace)
    }

    fn lease_keys(&self, lease: LeaseId) -> String {
        format!("{}:lease:{lease}:keys", self.namespace)
    }

    fn lease_seq(&self) -> String {
        format!("{}:lease-seq", self.namespace)
    }

    fn events(&self) -> String {
        format!("{}:events", self.namespace)
    }

    /// SCAN pattern matching every value key under `prefix`.
    fn scan_pattern(&self, prefix: &str) -> String {
        format!("{}{}*", escape_glob(&self.value_prefix()), escape_glob(prefix))
    }

    /// Turn a message from the events channel or the expiry channel into a
    /// watch event for `prefix`. Anything else is ignored.
    fn watch_event(&self, channel: &str, payload: &[u8], prefix: &str) -> Option<WatchEvent> {
        let event = if channel == self.events() {
            match serde_json::from_slice::<StoreEvent>(payload) {
                Ok(event) => WatchEvent::from(event),
                Err(e) => {
                    tracing::warn!(channel, "ignoring malformed store event: {e}");
                    return None;
                }
            }
        } else {
            let expired = std::str::from_utf8(payload).ok()?;
            let key = expired.strip_prefix(&self.value_prefix())?;
            WatchEvent::Delete {
                key: key.to_string(),
            }
        };
        let key = match &event {
            WatchEvent::Put(kv) => kv.key.as_str(),
            WatchEvent::Delete { key } => key.as_str(),
        };
        key.starts_with(prefix).then_some(event)
    }
}

/// Escape the glob metacharacters Redis `MATCH` understands.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unavailable(e: redis::RedisError) -> DiscoveryError {
    DiscoveryError::Unavailable(e.to_string())
}

/// [`CoordinationStore`] backed by a Redis server.
///
/// Cheap to clone; clones share one auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    keys: Keys,
}

impl RedisStore {
    /// Connect to the server at `url`, keeping every key under `namespace`.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, DiscoveryError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        tracing::info!(namespace, "connected to redis coordination store");
        Ok(Self {
            client,
            conn,
            keys: Keys {
                namespace: namespace.to_string(),
            },
        })
    }

    async fn lease_ttl(&self, lease: LeaseId) -> Result<u64, DiscoveryError> {
        let mut conn = self.conn.clone();
        let ttl: Option<u64> = redis::cmd("GET")
            .arg(self.keys.lease(lease))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        ttl.ok_or(DiscoveryError::LeaseNotFound(lease))
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn grant(&self, ttl_secs: u64) -> Result<LeaseId, DiscoveryError> {
        if ttl_secs == 0 {
            return Err(DiscoveryError::GrantFailed("ttl must be positive".into()));
        }
        let mut conn = self.conn.clone();
        let lease: LeaseId = redis::cmd("INCR")
            .arg(self.keys.lease_seq())
            .query_async(&mut conn)
            .await
            .map_err(|e| DiscoveryError::GrantFailed(e.to_string()))?;
        let () = redis::cmd("SET")
            .arg(self.keys.lease(lease))
            .arg(ttl_secs)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| DiscoveryError::GrantFailed(e.to_string()))?;
        tracing::debug!(lease, ttl_secs, "lease granted");
        Ok(lease)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), DiscoveryError> {
        let event = serde_json::to_string(&StoreEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .map_err(DiscoveryError::Serialize)?;
        let mut conn = self.conn.clone();
        match lease {
            Some(lease) => {
                let stored: i64 = Script::new(PUT_WITH_LEASE)
                    .key(self.keys.lease(lease))
                    .key(self.keys.lease_keys(lease))
                    .key(self.keys.value(key))
                    .key(self.keys.events())
                    .arg(value)
                    .arg(event)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                if stored == 0 {
                    return Err(DiscoveryError::LeaseNotFound(lease));
                }
            }
            None => {
                let () = redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(self.keys.value(key))
                    .arg(value)
                    .ignore()
                    .cmd("PUBLISH")
                    .arg(self.keys.events())
                    .arg(event)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
            }
        }
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<KeepAliveResponse>, DiscoveryError> {
        let ttl = self.lease_ttl(lease).await?;
        let period = (Duration::from_secs(ttl) / 3).max(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel(KEEPALIVE_CAPACITY);
        let mut conn = self.conn.clone();
        let lease_key = self.keys.lease(lease);
        let lease_keys = self.keys.lease_keys(lease);

        tokio::spawn(async move {
            let script = Script::new(RENEW_LEASE);
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let renewed: Result<i64, _> = script
                    .key(&lease_key)
                    .key(&lease_keys)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await;
                match renewed {
                    Ok(1) => {
                        let _ = tx.try_send(KeepAliveResponse { lease, ttl });
                    }
                    Ok(_) => {
                        tracing::debug!(lease, "lease gone, keepalive stopped");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(lease, "keepalive failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), DiscoveryError> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(REVOKE_LEASE)
            .key(self.keys.lease(lease))
            .key(self.keys.lease_keys(lease))
            .key(self.keys.events())
            .arg(self.keys.value_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if removed < 0 {
            return Err(DiscoveryError::LeaseNotFound(lease));
        }
        tracing::debug!(lease, removed, "lease revoked");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DiscoveryError> {
        let event = serde_json::to_string(&StoreEvent::Delete {
            key: key.to_string(),
        })
        .map_err(DiscoveryError::Serialize)?;
        let mut conn = self.conn.clone();
        let () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.keys.value(key))
            .ignore()
            .cmd("PUBLISH")
            .arg(self.keys.events())
            .arg(event)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, DiscoveryError> {
        let mut conn = self.conn.clone();
        let pattern = self.keys.scan_pattern(prefix);
        let mut names = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            names.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&names)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let value_prefix = self.keys.value_prefix();
        Ok(names
            .into_iter()
            .zip(values)
            .filter_map(|(name, value)| {
                let key = name.strip_prefix(&value_prefix)?.to_string();
                Some(KeyValue { key, value: value? })
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, DiscoveryError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub
            .subscribe(self.keys.events())
            .await
            .map_err(unavailable)?;
        pubsub.psubscribe(EXPIRED_EVENTS).await.map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        let keys = self.keys.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            let mut messages = pin!(pubsub.into_on_message());
            loop {
                let msg = tokio::select! {
                    _ = tx.closed() => break,
                    msg = messages.next() => msg,
                };
                let Some(msg) = msg else {
                    tracing::warn!(prefix = %prefix, "redis watch connection lost");
                    break;
                };
                let Some(event) = keys.watch_event(msg.get_channel_name(), msg.get_payload_bytes(), &prefix)
                else {
                    continue;
                };
                if tx.try_send(event).is_err() {
                    tracing::warn!(prefix = %prefix, "watch queue full or closed, event dropped");
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) {
        tracing::debug!(namespace = %self.keys.namespace, "redis store handle closed");
    }
}
