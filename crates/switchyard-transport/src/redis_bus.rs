//! [`Bus`] over Redis publish/subscribe.
//!
//! Subjects map to channels `<namespace>:<subject>`. Publishing is queued
//! to a single writer task so [`Bus::publish`] never blocks; each
//! subscription owns a pub/sub connection that is re-established after a
//! disconnect. Redis pub/sub is at-most-once, which is all the transport
//! asks of a bus.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use redis::Client;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::bus::Bus;
use crate::error::TransportError;

pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) fn bus_error(e: redis::RedisError) -> TransportError {
    TransportError::Bus(e.to_string())
}

/// Open a connection manager, retrying until the server answers.
pub(crate) async fn connect_with_retry(client: &Client, purpose: &str) -> ConnectionManager {
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => return conn,
            Err(e) => {
                tracing::warn!(purpose, "redis connect failed, retrying: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Channel name for `subject`.
pub fn channel_name(namespace: &str, subject: &str) -> String {
    format!("{namespace}:{subject}")
}

/// Networked [`Bus`] on a Redis server.
pub struct RedisBus {
    client: Client,
    namespace: String,
    outbound: mpsc::Sender<(String, Vec<u8>)>,
    subscriptions: Mutex<HashMap<String, AbortHandle>>,
}

impl RedisBus {
    /// A bus on the server at `url`. At most `capacity` published messages
    /// wait for the writer; beyond that publishing reports
    /// [`TransportError::QueueFull`].
    ///
    /// Must be called inside a Tokio runtime. The server is contacted
    /// lazily, so a bus can be built before Redis is reachable.
    pub fn new(url: &str, namespace: &str, capacity: usize) -> Result<Self, TransportError> {
        let client = Client::open(url).map_err(bus_error)?;
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(publish_loop(client.clone(), rx));
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            outbound,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl Bus for RedisBus {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let channel = channel_name(&self.namespace, subject);
        match self.outbound.try_send((channel, payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::QueueFull(subject.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn subscribe(
        &self,
        subject: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if capacity == 0 {
            return Err(TransportError::Bus("capacity must be non-zero".into()));
        }
        let (tx, rx) = mpsc::channel(capacity);
        let channel = channel_name(&self.namespace, subject);
        let task = tokio::spawn(subscribe_loop(self.client.clone(), channel, tx));
        let previous = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.to_string(), task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(rx)
    }

    fn unsubscribe(&self, subject: &str) {
        let handle = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in subscriptions.drain() {
            handle.abort();
        }
    }
}

async fn publish_loop(client: Client, mut rx: mpsc::Receiver<(String, Vec<u8>)>) {
    let mut conn = connect_with_retry(&client, "publish").await;
    while let Some((channel, payload)) = rx.recv().await {
        let published: Result<u64, _> = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        match published {
            Ok(0) => tracing::trace!(channel = %channel, "no subscriber, message dropped"),
            Ok(_) => {}
            Err(e) => tracing::warn!(channel = %channel, "publish failed, message dropped: {e}"),
        }
    }
    tracing::debug!("redis publisher stopped");
}

enum Stop {
    ReceiverGone,
    ConnectionLost,
}

async fn subscribe_loop(client: Client, channel: String, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        match forward(&client, &channel, &tx).await {
            Ok(Stop::ReceiverGone) => return,
            Ok(Stop::ConnectionLost) => tracing::warn!(channel = %channel, "subscription lost"),
            Err(e) => tracing::warn!(channel = %channel, "subscribe failed: {e}"),
        }
        tokio::select! {
            _ = tx.closed() => return,
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

async fn forward(
    client: &Client,
    channel: &str,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<Stop, redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::debug!(channel, "subscribed");

    let mut messages = pin!(pubsub.into_on_message());
    loop {
        let msg = tokio::select! {
            _ = tx.closed() => return Ok(Stop::ReceiverGone),
            msg = messages.next() => msg,
        };
        let Some(msg) = msg else {
            return Ok(Stop::ConnectionLost);
        };
        match tx.try_send(msg.get_payload_bytes().to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(channel, "inbound queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Ok(Stop::ReceiverGone),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Nothing listens on port 1, so the writer never drains its queue.
    const UNREACHABLE: &str = "redis://127.0.0.1:1/";

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("switchyard", "gate-1"), "switchyard:gate-1");
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let bus = RedisBus::new(UNREACHABLE, "sy", 4).unwrap();
        assert!(matches!(bus.subscribe("gate-1", 0), Err(TransportError::Bus(_))));
    }

    #[tokio::test]
    async fn test_publish_queue_full_while_disconnected() {
        let bus = RedisBus::new(UNREACHABLE, "sy", 1).unwrap();
        bus.publish("game-1", vec![1]).unwrap();
        assert_eq!(
            bus.publish("game-1", vec![2]),
            Err(TransportError::QueueFull("game-1".into()))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_receiver() {
        let bus = RedisBus::new(UNREACHABLE, "sy", 4).unwrap();
        let mut rx = bus.subscribe("gate-1", 4).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe("gate-1");
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_resubscribe_ends_previous_receiver() {
        let bus = RedisBus::new(UNREACHABLE, "sy", 4).unwrap();
        let mut first = bus.subscribe("gate-1", 4).unwrap();
        let _second = bus.subscribe("gate-1", 4).unwrap();
        assert_eq!(first.recv().await, None);
    }

    #[tokio::test]
    #[ignore = "needs a redis server at SWITCHYARD_REDIS_URL"]
    async fn test_round_trip_against_server() {
        let url = std::env::var("SWITCHYARD_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let namespace = format!("sy-test-{}", std::process::id());
        let bus = RedisBus::new(&url, &namespace, 16).unwrap();
        let mut rx = bus.subscribe("game-1", 4).unwrap();

        // The subscription is established asynchronously.
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                bus.publish("game-1", b"hello".to_vec()).unwrap();
                tokio::select! {
                    msg = rx.recv() => return msg,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received.as_deref(), Some(&b"hello"[..]));
    }
}
