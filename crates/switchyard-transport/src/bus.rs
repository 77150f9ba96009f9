//! Topic-based message bus.
//!
//! The transport only needs point-to-point delivery: each process subscribes
//! to one subject named after its identity and peers publish to it. Delivery
//! is at most once; a message published to a subject nobody listens on is
//! dropped.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Publish/subscribe seam the transport is built on.
pub trait Bus: Send + Sync {
    /// Publish `payload` on `subject`.
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to `subject`, buffering at most `capacity` messages.
    ///
    /// A second subscription to the same subject replaces the first; the old
    /// receiver then ends.
    fn subscribe(
        &self,
        subject: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Drop the subscription on `subject`, if any.
    fn unsubscribe(&self, subject: &str);
}

/// In-process [`Bus`] backed by bounded channels.
#[derive(Default)]
pub struct MemoryBus {
    subjects: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let tx = self
            .subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .cloned();
        let Some(tx) = tx else {
            tracing::trace!(subject, "no subscriber, message dropped");
            return Ok(());
        };
        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::QueueFull(subject.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subject, "subscriber gone, message dropped");
                let mut subjects = self
                    .subjects
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if subjects.get(subject).is_some_and(|tx| tx.is_closed()) {
                    subjects.remove(subject);
                }
                Ok(())
            }
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
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.to_string(), tx);
        Ok(rx)
    }

    fn unsubscribe(&self, subject: &str) {
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("game-1", 4).unwrap();
        bus.publish("game-1", b"hello".to_vec()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }

    #[test]
    fn test_publish_without_subscriber_is_dropped() {
        let bus = MemoryBus::new();
        assert_eq!(bus.publish("nobody", b"x".to_vec()), Ok(()));
    }

    #[test]
    fn test_full_queue_reports_error() {
        let bus = MemoryBus::new();
        let _rx = bus.subscribe("slow", 1).unwrap();
        bus.publish("slow", vec![1]).unwrap();
        assert_eq!(
            bus.publish("slow", vec![2]),
            Err(TransportError::QueueFull("slow".into()))
        );
    }

    #[test]
    fn test_closed_subscription_is_pruned() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("gone", 1).unwrap();
        drop(rx);
        assert_eq!(bus.publish("gone", vec![1]), Ok(()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("s", 1).unwrap();
        let mut second = bus.subscribe("s", 1).unwrap();
        assert_eq!(first.recv().await, None);
        bus.publish("s", vec![7]).unwrap();
        assert_eq!(second.recv().await.unwrap(), vec![7]);
    }
}
