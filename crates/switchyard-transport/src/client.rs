//! Point-to-point client on top of a [`Bus`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::bus::Bus;
use crate::envelope::Envelope;
use crate::error::TransportError;

/// Sends bytes to peer processes by identity and receives the bytes
/// addressed to this process.
pub struct TransportClient {
    identity: String,
    bus: Arc<dyn Bus>,
    capacity: usize,
    running: AtomicBool,
}

impl TransportClient {
    /// A client for process `identity`. Incoming messages are buffered up to
    /// `capacity` once [`Self::run`] is called.
    pub fn new(identity: impl Into<String>, bus: Arc<dyn Bus>, capacity: usize) -> Self {
        Self {
            identity: identity.into(),
            bus,
            capacity,
            running: AtomicBool::new(false),
        }
    }

    /// This process's identity, also its inbound subject.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether [`Self::run`] was called and [`Self::close`] was not.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to this process's subject and return the inbound queue.
    pub fn run(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let rx = self.bus.subscribe(&self.identity, self.capacity)?;
        self.running.store(true, Ordering::Release);
        tracing::info!(identity = %self.identity, capacity = self.capacity, "transport running");
        Ok(rx)
    }

    /// Send raw bytes to the process named `destination`.
    pub fn send(&self, destination: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::Closed);
        }
        self.bus.publish(destination, bytes)
    }

    /// Encode `envelope` and send it to its destination.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode()?;
        self.send(&envelope.destination, bytes)
    }

    /// Unsubscribe; the inbound queue ends and further sends fail.
    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.bus.unsubscribe(&self.identity);
            tracing::info!(identity = %self.identity, "transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[tokio::test]
    async fn test_send_between_clients() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let a = TransportClient::new("gate-1", bus.clone(), 8);
        let b = TransportClient::new("game-1", bus, 8);
        let _a_rx = a.run().unwrap();
        let mut b_rx = b.run().unwrap();

        a.send("game-1", b"ping".to_vec()).unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_close_ends_inbound_and_rejects_sends() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let client = TransportClient::new("gate-1", bus, 8);
        let mut rx = client.run().unwrap();

        client.close();
        assert_eq!(rx.recv().await, None);
        assert_eq!(client.send("x", vec![]), Err(TransportError::Closed));
    }

    #[test]
    fn test_send_before_run_fails() {
        let client = TransportClient::new("gate-1", Arc::new(MemoryBus::new()), 8);
        assert_eq!(client.send("x", vec![]), Err(TransportError::Closed));
    }
}
