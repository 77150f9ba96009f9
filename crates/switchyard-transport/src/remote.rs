//! Backend-side view of a client session.
//!
//! A [`RemoteSession`] is rebuilt from every incoming envelope. Reads are
//! served from the envelope's snapshot plus any local writes; every write is
//! also sent back to the owning gateway as a one-key sync envelope, applied
//! there in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use switchyard_protocol::Message;

use crate::client::TransportClient;
use crate::envelope::{Envelope, EnvelopeKind, SessionData};
use crate::error::HandlerError;
use crate::push::PushFanout;
use crate::session::{Scope, SessionHandle, check_bind};

struct View {
    data: SessionData,
    user_id: String,
}

/// Session facade for a handler running away from the owning gateway.
pub struct RemoteSession {
    envelope: Envelope,
    transport: Arc<TransportClient>,
    view: Mutex<View>,
    forwarded: AtomicBool,
    fanout: Option<Arc<PushFanout>>,
}

impl RemoteSession {
    pub fn new(envelope: Envelope, transport: Arc<TransportClient>) -> Self {
        let view = View {
            data: envelope.session.clone(),
            user_id: envelope.user_id.clone(),
        };
        Self {
            envelope,
            transport,
            view: Mutex::new(view),
            forwarded: AtomicBool::new(false),
            fanout: None,
        }
    }

    /// Enable [`Self::push`] through `fanout`.
    pub fn with_fanout(mut self, fanout: Arc<PushFanout>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// The envelope this session was built from.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Identity of the gateway owning the connection.
    pub fn gateway(&self) -> &str {
        &self.envelope.source
    }

    /// Whether the message was handed to another process.
    pub fn forwarded(&self) -> bool {
        self.forwarded.load(Ordering::Acquire)
    }

    fn sync(&self, user_id: String, changes: SessionData) -> Result<(), HandlerError> {
        let envelope = Envelope::session_sync(
            self.transport.identity(),
            &self.envelope.source,
            &self.envelope.connection_id,
            user_id,
            changes,
        );
        self.transport.send_envelope(&envelope)?;
        Ok(())
    }

    /// Re-dispatch the current message to `destination`, optionally on a new
    /// route. The envelope keeps the gateway as its source so the target
    /// answers the client directly, and carries the session as seen here.
    pub fn dispatch(&self, route: Option<&str>, destination: &str) -> Result<(), HandlerError> {
        let (session, user_id) = {
            let view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
            (view.data.clone(), view.user_id.clone())
        };
        let envelope = Envelope {
            kind: EnvelopeKind::Message,
            destination: destination.to_string(),
            route: route.map(str::to_string).or_else(|| self.envelope.route.clone()),
            user_id,
            session,
            ..self.envelope.clone()
        };
        self.transport.send_envelope(&envelope)?;
        self.forwarded.store(true, Ordering::Release);
        tracing::debug!(
            connection = %self.envelope.connection_id,
            to = destination,
            route = envelope.effective_route().unwrap_or_default(),
            "message re-dispatched"
        );
        Ok(())
    }

    /// Forward the current message unchanged to `destination`.
    pub fn send_proxy(&self, destination: &str) -> Result<(), HandlerError> {
        self.dispatch(None, destination)
    }

    /// Push a message to this session's client through its gateway.
    pub fn push_self(&self, route: &str, payload: Vec<u8>) -> Result<(), HandlerError> {
        let mut envelope = Envelope::message(
            self.transport.identity(),
            &self.envelope.source,
            Message::push(route, payload),
        );
        envelope.connection_id = self.envelope.connection_id.clone();
        self.transport.send_envelope(&envelope)?;
        Ok(())
    }

    /// Push a message to `users`, wherever they are connected. Returns the
    /// number of gateways the push was sent to.
    pub fn push(&self, users: &[String], route: &str, payload: &[u8]) -> Result<usize, HandlerError> {
        let fanout = self.fanout.as_ref().ok_or(HandlerError::Unsupported("push"))?;
        Ok(fanout.push(Some(&self.envelope), users, payload, route))
    }
}

impl SessionHandle for RemoteSession {
    fn connection_id(&self) -> &str {
        &self.envelope.connection_id
    }

    fn user_id(&self) -> String {
        self.view
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .user_id
            .clone()
    }

    fn get(&self, key: &str) -> Option<Value> {
        let view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        view.data
            .single
            .get(key)
            .or_else(|| view.data.shared.get(key))
            .cloned()
    }

    fn put(&self, key: &str, value: Value, scope: Scope) -> Result<(), HandlerError> {
        let mut delta = SessionData::default();
        let user_id = {
            let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
            let (local, out) = match scope {
                Scope::Connection => (&mut view.data.single, &mut delta.single),
                Scope::Shared => (&mut view.data.shared, &mut delta.shared),
            };
            local.insert(key.to_string(), value.clone());
            out.insert(key.to_string(), value);
            view.user_id.clone()
        };
        self.sync(user_id, delta)
    }

    fn bind(&self, user_id: &str) -> Result<(), HandlerError> {
        {
            let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
            if !check_bind(&view.user_id, user_id)? {
                return Ok(());
            }
            view.user_id = user_id.to_string();
        }
        self.sync(user_id.to_string(), SessionData::default())
    }

    fn forward(&self, route: Option<&str>, destination: &str) -> Result<(), HandlerError> {
        self.dispatch(route, destination)
    }

    fn push(&self, users: &[String], route: &str, payload: &[u8]) -> Result<usize, HandlerError> {
        RemoteSession::push(self, users, route, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        session: RemoteSession,
        gateway_rx: mpsc::Receiver<Vec<u8>>,
        bus: Arc<MemoryBus>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let gateway_rx = bus.subscribe("gate-1", 16).unwrap();
        let transport = Arc::new(TransportClient::new("game-1", bus.clone(), 16));
        let _own = transport.run().unwrap();

        let mut envelope = Envelope::message(
            "gate-1",
            "game-1",
            Message::request(9, "game.room.join", b"{}".to_vec()),
        );
        envelope.connection_id = "c1".into();
        envelope.session.single.insert("room".into(), json!(1));
        envelope.session.shared.insert("motd".into(), json!("hi"));

        Fixture {
            session: RemoteSession::new(envelope, transport),
            gateway_rx,
            bus,
        }
    }

    fn next(rx: &mut mpsc::Receiver<Vec<u8>>) -> Envelope {
        Envelope::decode(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn test_get_reads_snapshot() {
        let f = fixture();
        assert_eq!(f.session.get("room"), Some(json!(1)));
        assert_eq!(f.session.get("motd"), Some(json!("hi")));
        assert_eq!(f.session.get("missing"), None);
    }

    #[test]
    fn test_put_sends_one_key_delta() {
        let mut f = fixture();
        f.session.put("room", json!(2), Scope::Connection).unwrap();
        f.session.put("count", json!(5), Scope::Shared).unwrap();

        assert_eq!(f.session.get("room"), Some(json!(2)));

        let first = next(&mut f.gateway_rx);
        assert_eq!(first.kind, EnvelopeKind::SessionSync);
        assert_eq!(first.source, "game-1");
        assert_eq!(first.connection_id, "c1");
        assert_eq!(first.session.single.len(), 1);
        assert_eq!(first.session.single["room"], json!(2));
        assert!(first.session.shared.is_empty());

        let second = next(&mut f.gateway_rx);
        assert_eq!(second.session.shared["count"], json!(5));
        assert!(second.session.single.is_empty());
    }

    #[test]
    fn test_bind_once() {
        let mut f = fixture();
        f.session.bind("u1").unwrap();
        assert_eq!(f.session.user_id(), "u1");
        assert_eq!(next(&mut f.gateway_rx).user_id, "u1");

        f.session.bind("u1").unwrap();
        assert!(f.gateway_rx.try_recv().is_err());
        assert!(f.session.bind("u2").is_err());
    }

    #[test]
    fn test_dispatch_keeps_gateway_as_source() {
        let f = fixture();
        let mut chat_rx = f.bus.subscribe("chat-1", 4).unwrap();
        f.session.put("room", json!(3), Scope::Connection).unwrap();

        f.session
            .dispatch(Some("chat.room.say"), "chat-1")
            .unwrap();
        assert!(f.session.forwarded());

        let env = next(&mut chat_rx);
        assert_eq!(env.source, "gate-1");
        assert_eq!(env.destination, "chat-1");
        assert_eq!(env.effective_route(), Some("chat.room.say"));
        assert_eq!(env.message.as_ref().map(|m| m.id), Some(9));
        assert_eq!(env.session.single["room"], json!(3));
    }

    #[test]
    fn test_push_requires_fanout() {
        let f = fixture();
        assert_eq!(
            f.session.push(&["u1".to_string()], "onChat", b"x"),
            Err(HandlerError::Unsupported("push"))
        );
    }

    #[test]
    fn test_push_through_fanout() {
        let f = fixture();
        let mut other_rx = f.bus.subscribe("gate-2", 4).unwrap();
        let locator = Arc::new(crate::push::MemoryUserLocator::new());
        crate::push::UserLocator::bind(&*locator, "u2", "gate-2");
        let fanout = Arc::new(PushFanout::new(Arc::clone(&f.session.transport), locator));
        let session = RemoteSession::new(f.session.envelope().clone(), Arc::clone(&f.session.transport))
            .with_fanout(fanout);

        assert_eq!(session.push(&["u2".to_string()], "onChat", b"x"), Ok(1));
        let env = next(&mut other_rx);
        assert_eq!(env.users, vec!["u2".to_string()]);
        assert_eq!(env.connection_id, "c1");
    }

    #[test]
    fn test_push_self_targets_connection() {
        let mut f = fixture();
        f.session.push_self("onTick", b"1".to_vec()).unwrap();

        let env = next(&mut f.gateway_rx);
        assert_eq!(env.connection_id, "c1");
        assert!(env.users.is_empty());
        let msg = env.message.unwrap();
        assert_eq!(msg, Message::push("onTick", b"1".to_vec()));
    }
}
