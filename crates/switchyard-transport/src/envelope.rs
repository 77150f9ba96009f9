//! Inter-process envelope.
//!
//! An envelope carries a client message together with a snapshot of the
//! originating session, or (for [`EnvelopeKind::SessionSync`]) the session
//! changes a backend made. Envelopes are serialized as JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_protocol::Message;

use crate::error::TransportError;

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A client message, a response to one, or a push.
    Message,
    /// Session changes to apply on the owning gateway.
    SessionSync,
}

/// Session key/value data carried by an envelope.
///
/// On a [`EnvelopeKind::Message`] envelope this is the full snapshot; on a
/// [`EnvelopeKind::SessionSync`] envelope it holds only the changed keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    /// Per-connection values.
    #[serde(default)]
    pub single: HashMap<String, Value>,
    /// Values shared by every connection on the owning gateway.
    #[serde(default)]
    pub shared: HashMap<String, Value>,
}

impl SessionData {
    pub fn is_empty(&self) -> bool {
        self.single.is_empty() && self.shared.is_empty()
    }
}

/// The unit of inter-process communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Identity of the process that owns the client connection; responses and
    /// session syncs are sent here.
    pub source: String,
    /// Identity of the receiving process.
    pub destination: String,
    /// Route override set when a backend re-dispatches the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Originating connection on `source`.
    #[serde(default)]
    pub connection_id: String,
    /// Bound user id, empty if unbound.
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default)]
    pub session: SessionData,
    /// Push targets; empty means the connection named by `connection_id`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

impl Envelope {
    /// A message envelope from `source` to `destination`.
    pub fn message(
        source: impl Into<String>,
        destination: impl Into<String>,
        message: Message,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            source: source.into(),
            destination: destination.into(),
            route: None,
            connection_id: String::new(),
            user_id: String::new(),
            message: Some(message),
            session: SessionData::default(),
            users: Vec::new(),
        }
    }

    /// A session sync envelope carrying `changes`.
    pub fn session_sync(
        source: impl Into<String>,
        destination: impl Into<String>,
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        changes: SessionData,
    ) -> Self {
        Self {
            kind: EnvelopeKind::SessionSync,
            source: source.into(),
            destination: destination.into(),
            route: None,
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            message: None,
            session: changes,
            users: Vec::new(),
        }
    }

    /// The route to dispatch on: the override if set, else the message route.
    pub fn effective_route(&self) -> Option<&str> {
        self.route
            .as_deref()
            .or_else(|| self.message.as_ref().map(|m| m.route.as_str()))
            .filter(|r| !r.is_empty())
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_shape() {
        let mut env = Envelope::message("gate-1", "game-1", Message::request(3, "game.room.join", b"{}".to_vec()));
        env.connection_id = "c1".into();
        env.session.single.insert("room".into(), json!(7));

        let value: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "message");
        assert_eq!(value["source"], "gate-1");
        assert_eq!(value["session"]["single"]["room"], 7);
        assert!(value.get("route").is_none());
        assert!(value.get("users").is_none());
        assert_eq!(Envelope::decode(&env.encode().unwrap()).unwrap(), env);
    }

    #[test]
    fn test_effective_route_prefers_override() {
        let mut env = Envelope::message("a", "b", Message::notify("game.room.say", vec![]));
        assert_eq!(env.effective_route(), Some("game.room.say"));
        env.route = Some("chat.room.say".into());
        assert_eq!(env.effective_route(), Some("chat.room.say"));

        let sync = Envelope::session_sync("a", "b", "c1", "", SessionData::default());
        assert_eq!(sync.effective_route(), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(TransportError::Encoding(_))
        ));
    }
}
