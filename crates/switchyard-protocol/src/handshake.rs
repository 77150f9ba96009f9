//! JSON bodies carried by handshake, kick and error packets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Application error codes carried in error responses.
pub mod error_codes {
    /// Handshake accepted.
    pub const OK: u16 = 200;
    /// Malformed route or request.
    pub const BAD_ROUTE: u16 = 400;
    /// No handler registered for the route.
    pub const NO_HANDLER: u16 = 404;
    /// The handler returned an error.
    pub const HANDLER_FAILED: u16 = 500;
    /// The request could not be forwarded to a backend.
    pub const FORWARD_FAILED: u16 = 502;
    /// No backend instance is known for the service type.
    pub const NO_INSTANCE: u16 = 503;
}

/// Client handshake body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client platform information.
    #[serde(default)]
    pub sys: ClientSys,
    /// Free-form application data.
    #[serde(default)]
    pub user: serde_json::Value,
}

/// Client platform section of the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSys {
    /// Client library type, e.g. `"js-websocket"`.
    #[serde(rename = "type", default)]
    pub client_type: Option<String>,
    /// Client library version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Server handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Status code, [`error_codes::OK`] on success.
    pub code: u16,
    /// Negotiated session parameters.
    pub sys: ServerSys,
}

/// Server section of the handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSys {
    /// Expected heartbeat interval in seconds.
    pub heartbeat: u64,
    /// Route compression table.
    pub dict: BTreeMap<String, u16>,
}

impl HandshakeResponse {
    /// Successful reply advertising `heartbeat_secs` and `dict`.
    pub fn ok(heartbeat_secs: u64, dict: BTreeMap<String, u16>) -> Self {
        Self {
            code: error_codes::OK,
            sys: ServerSys {
                heartbeat: heartbeat_secs,
                dict,
            },
        }
    }
}

/// Body of a kick packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickBody {
    /// Human-readable reason.
    pub reason: String,
}

/// Payload of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Application error code, see [`error_codes`].
    pub code: u16,
    /// Human-readable description.
    pub message: String,
}

impl ErrorBody {
    /// Build an error body.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
