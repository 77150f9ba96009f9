//! Gateway error types.

use switchyard_protocol::{DictionaryError, FrameError, MessageError};
use switchyard_transport::{HandlerError, TransportError};

pub use switchyard_transport::RoutingError;

/// A session operation was rejected.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session is bound to a different user.
    #[error("session already bound to {current:?}, cannot bind {requested:?}")]
    AlreadyBound { current: String, requested: String },

    /// An empty user id was given.
    #[error("empty user id")]
    EmptyUserId,
}

impl From<SessionError> for HandlerError {
    fn from(e: SessionError) -> Self {
        HandlerError::Session(e.to_string())
    }
}

/// Errors from the connection manager and its connections.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection's outbound queue is full.
    #[error("outbound queue full for connection {0}")]
    QueueFull(String),

    /// The connection or manager is closed.
    #[error("closed")]
    Closed,

    /// `max_connections` reached.
    #[error("connection limit of {0} reached")]
    LimitReached(usize),

    /// No connection with this id.
    #[error("unknown connection {0}")]
    UnknownConnection(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Dictionary(#[from] DictionaryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A JSON control body could not be built.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
