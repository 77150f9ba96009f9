//! Transport, routing and handler error types.

use switchyard_protocol::{ErrorBody, error_codes};

/// Failures moving bytes over the bus. Logged by callers, never retried.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The destination queue is full.
    #[error("queue for {0:?} is full")]
    QueueFull(String),

    /// The client has been closed or was never started.
    #[error("transport closed")]
    Closed,

    /// The bus refused the operation.
    #[error("bus error: {0}")]
    Bus(String),

    /// An envelope could not be serialized or parsed.
    #[error("envelope encoding failed: {0}")]
    Encoding(String),
}

/// A route could not be resolved to a handler or a backend.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    /// The route is not exactly `service.module.method`.
    #[error("malformed route {0:?}")]
    Malformed(String),

    /// The service is served here but has no handler for the route.
    #[error("no handler for route {0:?}")]
    NoHandler(String),

    /// No backend instance is known for the service type.
    #[error("no instance of service {0:?}")]
    NoInstance(String),
}

impl RoutingError {
    /// Application error code reported to the client.
    pub fn code(&self) -> u16 {
        match self {
            Self::Malformed(_) => error_codes::BAD_ROUTE,
            Self::NoHandler(_) => error_codes::NO_HANDLER,
            Self::NoInstance(_) => error_codes::NO_INSTANCE,
        }
    }
}

/// Errors a handler can return.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Business failure with an application-defined code.
    #[error("{message} (code {code})")]
    Application {
        /// Application error code.
        code: u16,
        /// Description shown to the client.
        message: String,
    },

    /// Routing failed before or inside the handler.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// A session operation was rejected.
    #[error("session error: {0}")]
    Session(String),

    /// The session implementation does not support the operation.
    #[error("{0} is not supported by this session")]
    Unsupported(&'static str),

    /// A session change or forward could not be sent.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Application`].
    pub fn application(code: u16, message: impl Into<String>) -> Self {
        Self::Application {
            code,
            message: message.into(),
        }
    }

    /// Application error code reported to the client.
    pub fn code(&self) -> u16 {
        match self {
            Self::Application { code, .. } => *code,
            Self::Routing(e) => e.code(),
            Self::Transport(_) => error_codes::FORWARD_FAILED,
            Self::Session(_) | Self::Unsupported(_) => error_codes::HANDLER_FAILED,
        }
    }

    /// JSON body for an error response.
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Application { code, message } => ErrorBody::new(*code, message.clone()),
            other => ErrorBody::new(other.code(), other.to_string()),
        }
    }
}
