//! Inter-process transport and backend-side session handling.
//!
//! Processes exchange JSON [`Envelope`]s over a topic-based [`Bus`], used as
//! a best-effort point-to-point link: every process subscribes to a subject
//! named after its own identity. Backend processes never own a client
//! connection; they rebuild a [`RemoteSession`] from each envelope and send
//! session changes back to the gateway as sync envelopes.

pub mod bus;
pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod push;
pub mod redis_bus;
pub mod redis_locator;
pub mod remote;
pub mod session;

pub use bus::{Bus, MemoryBus};
pub use client::TransportClient;
pub use dispatcher::Dispatcher;
pub use envelope::{Envelope, EnvelopeKind, SessionData};
pub use error::{HandlerError, RoutingError, TransportError};
pub use handler::{Handler, HandlerRegistry, Route};
pub use push::{MemoryUserLocator, PushFanout, UserLocator};
pub use redis_bus::RedisBus;
pub use redis_locator::RedisUserLocator;
pub use remote::RemoteSession;
pub use session::{Scope, SessionHandle};
