//! Client-facing gateway.
//!
//! The [`ConnectionManager`] terminates client connections, runs the
//! handshake and heartbeat protocol, and routes every request either to a
//! handler registered in this process or, over the transport, to a backend
//! instance chosen from the resolver's view of the service directory.
//! Responses, session syncs and pushes from backends flow back through the
//! transport's inbound queue.

pub mod connection;
pub mod error;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod selector;
pub mod session;

pub use connection::{Connection, ConnectionState, RecordingConnection, TcpConnection};
pub use error::{GatewayError, RoutingError, SessionError};
pub use manager::{ConnectionManager, GatewayOptions};
pub use pool::{ConnectionBuffers, ObjectPool, Poolable};
pub use registry::ConnectionRegistry;
pub use scheduler::Scheduler;
pub use selector::{InstanceSelector, SelectPolicy};
pub use session::{Session, SharedData};
