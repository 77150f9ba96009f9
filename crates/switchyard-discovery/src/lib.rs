//! Service directory: lease-based registration and watch-based resolution of
//! process addresses through an external coordination store.
//!
//! Two stores are provided: [`RedisStore`] for deployments spanning several
//! processes and [`MemoryStore`] for a single process and for tests.
//!
//! A process announces itself with a [`Register`], which keeps a
//! [`ServiceRecord`] alive under a lease. Peers find it with a [`Resolver`],
//! which mirrors every record under a key prefix and republishes the address
//! list whenever it changes.

pub mod error;
pub mod memory;
pub mod record;
pub mod redis_store;
pub mod register;
pub mod resolver;
pub mod store;

pub use error::DiscoveryError;
pub use memory::MemoryStore;
pub use record::{ServiceRecord, address_from_key, service_prefix};
pub use redis_store::RedisStore;
pub use register::{Register, RegisterOptions, RegisterState};
pub use resolver::{
    Address, Attributes, Resolver, ResolverBuilder, ResolverOptions, ResolverState, Target,
};
pub use store::{CoordinationStore, KeepAliveResponse, KeyValue, LeaseId, WatchEvent};
