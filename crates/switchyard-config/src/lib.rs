//! Configuration for switchyard processes.
//!
//! Settings persist to disk as a RON file and can be overridden from the
//! command line. Every section defaults independently, so older and newer
//! config files both load.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, ClusterConfig, ClusterMode, Config, DebugConfig, DiscoveryConfig, GatewayConfig,
    Role, TransportConfig,
};
pub use error::ConfigError;
