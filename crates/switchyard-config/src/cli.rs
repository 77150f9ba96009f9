//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use crate::{ClusterMode, Config, Role};

/// switchyard command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "switchyard", about = "Session-routing gateway")]
pub struct CliArgs {
    /// Client listen address, e.g. `0.0.0.0:3250`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Process identity on the bus.
    #[arg(long)]
    pub identity: Option<String>,

    /// Service type this process registers as.
    #[arg(long)]
    pub service: Option<String>,

    /// Run as a gateway or as a backend.
    #[arg(long, value_enum)]
    pub role: Option<Role>,

    /// Share discovery, bus and user table through this Redis server.
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    ///
    /// A new identity also becomes the registered address, since peers reach
    /// a process through its identity. A Redis URL switches to redis mode.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref listen) = args.listen {
            self.gateway.listen_addr = listen.clone();
        }
        if let Some(ref identity) = args.identity {
            self.transport.identity = identity.clone();
            self.discovery.address = identity.clone();
        }
        if let Some(ref service) = args.service {
            self.discovery.service_name = service.clone();
        }
        if let Some(role) = args.role {
            self.cluster.role = role;
        }
        if let Some(ref url) = args.redis_url {
            self.cluster.mode = ClusterMode::Redis;
            self.cluster.redis_url = url.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            listen: Some("0.0.0.0:4000".to_string()),
            identity: Some("gate-7".to_string()),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.gateway.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.transport.identity, "gate-7");
        assert_eq!(config.discovery.address, "gate-7");
        // Non-overridden fields retain defaults
        assert_eq!(config.discovery.service_name, "connector");
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "switchyard",
            "--service",
            "game",
            "--log-level",
            "debug",
            "--config",
            "/tmp/sy",
        ]);
        assert_eq!(args.service.as_deref(), Some("game"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/sy")));
        assert!(args.listen.is_none());
    }

    #[test]
    fn test_backend_flags() {
        let args = CliArgs::parse_from([
            "switchyard",
            "--role",
            "backend",
            "--redis-url",
            "redis://cache:6379/",
        ]);
        let mut config = Config::default();
        config.apply_cli_overrides(&args);
        assert_eq!(config.cluster.role, Role::Backend);
        assert_eq!(config.cluster.mode, ClusterMode::Redis);
        assert_eq!(config.cluster.redis_url, "redis://cache:6379/");
        assert!(config.validate().is_ok());
    }
}
