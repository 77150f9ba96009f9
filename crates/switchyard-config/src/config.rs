//! Configuration structs with sensible defaults and RON persistence.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the config inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Client-facing gateway settings.
    pub gateway: GatewayConfig,
    /// Inter-process transport settings.
    pub transport: TransportConfig,
    /// Service directory settings.
    pub discovery: DiscoveryConfig,
    /// Process role and shared infrastructure.
    pub cluster: ClusterConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the gateway accepts clients on.
    pub listen_addr: String,
    /// Heartbeat interval announced to clients, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Silence after which a connection is dropped, in seconds.
    pub read_deadline_secs: u64,
    /// Time allowed to complete the handshake, in seconds.
    pub handshake_timeout_secs: u64,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Per-connection inbound packet queue capacity.
    pub inbound_queue_capacity: usize,
    /// Per-connection outbound packet queue capacity.
    pub outbound_queue_capacity: usize,
    /// Idle connection buffers kept for reuse.
    pub pool_capacity: usize,
    /// Payload size in bytes from which outbound payloads are deflated (0 = never).
    pub compress_threshold: usize,
    /// Route compression dictionary announced in the handshake.
    pub routes: BTreeMap<String, u16>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Identity of this process; also its inbound bus subject.
    pub identity: String,
    /// Inbound envelope queue capacity.
    pub queue_capacity: usize,
}

/// Service directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service type this process registers as.
    pub service_name: String,
    /// Optional version segment of the registration key.
    pub version: Option<String>,
    /// Address peers use to reach this process (its bus identity).
    pub address: String,
    /// Load-balancing weight.
    pub weight: u32,
    /// Lease TTL in seconds.
    pub ttl_secs: u64,
    /// Bound on lease grant and the resolver's initial read, in milliseconds.
    pub dial_timeout_ms: u64,
    /// Interval of the resolver's full resync, in seconds.
    pub resync_interval_secs: u64,
    /// Interval of the register's re-registration check, in seconds.
    pub retry_interval_secs: u64,
    /// Service types the gateway forwards to.
    pub watch: Vec<String>,
}

/// What a process does in the cluster.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts client connections and routes their messages.
    #[default]
    Gateway,
    /// Serves forwarded messages for its service type; no listener.
    Backend,
}

/// Where the coordination store, bus and user table live.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Everything in this process; watched services get built-in backends.
    #[default]
    Local,
    /// Shared through a Redis server, one process per gateway or backend.
    Redis,
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub role: Role,
    pub mode: ClusterMode,
    /// Server URL used in `Redis` mode, e.g. `redis://127.0.0.1:6379/`.
    pub redis_url: String,
    /// Prefix of every key and channel this cluster uses.
    pub namespace: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3250".to_string(),
            heartbeat_interval_secs: 10,
            read_deadline_secs: 30,
            handshake_timeout_secs: 10,
            max_connections: 4096,
            inbound_queue_capacity: 128,
            outbound_queue_capacity: 128,
            pool_capacity: 256,
            compress_threshold: 0,
            routes: BTreeMap::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            identity: "connector-1".to_string(),
            queue_capacity: 1024,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_name: "connector".to_string(),
            version: None,
            address: "connector-1".to_string(),
            weight: 1,
            ttl_secs: 10,
            dial_timeout_ms: 5000,
            resync_interval_secs: 30,
            retry_interval_secs: 10,
            watch: Vec::new(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            role: Role::Gateway,
            mode: ClusterMode::Local,
            redis_url: "redis://127.0.0.1:6379/".to_string(),
            namespace: "switchyard".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Durations ---

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl DiscoveryConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

// --- Validation ---

impl Config {
    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.identity.is_empty() {
            return Err(ConfigError::Invalid("transport.identity is empty".into()));
        }
        if self.discovery.ttl_secs == 0 {
            return Err(ConfigError::Invalid("discovery.ttl_secs must be positive".into()));
        }
        match self.cluster.mode {
            ClusterMode::Redis if self.cluster.redis_url.is_empty() => {
                return Err(ConfigError::Invalid(
                    "cluster.redis_url is required in redis mode".into(),
                ));
            }
            ClusterMode::Local if self.cluster.role == Role::Backend => {
                return Err(ConfigError::Invalid(
                    "a backend needs a shared cluster (cluster.mode: redis)".into(),
                ));
            }
            _ => {}
        }
        let mut codes = BTreeMap::new();
        for (route, code) in &self.gateway.routes {
            if let Some(other) = codes.insert(*code, route) {
                return Err(ConfigError::Invalid(format!(
                    "route code {code} assigned to both {other:?} and {route:?}"
                )));
            }
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    fn read(config_path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(config_path).map_err(ConfigError::io(config_path))?;
        ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::io(config_dir))?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Render)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::io(&config_path))?;
        Ok(())
    }

    /// Re-read `config.ron`. Returns `Some(new_config)` when it differs from
    /// `self` and passes [`Config::validate`].
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;
        if &new_config == self {
            return Ok(None);
        }
        new_config.validate()?;
        log::info!("Config reloaded with changes");
        Ok(Some(new_config))
    }

    /// Sections that changed between `self` and `other` and only take
    /// effect after a restart.
    pub fn restart_required(&self, other: &Config) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.gateway != other.gateway {
            changed.push("gateway");
        }
        if self.transport != other.transport {
            changed.push("transport");
        }
        if self.discovery != other.discovery {
            changed.push("discovery");
        }
        if self.cluster != other.cluster {
            changed.push("cluster");
        }
        changed
    }
}
