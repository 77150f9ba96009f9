//! Structured logging for switchyard processes.
//!
//! Console output with uptime timestamps and targets, plus a JSON log file in
//! debug builds. The level comes from `RUST_LOG` when set, otherwise from the
//! `debug.log_level` config setting. The level can be changed at runtime
//! through the [`LogHandle`] returned by [`init_logging`].

use std::path::Path;

use switchyard_config::Config;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

/// Default filter when neither `RUST_LOG` nor the config sets a level.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE_NAME: &str = "switchyard.log";

/// Filter string to use for `config`.
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => config.debug.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Errors changing the active log filter.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid log filter {directive:?}: {source}")]
    InvalidFilter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("log subscriber is gone: {0}")]
    Reload(#[from] reload::Error),
}

/// Parse a filter directive.
pub fn parse_filter(directive: &str) -> Result<EnvFilter, LogError> {
    EnvFilter::try_new(directive).map_err(|source| LogError::InvalidFilter {
        directive: directive.to_string(),
        source,
    })
}

/// Handle to the filter of the installed subscriber.
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogHandle {
    /// Replace the active filter.
    pub fn set_filter(&self, directive: &str) -> Result<(), LogError> {
        let filter = parse_filter(directive)?;
        self.filter.reload(filter)?;
        Ok(())
    }

    /// Apply the level from `config`. Does nothing when the level came from
    /// `RUST_LOG`; returns whether the filter changed.
    pub fn apply_config(&self, config: &Config) -> Result<bool, LogError> {
        if self.from_env {
            return Ok(false);
        }
        self.set_filter(&filter_directive(Some(config)))?;
        Ok(true)
    }
}

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file (debug builds only)
/// * `debug_build` - whether file logging is enabled
/// * `config` - source of the log level when `RUST_LOG` is unset
///
/// ```no_run
/// use switchyard_config::Config;
/// use switchyard_log::init_logging;
///
/// let config = Config::default();
/// let handle = init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// handle.set_filter("debug").ok();
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) -> LogHandle {
    let filter_str = filter_directive(config);
    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(&filter_str), false),
    };
    let (env_filter, filter) = reload::Layer::new(env_filter);
    let handle = LogHandle { filter, from_env };

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return handle;
    }

    subscriber.init();
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_config() {
        let mut config = Config::default();
        assert_eq!(filter_directive(Some(&config)), "info");

        config.debug.log_level = "warn,switchyard_gateway=debug".to_string();
        assert_eq!(
            filter_directive(Some(&config)),
            "warn,switchyard_gateway=debug"
        );

        config.debug.log_level.clear();
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_directive(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_subsystem_filters_parse() {
        for filter in [
            "info",
            "debug,switchyard_transport=trace",
            "warn,switchyard_discovery=debug,switchyard_gateway=trace",
        ] {
            assert!(EnvFilter::try_new(filter).is_ok(), "{filter}");
        }
    }

    #[test]
    fn test_handle_swaps_filter() {
        let (layer, filter) = reload::Layer::new(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let handle = LogHandle {
            filter,
            from_env: false,
        };

        assert!(handle.set_filter("debug,switchyard_gateway=trace").is_ok());
        assert!(matches!(
            handle.set_filter("switchyard=loud"),
            Err(LogError::InvalidFilter { .. })
        ));

        let mut config = Config::default();
        config.debug.log_level = "warn".to_string();
        assert!(handle.apply_config(&config).unwrap());

        let pinned = LogHandle {
            from_env: true,
            ..handle
        };
        assert!(!pinned.apply_config(&config).unwrap());
    }

    #[test]
    fn test_log_file_lands_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        std::fs::File::create(&path).unwrap();
        assert_eq!(path.file_name().unwrap(), "switchyard.log");
    }
}
