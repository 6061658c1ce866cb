//! Configuration for the watcher engine.
//!
//! Settings are plain serde-derived structs so embedders can load them from
//! whatever configuration layer they already have (TOML file, environment,
//! CLI flags) and hand the result to [`FileWatcher::with_config`].
//!
//! [`FileWatcher::with_config`]: crate::FileWatcher::with_config

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Watcher engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherConfig {
    /// Batching latency handed to the OS subscription, in milliseconds.
    ///
    /// Only the macOS backend batches natively; the other platforms deliver
    /// events as the OS produces them and ignore this setting.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
}

impl WatcherConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init_with_config`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default log level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module log level overrides.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

// Default value functions
fn default_latency_ms() -> u64 {
    0
}
fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_latency_is_zero() {
        let config = WatcherConfig::default();
        assert_eq!(config.latency(), Duration::ZERO);
    }

    #[test]
    fn test_logging_defaults_to_warn() {
        let config = LoggingConfig::default();
        assert_eq!(config.default, "warn");
        assert!(config.modules.is_empty());
    }
}
