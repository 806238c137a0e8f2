use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// File name looked up inside the data directory by `Store::open`.
pub const CONFIG_FILE: &str = "ruledb.yaml";

/// Runtime configuration, optionally loaded from `ruledb.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file name, relative to the data directory.
    pub db_file: String,
    /// Number of pooled read-only connections.
    pub read_connections: usize,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// How long a migration waits for the cross-process migration lock.
    pub migration_lock_timeout_ms: u64,
    pub default_per_page: usize,
    pub max_per_page: usize,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// How long a full queue may stay full before the connection is dropped.
    pub grace_period_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_file: "data.db".into(),
            read_connections: 4,
            busy_timeout_ms: 5_000,
            migration_lock_timeout_ms: 2_000,
            default_per_page: 30,
            max_per_page: 500,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            queue_capacity: 256,
            grace_period_ms: 5_000,
        }
    }
}

impl RealtimeConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Config {
    /// Load a config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Load `ruledb.yaml` from the data directory if it exists.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            log::info!("Loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn migration_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::from_yaml_str("max_per_page: 50\nrealtime:\n  queue_capacity: 8\n").unwrap();
        assert_eq!(config.max_per_page, 50);
        assert_eq!(config.default_per_page, 30);
        assert_eq!(config.realtime.queue_capacity, 8);
        assert_eq!(config.realtime.grace_period_ms, 5_000);
    }

    #[test]
    fn test_empty_config() {
        let config = Config::from_yaml_str("").unwrap();
        assert_eq!(config.db_file, "data.db");
    }

    #[test]
    fn test_load_from_dir_without_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load_from_dir(tmp.path()).unwrap();
        assert_eq!(config.read_connections, 4);
    }
}
