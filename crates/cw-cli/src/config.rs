//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cw_service::{BufferConfig, CoordinatorConfig};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Seconds between timed heartbeat flushes.
    pub flush_interval_secs: u64,
    /// Buffered heartbeat count that triggers an early flush.
    pub batch_size: usize,
    /// Heartbeat dedup TTL in seconds.
    pub dedup_ttl_secs: u64,
    /// In-memory dedup capacity.
    pub dedup_capacity: usize,
    /// Channel-name cache TTL in seconds.
    pub channel_cache_ttl_secs: u64,
    /// Seconds between persistent dedup prunes.
    pub dedup_prune_secs: u64,
    /// Flush backoff multiplier ceiling.
    pub max_backoff_multiplier: u32,

    /// Percentile recompute window in hours.
    pub percentile_window_hours: i64,

    /// Channels one instance may listen to at once.
    pub max_locks: usize,
    /// Seconds between lock heartbeats.
    pub lock_heartbeat_secs: u64,
    /// Seconds before a silent lock is up for takeover.
    pub lock_timeout_secs: i64,

    /// Raw chat message retention in days.
    pub retention_days: i64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("cw.db"),
            flush_interval_secs: 5,
            batch_size: 200,
            dedup_ttl_secs: 300,
            dedup_capacity: 20_000,
            channel_cache_ttl_secs: 300,
            dedup_prune_secs: 60,
            max_backoff_multiplier: 32,
            percentile_window_hours: 24,
            max_locks: 10,
            lock_heartbeat_secs: 30,
            lock_timeout_secs: 60,
            retention_days: 90,
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("CW_"));

        figment.extract()
    }

    /// Buffer settings derived from this configuration.
    #[must_use]
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            batch_size: self.batch_size,
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            dedup_capacity: self.dedup_capacity,
            channel_cache_ttl: Duration::from_secs(self.channel_cache_ttl_secs),
            dedup_prune_interval: Duration::from_secs(self.dedup_prune_secs),
            max_backoff_multiplier: self.max_backoff_multiplier,
        }
    }

    /// Coordinator settings derived from this configuration.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_locks: self.max_locks,
            heartbeat_interval: Duration::from_secs(self.lock_heartbeat_secs),
            lock_timeout: chrono::Duration::seconds(self.lock_timeout_secs),
        }
    }
}

/// Returns the platform-specific config directory for cw.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cw"))
}

/// Returns the platform-specific data directory for cw.
///
/// On Linux: `~/.local/share/cw`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("cw"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_data_path_returns_some() {
        assert!(dirs_data_path().is_some());
    }

    #[test]
    fn test_dirs_data_path_ends_with_cw() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "cw");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("cw.db"));
    }

    #[test]
    fn test_buffer_config_mirrors_knobs() {
        let config = Config {
            flush_interval_secs: 9,
            batch_size: 50,
            ..Config::default()
        };
        let buffer = config.buffer_config();
        assert_eq!(buffer.flush_interval, Duration::from_secs(9));
        assert_eq!(buffer.batch_size, 50);
        assert_eq!(buffer.max_backoff_multiplier, 32);
    }
}
