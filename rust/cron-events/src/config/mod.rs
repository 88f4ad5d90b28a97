//! Configuration management.
//!
//! Configuration is layered: built-in defaults, then an optional config
//! file (`config/cron-events.{yaml,toml}` or an explicit path), then
//! environment variables prefixed with `CRON_EVENTS__`, e.g.
//! `CRON_EVENTS__BUS__WORKER_COUNT=4`. `REDIS_URL` overrides `redis.url`.
//!
//! ```rust,ignore
//! use cron_events::config::AppConfig;
//!
//! let config = AppConfig::load(None)?;
//! println!("poll every {:?}", config.delayed.poll_interval());
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub delayed: DelayedConfig,
    #[serde(default)]
    pub records: RecordsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration and validate it.
    ///
    /// `path` points at an explicit config file; when `None` the default
    /// `config/cron-events` file is used if present.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(path)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config/cron-events").required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("CRON_EVENTS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = settings.try_deserialize()?;

        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                app_config.redis.url = Some(url);
            }
        }

        Ok(app_config)
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL. When absent the in-memory store is used.
    #[serde(default)]
    pub url: Option<String>,
    /// Optional namespace prepended to every key, e.g. `tenant-a:`.
    #[serde(default)]
    pub key_prefix: String,
}

/// Cron scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long `stop` waits for in-flight fires.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// TTL applied to persisted execution results.
    #[serde(default = "default_history_ttl_days")]
    pub history_ttl_days: u64,
    /// Timeout used when a task config leaves it at zero.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace_secs(),
            history_ttl_days: default_history_ttl_days(),
            default_task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_days * 24 * 60 * 60)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of the main event channel.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Timeout applied to subscriptions that do not set their own.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Upper bound on how long `stop` waits for workers to drain.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            worker_count: default_worker_count(),
            handler_timeout_secs: default_handler_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl BusConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Delayed event service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum events handled per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delay before a failed delivery is attempted again.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Age after the due time at which an undelivered event expires.
    #[serde(default = "default_expire_after_secs")]
    pub expire_after_secs: u64,
    /// Upper bound for a single sweep.
    #[serde(default = "default_sweep_timeout_secs")]
    pub sweep_timeout_secs: u64,
    /// Register one-shot scheduler entries for long delays.
    #[serde(default = "default_true")]
    pub one_shot_enabled: bool,
}

impl Default for DelayedConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            retry_interval_secs: default_retry_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            expire_after_secs: default_expire_after_secs(),
            sweep_timeout_secs: default_sweep_timeout_secs(),
            one_shot_enabled: true,
        }
    }
}

impl DelayedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_after_secs)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs)
    }
}

/// Event record audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsConfig {
    /// Number of most recent records kept.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_stop_grace_secs() -> u64 {
    30
}

fn default_history_ttl_days() -> u64 {
    30
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    1000
}

fn default_worker_count() -> usize {
    10
}

fn default_handler_timeout_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    50
}

fn default_retry_interval_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_expire_after_secs() -> u64 {
    86_400
}

fn default_sweep_timeout_secs() -> u64 {
    30
}

fn default_retention() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.bus.buffer_size, 1000);
        assert_eq!(config.bus.worker_count, 10);
        assert_eq!(config.delayed.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.delayed.batch_size, 50);
        assert_eq!(config.delayed.retry_interval(), Duration::from_secs(300));
        assert_eq!(config.delayed.expire_after(), Duration::from_secs(86_400));
        assert_eq!(config.scheduler.stop_grace(), Duration::from_secs(30));
        assert_eq!(
            config.scheduler.history_ttl(),
            Duration::from_secs(30 * 24 * 3600)
        );
        assert_eq!(config.records.retention, 10_000);
        assert!(config.delayed.one_shot_enabled);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "bus:\n  worker_count: 4\n  buffer_size: 40\ndelayed:\n  poll_interval_secs: 5\n  one_shot_enabled: false"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bus.worker_count, 4);
        assert_eq!(config.bus.buffer_size, 40);
        assert_eq!(config.delayed.poll_interval_secs, 5);
        assert!(!config.delayed.one_shot_enabled);
        // untouched sections keep their defaults
        assert_eq!(config.delayed.batch_size, 50);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized test, nothing else reads these variables concurrently
        unsafe {
            env::set_var("CRON_EVENTS__BUS__HANDLER_TIMEOUT_SECS", "7");
            env::set_var("REDIS_URL", "redis://cache:6379");
        }

        let config = AppConfig::load_unchecked(None).unwrap();
        assert_eq!(config.bus.handler_timeout(), Duration::from_secs(7));
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379"));

        // SAFETY: as above
        unsafe {
            env::remove_var("CRON_EVENTS__BUS__HANDLER_TIMEOUT_SECS");
            env::remove_var("REDIS_URL");
        }
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "bus:\n  worker_count: 0").unwrap();

        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }
}
