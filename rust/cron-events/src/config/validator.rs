//! Start-up validation of configuration values.

use super::AppConfig;
use super::error::{ConfigResult, ConfigurationError};

/// Rejects configurations the runtime cannot operate with.
///
/// | Setting | Rule |
/// |---------|------|
/// | `bus.worker_count` | > 0 |
/// | `bus.buffer_size` | >= `bus.worker_count` |
/// | `bus.handler_timeout_secs` | > 0 |
/// | `delayed.poll_interval_secs` | > 0 |
/// | `delayed.batch_size` | > 0 |
/// | `delayed.retry_interval_secs` | < `delayed.expire_after_secs` |
/// | `records.retention` | > 0 |
/// | `redis.url` | `redis://`, `rediss://` or `unix://` when set |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration, reporting every problem.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        errors.extend(Self::validate_bus(config));
        errors.extend(Self::validate_delayed(config));

        if config.records.retention == 0 {
            errors.push(ConfigurationError::invalid(
                "records.retention must be greater than zero",
                "Set CRON_EVENTS__RECORDS__RETENTION, e.g. 10000",
            ));
        }

        if let Some(url) = &config.redis.url {
            let known = ["redis://", "rediss://", "unix://"];
            if !known.iter().any(|scheme| url.starts_with(scheme)) {
                errors.push(ConfigurationError::invalid(
                    format!("redis.url '{url}' has an unsupported scheme"),
                    "Use redis://host:port, rediss://host:port or unix:///path/to/socket",
                ));
            }
        }

        match ConfigurationError::from_list(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn validate_bus(config: &AppConfig) -> Vec<ConfigurationError> {
        let bus = &config.bus;
        let mut errors = Vec::new();

        if bus.worker_count == 0 {
            errors.push(ConfigurationError::invalid(
                "bus.worker_count must be greater than zero",
                "Set CRON_EVENTS__BUS__WORKER_COUNT to a positive value (default 10)",
            ));
        } else if bus.buffer_size < bus.worker_count {
            errors.push(ConfigurationError::incompatible(
                format!("bus.buffer_size={}", bus.buffer_size),
                format!("bus.worker_count={}", bus.worker_count),
                "each worker queue holds buffer_size / worker_count events, \
                so the buffer must be at least as large as the worker pool",
            ));
        }

        if bus.handler_timeout_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "bus.handler_timeout_secs must be greater than zero",
                "Set CRON_EVENTS__BUS__HANDLER_TIMEOUT_SECS (default 30)",
            ));
        }

        errors
    }

    fn validate_delayed(config: &AppConfig) -> Vec<ConfigurationError> {
        let delayed = &config.delayed;
        let mut errors = Vec::new();

        if delayed.poll_interval_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "delayed.poll_interval_secs must be greater than zero",
                "Set CRON_EVENTS__DELAYED__POLL_INTERVAL_SECS (default 30)",
            ));
        }

        if delayed.batch_size == 0 {
            errors.push(ConfigurationError::invalid(
                "delayed.batch_size must be greater than zero",
                "Set CRON_EVENTS__DELAYED__BATCH_SIZE (default 50)",
            ));
        }

        if delayed.cleanup_interval_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "delayed.cleanup_interval_secs must be greater than zero",
                "Set CRON_EVENTS__DELAYED__CLEANUP_INTERVAL_SECS (default 3600)",
            ));
        }

        if delayed.retry_interval_secs >= delayed.expire_after_secs {
            errors.push(ConfigurationError::incompatible(
                format!("delayed.retry_interval_secs={}", delayed.retry_interval_secs),
                format!("delayed.expire_after_secs={}", delayed.expire_after_secs),
                "a rescheduled event would expire before its retry is attempted",
            ));
        }

        errors
    }
}
