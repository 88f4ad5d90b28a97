use std::time::Duration;

use thiserror::Error;

/// Error kinds surfaced by the store, scheduler, event bus and delayed service.
#[derive(Error, Debug)]
pub enum Error {
    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    /// A task or subscription configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A delayed event was scheduled at or before the current instant.
    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    Conflict { kind: &'static str, id: String },

    /// The bounded event channel cannot accept another event.
    #[error("event queue is full")]
    QueueFull,

    #[error("handler '{handler}' timed out after {timeout:?}")]
    HandlerTimeout { handler: String, timeout: Duration },

    #[error("handler '{handler}' panicked: {message}")]
    HandlerPanic { handler: String, message: String },

    #[error("handler '{handler}' failed: {reason}")]
    HandlerFailed { handler: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    /// Persistent store I/O failure.
    #[error("store backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("task '{0}' is not scheduled")]
    NotScheduled(String),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        Error::Conflict {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_expression(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidExpression {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Render a panic payload caught through a `JoinError`.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
