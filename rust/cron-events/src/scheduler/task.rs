//! Task definitions, execution results and per-task statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::Params;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => Err(Error::InvalidConfig(format!("unknown task status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Http,
    System,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::System => "system",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of an HTTP task.
///
/// Missing fields take their defaults on decode; explicit values, including
/// `retry_count: 0`, are kept as given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_timeout", with = "duration_nanos")]
    pub timeout: Duration,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay", with = "duration_nanos")]
    pub retry_delay: Duration,
    #[serde(default = "default_expected_code")]
    pub expected_code: u16,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: String::new(),
            timeout: default_timeout(),
            retry_count: default_retry_count(),
            retry_delay: default_retry_delay(),
            expected_code: default_expected_code(),
        }
    }
}

/// Configuration of a system task, run through a registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub handler_name: String,
    #[serde(default)]
    pub parameters: Params,
    #[serde(default = "default_timeout", with = "duration_nanos")]
    pub timeout: Duration,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay", with = "duration_nanos")]
    pub retry_delay: Duration,
}

impl SystemConfig {
    pub fn new(handler_name: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.into(),
            parameters: Params::new(),
            timeout: default_timeout(),
            retry_count: default_retry_count(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Type-specific part of a task, encoded as `"type"` plus `"config"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum TaskKind {
    Http(HttpConfig),
    System(SystemConfig),
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Http(_) => TaskType::Http,
            Self::System(_) => TaskType::System,
        }
    }

    /// Whole-execution timeout, retries included. Zero means "use the default".
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Http(c) => c.timeout,
            Self::System(c) => c.timeout,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Http(c) => c.retry_count,
            Self::System(c) => c.retry_count,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        match self {
            Self::Http(c) => c.retry_delay,
            Self::System(c) => c.retry_delay,
        }
    }
}

/// A schedulable unit: a cron expression plus what to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: String,
    pub cron: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl Task {
    /// Build an active task with a fresh id.
    pub fn new(name: impl Into<String>, cron: impl Into<String>, kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            created_by: String::new(),
            cron: cron.into(),
            status: TaskStatus::Active,
            created_at: now,
            updated_at: now,
            kind,
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Result of a single fire, persisted to the execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub task_id: String,
    pub status: ExecStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    /// Index of the attempt that produced this result.
    #[serde(default)]
    pub retry: u32,
}

impl ExecResult {
    pub(crate) fn running(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: ExecStatus::Running,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            output: String::new(),
            error: String::new(),
            retry: 0,
        }
    }

    /// Stamp the end time and derive the duration from it.
    pub(crate) fn finish(&mut self) {
        self.end_time = Utc::now().max(self.start_time);
        self.duration = (self.end_time - self.start_time)
            .to_std()
            .unwrap_or_default();
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Success
    }
}

/// Aggregated counters for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_id: String,
    pub run_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub last_run_time: Option<DateTime<Utc>>,
    /// Moving average over completed fires, in milliseconds.
    pub avg_duration_ms: f64,
}

impl TaskStats {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    /// Fold a finished result into the counters.
    ///
    /// `run_count` is reconciled to `success_count + failed_count` so the
    /// identity holds after every update.
    pub fn apply(&mut self, result: &ExecResult) {
        if result.is_success() {
            self.success_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.run_count = self.success_count + self.failed_count;
        self.last_run_time = Some(result.start_time);

        #[allow(clippy::cast_precision_loss, reason = "counts stay far below 2^52")]
        let completed = self.run_count as f64;
        let duration_ms = result.duration.as_secs_f64() * 1000.0;
        self.avg_duration_ms = (self.avg_duration_ms * (completed - 1.0) + duration_ms) / completed;
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_expected_code() -> u16 {
    200
}

/// `Duration` encoded as an integer count of nanoseconds.
pub mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        // negative values are clamped to zero
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(0)))
    }
}
