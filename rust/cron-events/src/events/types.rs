//! Event envelopes, delayed events and the audit record written for them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const EVENT_VERSION: &str = "1.0";

// Cron task lifecycle
pub const CRON_TASK_CREATED: &str = "cron.task.created";
pub const CRON_TASK_UPDATED: &str = "cron.task.updated";
pub const CRON_TASK_DELETED: &str = "cron.task.deleted";
pub const CRON_TASK_EXECUTED: &str = "cron.task.executed";
pub const CRON_TASK_COMPLETED: &str = "cron.task.completed";
pub const CRON_TASK_FAILED: &str = "cron.task.failed";
pub const CRON_TASK_DELAYED_EXECUTE: &str = "cron.task.delayed_execute";

// System lifecycle
pub const SYSTEM_STARTUP: &str = "system.startup";
pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";
pub const SYSTEM_ERROR: &str = "system.error";
pub const SYSTEM_WARNING: &str = "system.warning";

/// An immutable event. Handlers receive it by reference and never mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
            version: EVENT_VERSION.to_string(),
        }
    }

    /// Replace the generated id, e.g. to correlate with an upstream entity.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

fn default_version() -> String {
    EVENT_VERSION.to_string()
}

/// Delivery priority, encoded as 1/5/8/10.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        match p {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 8,
            Priority::Critical => 10,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            1 => Ok(Self::Low),
            5 => Ok(Self::Normal),
            8 => Ok(Self::High),
            10 => Ok(Self::Critical),
            other => Err(format!("unknown priority {other}")),
        }
    }
}

/// Delivery status of a delayed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(Error::InvalidConfig(format!("unknown event status '{other}'"))),
        }
    }
}

/// An event whose delivery is deferred until `delay_until`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedEvent {
    #[serde(flatten)]
    pub event: Event,
    pub delay_until: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DelayedEvent {
    /// Wrap an event as pending with normal priority and three retries.
    pub fn new(event: Event, delay_until: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            event,
            delay_until,
            priority: Priority::Normal,
            max_retries: 3,
            retry_count: 0,
            status: EventStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delay_until <= now
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn set_status(&mut self, status: EventStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Audit record of a delayed event that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Assigned by the store (`record_<seq>`).
    #[serde(default)]
    pub id: String,
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payload as JSON text.
    pub payload: String,
    pub source: String,
    pub delay_until: DateTime<Utc>,
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_count: u32,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl EventRecord {
    pub fn from_delayed(event: &DelayedEvent, error: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            event_id: event.event.id.clone(),
            event_type: event.event.event_type.clone(),
            payload: event.event.payload.to_string(),
            source: event.event.source.clone(),
            delay_until: event.delay_until,
            priority: event.priority,
            max_retries: event.max_retries,
            retry_count: event.retry_count,
            status: event.status,
            created_at: event.created_at,
            updated_at: event.updated_at,
            processed_at: Some(Utc::now()),
            error: error.into(),
        }
    }
}
