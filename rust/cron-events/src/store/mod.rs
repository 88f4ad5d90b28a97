//! Durable persistence of tasks, execution history, statistics, delayed
//! events and event records.
//!
//! The [`Store`] trait holds no business logic. Backend errors surface as
//! [`Error::BackendUnavailable`](crate::Error::BackendUnavailable) and are
//! never retried here.
//!
//! - [`RedisStore`]: the production backend.
//! - [`InMemoryStore`]: same semantics, used by tests and `--memory-store`.

mod keys;
pub mod memory;
pub mod redis;

pub use self::keys::Keys;
pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{DelayedEvent, EventRecord, EventStatus, Priority};
use crate::scheduler::task::{ExecResult, ExecStatus, Task, TaskStats, TaskStatus, TaskType};

const MAX_PAGE_SIZE: usize = 100;

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matches before pagination.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    /// Cut `page` out of an already filtered and ordered list.
    pub fn paginate(all: Vec<T>, page: usize, page_size: usize) -> Self {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        Self {
            items,
            total,
            page,
            page_size,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFilter {
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    /// Case-insensitive substring of name or description.
    pub keyword: Option<String>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            task_type: None,
            status: None,
            keyword: None,
            page: 1,
            page_size: 10,
        }
    }
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if self.task_type.is_some_and(|t| t != task.task_type()) {
            return false;
        }
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        match self.keyword.as_deref().map(str::to_lowercase) {
            Some(keyword) if !keyword.is_empty() => {
                task.name.to_lowercase().contains(&keyword)
                    || task.description.to_lowercase().contains(&keyword)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub task_id: Option<String>,
    pub status: Option<ExecStatus>,
    /// Inclusive lower bound on `start_time`.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `start_time`.
    pub end_time: Option<DateTime<Utc>>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            task_id: None,
            status: None,
            start_time: None,
            end_time: None,
            page: 1,
            page_size: 10,
        }
    }
}

impl HistoryFilter {
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, result: &ExecResult) -> bool {
        self.task_id.as_ref().is_none_or(|id| *id == result.task_id)
            && self.status.is_none_or(|s| s == result.status)
            && self.start_time.is_none_or(|t| result.start_time >= t)
            && self.end_time.is_none_or(|t| result.start_time <= t)
    }
}

/// Filter over delayed events (time window on `delay_until`) and event
/// records (time window on `created_at`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    pub types: Vec<String>,
    pub sources: Vec<String>,
    pub status: Option<EventStatus>,
    pub priority: Option<Priority>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            sources: Vec::new(),
            status: None,
            priority: None,
            start_time: None,
            end_time: None,
            page: 1,
            page_size: 20,
        }
    }
}

impl EventFilter {
    fn matches_fields(
        &self,
        event_type: &str,
        source: &str,
        status: EventStatus,
        priority: Priority,
        at: DateTime<Utc>,
    ) -> bool {
        (self.types.is_empty() || self.types.iter().any(|t| t == event_type))
            && (self.sources.is_empty() || self.sources.iter().any(|s| s == source))
            && self.status.is_none_or(|s| s == status)
            && self.priority.is_none_or(|p| p == priority)
            && self.start_time.is_none_or(|t| at >= t)
            && self.end_time.is_none_or(|t| at <= t)
    }

    pub fn matches_delayed(&self, event: &DelayedEvent) -> bool {
        self.matches_fields(
            &event.event.event_type,
            &event.event.source,
            event.status,
            event.priority,
            event.delay_until,
        )
    }

    pub fn matches_record(&self, record: &EventRecord) -> bool {
        self.matches_fields(
            &record.event_type,
            &record.source,
            record.status,
            record.priority,
            record.created_at,
        )
    }
}

/// Delayed event counters by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetrics {
    pub total_events: u64,
    pub pending_events: u64,
    pub delivered_events: u64,
    pub failed_events: u64,
    pub expired_events: u64,
}

impl EventMetrics {
    pub(crate) fn count(&mut self, status: EventStatus) {
        self.total_events += 1;
        match status {
            EventStatus::Pending => self.pending_events += 1,
            EventStatus::Delivered => self.delivered_events += 1,
            EventStatus::Failed => self.failed_events += 1,
            EventStatus::Expired => self.expired_events += 1,
        }
    }
}

/// Persistence operations used by the scheduler and the delayed service.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    // Tasks

    /// Persist a new task and zeroed stats. `Conflict` if the id exists.
    async fn create_task(&self, task: &Task) -> Result<()>;

    /// Overwrite an existing task. `NotFound` if absent.
    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Task>;

    /// Remove history, then stats, then the record and its index entry.
    async fn delete_task(&self, id: &str) -> Result<()>;

    /// Filtered page ordered by creation time, newest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Page<Task>>;

    /// Every stored task, unpaginated.
    async fn all_tasks(&self) -> Result<Vec<Task>>;

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()>;

    async fn get_status(&self, id: &str) -> Result<TaskStatus>;

    // Execution history

    async fn append_result(&self, result: &ExecResult) -> Result<()>;

    /// Filtered page ordered by start time, newest first.
    async fn list_history(&self, filter: &HistoryFilter) -> Result<Page<ExecResult>>;

    async fn last_result(&self, task_id: &str) -> Result<Option<ExecResult>>;

    // Stats

    /// Zeroed stats when none were recorded yet.
    async fn get_stats(&self, task_id: &str) -> Result<TaskStats>;

    async fn incr_run_count(&self, task_id: &str) -> Result<()>;

    async fn set_last_run_time(&self, task_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Atomically fold a finished result into the stats. See [`TaskStats::apply`].
    async fn update_after_result(&self, result: &ExecResult) -> Result<TaskStats>;

    // Delayed events

    async fn put_delayed(&self, event: &DelayedEvent) -> Result<()>;

    async fn get_delayed(&self, id: &str) -> Result<DelayedEvent>;

    /// Overwrite an existing delayed event and re-index its due time.
    async fn update_delayed(&self, event: &DelayedEvent) -> Result<()>;

    /// Remove a delayed event. Absent ids are not an error.
    async fn delete_delayed(&self, id: &str) -> Result<()>;

    /// Up to `limit` pending events due at or before `now`, earliest first.
    /// Entries are left in place; the caller records the new status.
    async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DelayedEvent>>;

    async fn list_delayed(&self, filter: &EventFilter) -> Result<Page<DelayedEvent>>;

    /// Delete failed and expired events last updated before `before`.
    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize>;

    // Event records

    /// Append a record, assigning its id. Only the newest `retention` are kept.
    async fn put_record(&self, record: &EventRecord) -> Result<String>;

    /// Filtered page, newest first.
    async fn list_records(&self, filter: &EventFilter) -> Result<Page<EventRecord>>;

    async fn metrics(&self) -> Result<EventMetrics>;
}

pub type SharedStore = Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate() {
        let page = Page::paginate((1..=25).collect::<Vec<_>>(), 3, 10);
        assert_eq!(page.items, vec![21, 22, 23, 24, 25]);
        assert_eq!(page.total, 25);

        let page = Page::paginate(vec![1, 2, 3], 0, 0);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 1);
        assert_eq!(page.items, vec![1]);
    }

    #[test]
    fn test_metrics_count() {
        let mut metrics = EventMetrics::default();
        metrics.count(EventStatus::Pending);
        metrics.count(EventStatus::Failed);
        assert_eq!(metrics.total_events, 2);
        assert_eq!(metrics.pending_events, 1);
        assert_eq!(metrics.failed_events, 1);
    }
}
