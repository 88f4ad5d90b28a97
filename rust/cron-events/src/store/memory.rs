//! In-process store with the same semantics as the Redis backend.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::keys::{history_id, is_history_of};
use super::{EventFilter, EventMetrics, HistoryFilter, Page, Store, TaskFilter};
use crate::error::{Error, Result};
use crate::events::{DelayedEvent, EventRecord, EventStatus};
use crate::scheduler::task::{ExecResult, Task, TaskStats, TaskStatus};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    stats: HashMap<String, TaskStats>,
    /// history id -> (result, expiry)
    history: HashMap<String, (ExecResult, DateTime<Utc>)>,
    delayed: HashMap<String, DelayedEvent>,
    /// Newest at the front.
    records: VecDeque<EventRecord>,
    sequence: u64,
}

#[derive(Debug)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    history_ttl: Duration,
    retention: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// 30-day history TTL, 10 000 retained records.
    pub fn new() -> Self {
        Self::with_limits(Duration::from_secs(30 * 24 * 3600), 10_000)
    }

    pub fn with_limits(history_ttl: Duration, retention: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            history_ttl,
            retention: retention.max(1),
        }
    }

    fn live_history(inner: &Inner) -> impl Iterator<Item = (&String, &ExecResult)> {
        let now = Utc::now();
        inner
            .history
            .iter()
            .filter(move |(_, (_, expires))| *expires > now)
            .map(|(id, (result, _))| (id, result))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::conflict("task", &task.id));
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        inner
            .stats
            .insert(task.id.clone(), TaskStats::new(&task.id));
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(Error::not_found("task", &task.id)),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        self.inner
            .read()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", id))
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.tasks.contains_key(id) {
            return Err(Error::not_found("task", id));
        }
        inner.history.retain(|hid, _| !is_history_of(hid, id));
        inner.stats.remove(id);
        inner.tasks.remove(id);
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Page<Task>> {
        let mut tasks: Vec<Task> = self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Page::paginate(tasks, filter.page, filter.page_size))
    }

    async fn all_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.inner.read().tasks.values().cloned().collect())
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        task.set_status(status);
        Ok(())
    }

    async fn get_status(&self, id: &str) -> Result<TaskStatus> {
        self.inner
            .read()
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| Error::not_found("task", id))
    }

    async fn append_result(&self, result: &ExecResult) -> Result<()> {
        let ttl = chrono::Duration::from_std(self.history_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.history.retain(|_, (_, expires)| *expires > now);
        inner.history.insert(
            history_id(&result.task_id, result.start_time),
            (result.clone(), now + ttl),
        );
        Ok(())
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<Page<ExecResult>> {
        let inner = self.inner.read();
        let mut results: Vec<ExecResult> = Self::live_history(&inner)
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(Page::paginate(results, filter.page, filter.page_size))
    }

    async fn last_result(&self, task_id: &str) -> Result<Option<ExecResult>> {
        let inner = self.inner.read();
        Ok(Self::live_history(&inner)
            .map(|(_, r)| r)
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.start_time)
            .cloned())
    }

    async fn get_stats(&self, task_id: &str) -> Result<TaskStats> {
        Ok(self
            .inner
            .read()
            .stats
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| TaskStats::new(task_id)))
    }

    async fn incr_run_count(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let stats = inner
            .stats
            .entry(task_id.to_string())
            .or_insert_with(|| TaskStats::new(task_id));
        stats.run_count += 1;
        Ok(())
    }

    async fn set_last_run_time(&self, task_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        let stats = inner
            .stats
            .entry(task_id.to_string())
            .or_insert_with(|| TaskStats::new(task_id));
        stats.last_run_time = Some(at);
        Ok(())
    }

    async fn update_after_result(&self, result: &ExecResult) -> Result<TaskStats> {
        let mut inner = self.inner.write();
        let stats = inner
            .stats
            .entry(result.task_id.clone())
            .or_insert_with(|| TaskStats::new(&result.task_id));
        stats.apply(result);
        Ok(stats.clone())
    }

    async fn put_delayed(&self, event: &DelayedEvent) -> Result<()> {
        self.inner
            .write()
            .delayed
            .insert(event.id().to_string(), event.clone());
        Ok(())
    }

    async fn get_delayed(&self, id: &str) -> Result<DelayedEvent> {
        self.inner
            .read()
            .delayed
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("delayed event", id))
    }

    async fn update_delayed(&self, event: &DelayedEvent) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.delayed.get_mut(event.id()) {
            Some(slot) => {
                *slot = event.clone();
                Ok(())
            }
            None => Err(Error::not_found("delayed event", event.id())),
        }
    }

    async fn delete_delayed(&self, id: &str) -> Result<()> {
        self.inner.write().delayed.remove(id);
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DelayedEvent>> {
        let mut due: Vec<DelayedEvent> = self
            .inner
            .read()
            .delayed
            .values()
            .filter(|e| e.status == EventStatus::Pending && e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.delay_until
                .cmp(&b.delay_until)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn list_delayed(&self, filter: &EventFilter) -> Result<Page<DelayedEvent>> {
        let mut events: Vec<DelayedEvent> = self
            .inner
            .read()
            .delayed
            .values()
            .filter(|e| filter.matches_delayed(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.delay_until.cmp(&b.delay_until));
        Ok(Page::paginate(events, filter.page, filter.page_size))
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write();
        let count = inner.delayed.len();
        inner.delayed.retain(|_, e| {
            !(matches!(e.status, EventStatus::Failed | EventStatus::Expired)
                && e.updated_at < before)
        });
        Ok(count - inner.delayed.len())
    }

    async fn put_record(&self, record: &EventRecord) -> Result<String> {
        let mut inner = self.inner.write();
        inner.sequence += 1;
        let mut record = record.clone();
        record.id = format!("record_{}", inner.sequence);
        let id = record.id.clone();
        inner.records.push_front(record);
        inner.records.truncate(self.retention);
        Ok(id)
    }

    async fn list_records(&self, filter: &EventFilter) -> Result<Page<EventRecord>> {
        let records: Vec<EventRecord> = self
            .inner
            .read()
            .records
            .iter()
            .filter(|r| filter.matches_record(r))
            .cloned()
            .collect();
        Ok(Page::paginate(records, filter.page, filter.page_size))
    }

    async fn metrics(&self) -> Result<EventMetrics> {
        let mut metrics = EventMetrics::default();
        for event in self.inner.read().delayed.values() {
            metrics.count(event.status);
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::events::Event;
    use crate::scheduler::task::{ExecStatus, HttpConfig, TaskKind};

    fn http_task(name: &str) -> Task {
        Task::new(name, "0 * * * * *", TaskKind::Http(HttpConfig::new("http://localhost")))
    }

    fn delayed(offset_secs: i64) -> DelayedEvent {
        DelayedEvent::new(
            Event::new("test.event", json!({}), "tests"),
            Utc::now() + ChronoDuration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn test_task_crud() {
        let store = InMemoryStore::new();
        let mut task = http_task("ping");

        store.create_task(&task).await.unwrap();
        assert!(matches!(
            store.create_task(&task).await,
            Err(Error::Conflict { .. })
        ));

        task.name = "ping v2".into();
        store.update_task(&task).await.unwrap();
        assert_eq!(store.get_task(&task.id).await.unwrap(), task);

        store.set_status(&task.id, TaskStatus::Paused).await.unwrap();
        assert_eq!(store.get_status(&task.id).await.unwrap(), TaskStatus::Paused);

        store.delete_task(&task.id).await.unwrap();
        assert!(store.get_task(&task.id).await.unwrap_err().is_not_found());
        assert!(store.delete_task(&task.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_tasks_filters_and_orders() {
        let store = InMemoryStore::new();
        let mut older = http_task("nightly backup");
        older.created_at -= ChronoDuration::hours(1);
        let newer = http_task("hourly ping");
        store.create_task(&older).await.unwrap();
        store.create_task(&newer).await.unwrap();

        let page = store.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, newer.id);

        let filter = TaskFilter {
            keyword: Some("BACKUP".into()),
            ..TaskFilter::default()
        };
        let page = store.list_tasks(&filter).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, older.id);
    }

    #[tokio::test]
    async fn test_history_and_delete_cascade() {
        let store = InMemoryStore::new();
        let task = http_task("ping");
        store.create_task(&task).await.unwrap();

        for status in [ExecStatus::Success, ExecStatus::Failed] {
            let mut result = ExecResult::running(&task.id);
            result.status = status;
            result.finish();
            store.append_result(&result).await.unwrap();
            store.update_after_result(&result).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let history = store
            .list_history(&HistoryFilter::for_task(&task.id))
            .await
            .unwrap();
        assert_eq!(history.total, 2);
        assert_eq!(history.items[0].status, ExecStatus::Failed);
        assert_eq!(
            store.last_result(&task.id).await.unwrap().unwrap().status,
            ExecStatus::Failed
        );

        let stats = store.get_stats(&task.id).await.unwrap();
        assert_eq!(stats.run_count, 2);
        assert_eq!(stats.success_count, 1);

        store.delete_task(&task.id).await.unwrap();
        assert!(store.last_result(&task.id).await.unwrap().is_none());
        assert_eq!(store.get_stats(&task.id).await.unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn test_expired_history_is_hidden() {
        let store = InMemoryStore::with_limits(std::time::Duration::ZERO, 10);
        let mut result = ExecResult::running("t");
        result.finish();
        store.append_result(&result).await.unwrap();
        assert!(store.last_result("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_prunes_expired_history() {
        let store = InMemoryStore::with_limits(std::time::Duration::ZERO, 10);
        for _ in 0..3 {
            let mut result = ExecResult::running("t");
            result.finish();
            store.append_result(&result).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(store.inner.read().history.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_due_returns_only_due_pending() {
        let store = InMemoryStore::new();
        let due = delayed(-5);
        let later = delayed(60);
        let mut delivered = delayed(-10);
        delivered.set_status(EventStatus::Delivered);
        for e in [&due, &later, &delivered] {
            store.put_delayed(e).await.unwrap();
        }

        let popped = store.pop_due(Utc::now(), 10).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].id(), due.id());
        // entries stay in place until their status changes
        assert_eq!(store.pop_due(Utc::now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_terminal_events() {
        let store = InMemoryStore::new();
        let mut failed = delayed(-100);
        failed.status = EventStatus::Failed;
        failed.updated_at = Utc::now() - ChronoDuration::hours(2);
        let mut pending = delayed(-100);
        pending.updated_at = Utc::now() - ChronoDuration::hours(2);
        store.put_delayed(&failed).await.unwrap();
        store.put_delayed(&pending).await.unwrap();

        let removed = store
            .cleanup(Utc::now() - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_delayed(failed.id()).await.is_err());
        assert!(store.get_delayed(pending.id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_records_are_bounded() {
        let store = InMemoryStore::with_limits(std::time::Duration::from_secs(60), 3);
        let mut event = delayed(-1);
        event.set_status(EventStatus::Delivered);
        for _ in 0..5 {
            store
                .put_record(&EventRecord::from_delayed(&event, ""))
                .await
                .unwrap();
        }

        let page = store.list_records(&EventFilter::default()).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].id, "record_5");
    }

    #[tokio::test]
    async fn test_metrics_by_status() {
        let store = InMemoryStore::new();
        let mut failed = delayed(1);
        failed.status = EventStatus::Failed;
        store.put_delayed(&delayed(1)).await.unwrap();
        store.put_delayed(&failed).await.unwrap();

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.total_events, 2);
        assert_eq!(metrics.pending_events, 1);
        assert_eq!(metrics.failed_events, 1);
    }
}
