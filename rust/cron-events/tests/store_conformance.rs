//! Store behaviour shared by every backend.
//!
//! Each test runs against the in-memory store, and against Redis as well
//! when `REDIS_URL` is set. Redis runs use a fresh key prefix that is
//! removed afterwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;

use cron_events::events::{DelayedEvent, Event, EventRecord, EventStatus};
use cron_events::scheduler::task::{ExecResult, ExecStatus, HttpConfig, Task, TaskKind};
use cron_events::store::{
    EventFilter, HistoryFilter, InMemoryStore, RedisStore, SharedStore, Store,
};

const HISTORY_TTL: Duration = Duration::from_secs(24 * 3600);
const RETENTION: usize = 3;

struct Backend {
    name: &'static str,
    store: SharedStore,
    redis: Option<(String, String)>,
}

impl Backend {
    async fn cleanup(self) {
        let Some((url, prefix)) = self.redis else {
            return;
        };
        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut conn)
            .await
            .unwrap();
        if !keys.is_empty() {
            let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await.unwrap();
        }
    }
}

async fn backends() -> Vec<Backend> {
    let mut backends = vec![Backend {
        name: "memory",
        store: Arc::new(InMemoryStore::with_limits(HISTORY_TTL, RETENTION)),
        redis: None,
    }];

    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let prefix = format!("cron-events-test:{}:", uuid::Uuid::new_v4());
            let store = RedisStore::connect(&url, &prefix)
                .await
                .unwrap()
                .with_limits(HISTORY_TTL, RETENTION);
            backends.push(Backend {
                name: "redis",
                store: Arc::new(store),
                redis: Some((url, prefix)),
            });
        }
        Err(_) => eprintln!("Skipping Redis backend: REDIS_URL not set"),
    }
    backends
}

fn http_task(id: &str) -> Task {
    let mut task = Task::new(id, "0 * * * * *", TaskKind::Http(HttpConfig::new("http://localhost")));
    task.id = id.to_string();
    task
}

fn result(task_id: &str, start: DateTime<Utc>, status: ExecStatus, millis: u64) -> ExecResult {
    let duration = Duration::from_millis(millis);
    ExecResult {
        task_id: task_id.to_string(),
        status,
        start_time: start,
        end_time: start + ChronoDuration::milliseconds(i64::try_from(millis).unwrap()),
        duration,
        output: String::new(),
        error: String::new(),
        retry: 0,
    }
}

fn delayed(due: DateTime<Utc>, status: EventStatus) -> DelayedEvent {
    let mut event = DelayedEvent::new(Event::new("order.timeout", json!({}), "orders"), due);
    event.status = status;
    event
}

#[tokio::test]
async fn test_pop_due_skips_terminal_entries_across_pages() {
    for backend in backends().await {
        let store = &backend.store;
        let now = Utc::now();

        // more terminal entries than one index page, all ahead of the pending one
        for _ in 0..250 {
            store
                .put_delayed(&delayed(now - ChronoDuration::seconds(100), EventStatus::Delivered))
                .await
                .unwrap();
        }
        let pending = delayed(now - ChronoDuration::seconds(10), EventStatus::Pending);
        let future = delayed(now + ChronoDuration::hours(1), EventStatus::Pending);
        store.put_delayed(&pending).await.unwrap();
        store.put_delayed(&future).await.unwrap();

        let due = store.pop_due(now, 10).await.unwrap();
        assert_eq!(due.len(), 1, "{}", backend.name);
        assert_eq!(due[0].id(), pending.id(), "{}", backend.name);

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.total_events, 252, "{}", backend.name);
        assert_eq!(metrics.pending_events, 2, "{}", backend.name);
        assert_eq!(metrics.delivered_events, 250, "{}", backend.name);

        backend.cleanup().await;
    }
}

#[tokio::test]
async fn test_cleanup_removes_only_stale_terminal_events() {
    for backend in backends().await {
        let store = &backend.store;
        let now = Utc::now();
        let due = now - ChronoDuration::hours(3);

        let mut stale = Vec::new();
        for status in [EventStatus::Failed, EventStatus::Expired] {
            let mut event = delayed(due, status);
            event.updated_at = now - ChronoDuration::hours(2);
            store.put_delayed(&event).await.unwrap();
            stale.push(event);
        }
        let mut old_pending = delayed(due, EventStatus::Pending);
        old_pending.updated_at = now - ChronoDuration::hours(2);
        let recent_failure = delayed(due, EventStatus::Failed);
        store.put_delayed(&old_pending).await.unwrap();
        store.put_delayed(&recent_failure).await.unwrap();

        let removed = store.cleanup(now - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(removed, 2, "{}", backend.name);
        for event in &stale {
            assert!(store.get_delayed(event.id()).await.unwrap_err().is_not_found());
        }
        assert!(store.get_delayed(old_pending.id()).await.is_ok());
        assert!(store.get_delayed(recent_failure.id()).await.is_ok());
        assert_eq!(store.metrics().await.unwrap().total_events, 2, "{}", backend.name);

        backend.cleanup().await;
    }
}

#[tokio::test]
async fn test_history_window_and_task_filter() {
    for backend in backends().await {
        let store = &backend.store;
        let now = Utc::now();
        let job = http_task("job");
        let sibling = http_task("job_b");
        store.create_task(&job).await.unwrap();
        store.create_task(&sibling).await.unwrap();

        for hours in [3, 2, 1] {
            let start = now - ChronoDuration::hours(hours);
            store
                .append_result(&result("job", start, ExecStatus::Success, 10))
                .await
                .unwrap();
        }
        store
            .append_result(&result("job_b", now, ExecStatus::Failed, 10))
            .await
            .unwrap();

        let mut filter = HistoryFilter::for_task("job");
        filter.start_time = Some(now - ChronoDuration::minutes(150));
        filter.end_time = Some(now - ChronoDuration::minutes(30));
        let page = store.list_history(&filter).await.unwrap();
        assert_eq!(page.total, 2, "{}", backend.name);
        assert!(page.items.iter().all(|r| r.task_id == "job"));
        assert!(page.items[0].start_time > page.items[1].start_time);

        let all = store.list_history(&HistoryFilter::for_task("job")).await.unwrap();
        assert_eq!(all.total, 3, "{}", backend.name);

        let last = store.last_result("job").await.unwrap().unwrap();
        assert_eq!(last.task_id, "job", "{}", backend.name);
        assert_eq!(last.start_time, now - ChronoDuration::hours(1));

        // deleting one task leaves the other's history alone
        store.delete_task("job").await.unwrap();
        assert!(store.last_result("job").await.unwrap().is_none());
        let survivor = store.last_result("job_b").await.unwrap().unwrap();
        assert_eq!(survivor.status, ExecStatus::Failed, "{}", backend.name);

        backend.cleanup().await;
    }
}

#[tokio::test]
async fn test_records_keep_newest_within_retention() {
    for backend in backends().await {
        let store = &backend.store;
        let event = delayed(Utc::now(), EventStatus::Delivered);

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.put_record(&EventRecord::from_delayed(&event, "")).await.unwrap());
        }
        assert_eq!(ids.last().map(String::as_str), Some("record_5"));

        let page = store.list_records(&EventFilter::default()).await.unwrap();
        assert_eq!(page.total, RETENTION, "{}", backend.name);
        let kept: Vec<&str> = page.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(kept, vec!["record_5", "record_4", "record_3"], "{}", backend.name);

        backend.cleanup().await;
    }
}

#[tokio::test]
async fn test_stats_fold_results() {
    for backend in backends().await {
        let store = &backend.store;
        let task = http_task("stats");
        store.create_task(&task).await.unwrap();

        let first = Utc::now() - ChronoDuration::seconds(5);
        let second = Utc::now();
        store
            .update_after_result(&result("stats", first, ExecStatus::Success, 100))
            .await
            .unwrap();
        let returned = store
            .update_after_result(&result("stats", second, ExecStatus::Timeout, 300))
            .await
            .unwrap();

        let stats = store.get_stats("stats").await.unwrap();
        assert_eq!(stats, returned, "{}", backend.name);
        assert_eq!(stats.run_count, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.success_count + stats.failed_count, stats.run_count);
        assert!((stats.avg_duration_ms - 200.0).abs() < 1e-6, "{}", backend.name);
        assert_eq!(stats.last_run_time, Some(second), "{}", backend.name);

        backend.cleanup().await;
    }
}
