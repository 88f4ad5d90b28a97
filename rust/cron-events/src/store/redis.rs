//! Redis backend.
//!
//! Layout (all keys under the optional prefix):
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `cron:task:<id>` | hash | `data` (JSON) plus `type`, `status`, `created_at` |
//! | `cron:tasks` | set | task ids |
//! | `cron:stats:<id>` | hash | counters, last run time, average duration |
//! | `cron:history:<task>_<nanos>` | string, TTL | JSON execution result |
//! | `cron:history_list` | zset | history ids by start time (unix seconds) |
//! | `event:delayed:<id>` | hash | `data` (JSON) plus denormalized columns |
//! | `event:delayed:list` | zset | delayed event ids by due time (unix seconds) |
//! | `event:records:<id>` | hash | `data` (JSON) plus `type`, `status` |
//! | `event:records:list` | list | record ids, newest at the head |
//! | `event:sequence` | counter | record sequence |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;

use super::keys::{Keys, history_id, is_history_of};
use super::{EventFilter, EventMetrics, HistoryFilter, Page, Store, TaskFilter};
use crate::error::{Error, Result};
use crate::events::{DelayedEvent, EventRecord, EventStatus};
use crate::scheduler::task::{ExecResult, Task, TaskStats, TaskStatus};

/// Ids examined per round trip when paging through a sorted-set index.
const SCAN_CHUNK: isize = 200;

/// Folds one result into the stats hash and returns the whole hash.
const UPDATE_STATS_LUA: &str = r"
local key = KEYS[1]
local ok = tonumber(ARGV[1])
local duration_ms = tonumber(ARGV[2])
if ok == 1 then
  redis.call('HINCRBY', key, 'success_count', 1)
else
  redis.call('HINCRBY', key, 'failed_count', 1)
end
local success = tonumber(redis.call('HGET', key, 'success_count') or '0')
local failed = tonumber(redis.call('HGET', key, 'failed_count') or '0')
local completed = success + failed
local avg = tonumber(redis.call('HGET', key, 'avg_duration_ms') or '0')
avg = (avg * (completed - 1) + duration_ms) / completed
redis.call('HSET', key, 'run_count', completed, 'avg_duration_ms', tostring(avg), 'last_run_time', ARGV[3])
return redis.call('HGETALL', key)
";

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keys,
    history_ttl: Duration,
    retention: usize,
    stats_script: Arc<Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("keys", &self.keys)
            .field("history_ttl", &self.history_ttl)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Open a managed connection. The manager reconnects on its own.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, Keys::new(key_prefix)))
    }

    pub fn new(conn: ConnectionManager, keys: Keys) -> Self {
        Self {
            conn,
            keys,
            history_ttl: Duration::from_secs(30 * 24 * 3600),
            retention: 10_000,
            stats_script: Arc::new(Script::new(UPDATE_STATS_LUA)),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, history_ttl: Duration, retention: usize) -> Self {
        self.history_ttl = history_ttl;
        self.retention = retention.max(1);
        self
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Score below which every history entry has outlived its TTL.
    fn history_floor(&self) -> i64 {
        let ttl = i64::try_from(self.history_ttl.as_secs()).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_sub(ttl)
    }

    /// Fetch one hash field from many keys in a single round trip.
    async fn hget_many(&self, keys: &[String], field: &str) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hget(key, field);
        }
        let mut conn = self.conn();
        Ok(pipe.query_async(&mut conn).await?)
    }

    async fn load_tasks(&self, ids: &[String]) -> Result<Vec<Task>> {
        let keys: Vec<String> = ids.iter().map(|id| self.keys.task(id)).collect();
        let raw = self.hget_many(&keys, "data").await?;
        Ok(ids
            .iter()
            .zip(raw)
            .filter_map(|(id, data)| decode("task", id, data))
            .collect())
    }

    async fn load_delayed(&self, ids: &[String]) -> Result<Vec<DelayedEvent>> {
        let keys: Vec<String> = ids.iter().map(|id| self.keys.delayed(id)).collect();
        let raw = self.hget_many(&keys, "data").await?;
        Ok(ids
            .iter()
            .zip(raw)
            .filter_map(|(id, data)| decode("delayed event", id, data))
            .collect())
    }

    async fn write_task(&self, task: &Task) -> Result<()> {
        let fields = task_fields(task)?;
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(self.keys.task(&task.id), &fields).await?;
        Ok(())
    }

    async fn write_delayed(&self, event: &DelayedEvent) -> Result<()> {
        let fields = delayed_fields(event)?;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.delayed(event.id()), &fields)
            .ignore()
            .zadd(
                self.keys.delayed_list(),
                event.id(),
                event.delay_until.timestamp(),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delayed_exists(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.hexists(self.keys.delayed(id), "data").await?)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn();
        let exists: bool = conn.sismember(self.keys.tasks(), &task.id).await?;
        if exists {
            return Err(Error::conflict("task", &task.id));
        }

        let fields = task_fields(task)?;
        let stats = [
            ("run_count", "0"),
            ("success_count", "0"),
            ("failed_count", "0"),
            ("avg_duration_ms", "0"),
        ];
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.task(&task.id), &fields)
            .ignore()
            .sadd(self.keys.tasks(), &task.id)
            .ignore()
            .hset_multiple(self.keys.stats(&task.id), &stats)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(task_id = %task.id, "Task stored");
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn();
        let exists: bool = conn.sismember(self.keys.tasks(), &task.id).await?;
        if !exists {
            return Err(Error::not_found("task", &task.id));
        }
        self.write_task(task).await
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let mut conn = self.conn();
        let data: Option<String> = conn.hget(self.keys.task(id), "data").await?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(Error::not_found("task", id)),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let exists: bool = conn.sismember(self.keys.tasks(), id).await?;
        if !exists {
            return Err(Error::not_found("task", id));
        }

        let history: Vec<String> = conn.zrange(self.keys.history_list(), 0, -1).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for hid in history.iter().filter(|h| is_history_of(h, id)) {
            pipe.del(self.keys.history(hid))
                .ignore()
                .zrem(self.keys.history_list(), hid)
                .ignore();
        }
        pipe.del(self.keys.stats(id))
            .ignore()
            .del(self.keys.task(id))
            .ignore()
            .srem(self.keys.tasks(), id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!(task_id = %id, "Task and derived state deleted");
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Page<Task>> {
        let mut tasks: Vec<Task> = self
            .all_tasks()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Page::paginate(tasks, filter.page, filter.page_size))
    }

    async fn all_tasks(&self) -> Result<Vec<Task>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(self.keys.tasks()).await?;
        self.load_tasks(&ids).await
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut task = self.get_task(id).await?;
        task.set_status(status);
        self.write_task(&task).await
    }

    async fn get_status(&self, id: &str) -> Result<TaskStatus> {
        let mut conn = self.conn();
        let status: Option<String> = conn.hget(self.keys.task(id), "status").await?;
        match status {
            Some(status) => status.parse(),
            None => Err(Error::not_found("task", id)),
        }
    }

    async fn append_result(&self, result: &ExecResult) -> Result<()> {
        let hid = history_id(&result.task_id, result.start_time);
        let data = serde_json::to_string(result)?;
        let ttl = self.history_ttl.as_secs().max(1);

        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.keys.history(&hid), data, ttl)
            .ignore()
            .zadd(
                self.keys.history_list(),
                &hid,
                result.start_time.timestamp(),
            )
            .ignore()
            // the strings expire on their own; drop their index entries too
            .zrembyscore(
                self.keys.history_list(),
                "-inf",
                format!("({}", self.history_floor()),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<Page<ExecResult>> {
        let max = filter
            .end_time
            .map_or_else(|| "+inf".to_string(), |t| t.timestamp().to_string());
        let floor = self.history_floor();
        let min = filter
            .start_time
            .map_or(floor, |t| t.timestamp().max(floor))
            .to_string();

        let mut conn = self.conn();
        let mut ids: Vec<String> = conn
            .zrevrangebyscore(self.keys.history_list(), max, min)
            .await?;
        if let Some(task_id) = &filter.task_id {
            ids.retain(|id| is_history_of(id, task_id));
        }
        if ids.is_empty() {
            return Ok(Page::paginate(Vec::new(), filter.page, filter.page_size));
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.get(self.keys.history(id));
        }
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        // expired entries leave their id behind in the index
        let mut results: Vec<ExecResult> = ids
            .iter()
            .zip(raw)
            .filter_map(|(id, data)| decode::<ExecResult>("execution result", id, data))
            .filter(|r| filter.matches(r))
            .collect();
        results.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(Page::paginate(results, filter.page, filter.page_size))
    }

    async fn last_result(&self, task_id: &str) -> Result<Option<ExecResult>> {
        let floor = self.history_floor();
        let mut conn = self.conn();
        let mut offset: isize = 0;

        // newest first, one page of the live window per round trip
        loop {
            let ids: Vec<String> = conn
                .zrevrangebyscore_limit(
                    self.keys.history_list(),
                    "+inf",
                    floor,
                    offset,
                    SCAN_CHUNK,
                )
                .await?;
            if ids.is_empty() {
                return Ok(None);
            }
            offset += SCAN_CHUNK;
            let exhausted = ids.len() < SCAN_CHUNK.unsigned_abs();

            let mine: Vec<&String> = ids.iter().filter(|id| is_history_of(id, task_id)).collect();
            if !mine.is_empty() {
                let mut pipe = redis::pipe();
                for id in &mine {
                    pipe.get(self.keys.history(id));
                }
                let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
                let found = mine
                    .into_iter()
                    .zip(raw)
                    .find_map(|(id, data)| decode::<ExecResult>("execution result", id, data));
                if found.is_some() {
                    return Ok(found);
                }
            }

            if exhausted {
                return Ok(None);
            }
        }
    }

    async fn get_stats(&self, task_id: &str) -> Result<TaskStats> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.stats(task_id)).await?;
        Ok(parse_stats(task_id, &fields))
    }

    async fn incr_run_count(&self, task_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.hincr(self.keys.stats(task_id), "run_count", 1).await?;
        Ok(())
    }

    async fn set_last_run_time(&self, task_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .hset(self.keys.stats(task_id), "last_run_time", at.to_rfc3339())
            .await?;
        Ok(())
    }

    async fn update_after_result(&self, result: &ExecResult) -> Result<TaskStats> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = self
            .stats_script
            .key(self.keys.stats(&result.task_id))
            .arg(i32::from(result.is_success()))
            .arg(result.duration.as_secs_f64() * 1000.0)
            .arg(result.start_time.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(parse_stats(&result.task_id, &fields))
    }

    async fn put_delayed(&self, event: &DelayedEvent) -> Result<()> {
        self.write_delayed(event).await?;
        tracing::debug!(event_id = %event.id(), event_type = %event.event_type(), "Delayed event stored");
        Ok(())
    }

    async fn get_delayed(&self, id: &str) -> Result<DelayedEvent> {
        let mut conn = self.conn();
        let data: Option<String> = conn.hget(self.keys.delayed(id), "data").await?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(Error::not_found("delayed event", id)),
        }
    }

    async fn update_delayed(&self, event: &DelayedEvent) -> Result<()> {
        if !self.delayed_exists(event.id()).await? {
            return Err(Error::not_found("delayed event", event.id()));
        }
        self.write_delayed(event).await
    }

    async fn delete_delayed(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .del(self.keys.delayed(id))
            .ignore()
            .zrem(self.keys.delayed_list(), id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DelayedEvent>> {
        let mut due = Vec::new();
        let mut offset: isize = 0;
        let mut conn = self.conn();

        // terminal events stay indexed until cleanup, so skip past them
        while due.len() < limit {
            let ids: Vec<String> = conn
                .zrangebyscore_limit(
                    self.keys.delayed_list(),
                    "-inf",
                    now.timestamp(),
                    offset,
                    SCAN_CHUNK,
                )
                .await?;
            if ids.is_empty() {
                break;
            }
            offset += SCAN_CHUNK;
            let exhausted = ids.len() < SCAN_CHUNK.unsigned_abs();

            let keys: Vec<String> = ids.iter().map(|id| self.keys.delayed(id)).collect();
            let statuses = self.hget_many(&keys, "status").await?;
            let pending: Vec<String> = ids
                .into_iter()
                .zip(statuses)
                .filter(|(_, status)| status.as_deref() == Some(EventStatus::Pending.as_str()))
                .map(|(id, _)| id)
                .collect();

            for event in self.load_delayed(&pending).await? {
                if event.status == EventStatus::Pending && event.is_due(now) && due.len() < limit {
                    due.push(event);
                }
            }

            if exhausted {
                break;
            }
        }

        due.sort_by(|a, b| a.delay_until.cmp(&b.delay_until));
        Ok(due)
    }

    async fn list_delayed(&self, filter: &EventFilter) -> Result<Page<DelayedEvent>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.zrange(self.keys.delayed_list(), 0, -1).await?;
        let events: Vec<DelayedEvent> = self
            .load_delayed(&ids)
            .await?
            .into_iter()
            .filter(|e| filter.matches_delayed(e))
            .collect();
        Ok(Page::paginate(events, filter.page, filter.page_size))
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn();
        // terminal transitions happen after the due time, so the score bounds the scan
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.delayed_list(), "-inf", before.timestamp())
            .await?;

        let doomed: Vec<String> = self
            .load_delayed(&ids)
            .await?
            .into_iter()
            .filter(|e| {
                matches!(e.status, EventStatus::Failed | EventStatus::Expired)
                    && e.updated_at < before
            })
            .map(|e| e.event.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &doomed {
            pipe.del(self.keys.delayed(id))
                .ignore()
                .zrem(self.keys.delayed_list(), id)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(doomed.len())
    }

    async fn put_record(&self, record: &EventRecord) -> Result<String> {
        let mut conn = self.conn();
        let seq: u64 = conn.incr(self.keys.sequence(), 1).await?;

        let mut record = record.clone();
        record.id = format!("record_{seq}");
        let fields = [
            ("data", serde_json::to_string(&record)?),
            ("type", record.event_type.clone()),
            ("status", record.status.as_str().to_string()),
            ("created_at", record.created_at.timestamp().to_string()),
        ];
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.record(&record.id), &fields)
            .ignore()
            .lpush(self.keys.records_list(), &record.id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let keep = isize::try_from(self.retention).unwrap_or(isize::MAX);
        let overflow: Vec<String> = conn.lrange(self.keys.records_list(), keep, -1).await?;
        if !overflow.is_empty() {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in &overflow {
                pipe.del(self.keys.record(id)).ignore();
            }
            pipe.ltrim(self.keys.records_list(), 0, keep - 1).ignore();
            let _: () = pipe.query_async(&mut conn).await?;
        }

        Ok(record.id)
    }

    async fn list_records(&self, filter: &EventFilter) -> Result<Page<EventRecord>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.lrange(self.keys.records_list(), 0, -1).await?;
        let keys: Vec<String> = ids.iter().map(|id| self.keys.record(id)).collect();
        let raw = self.hget_many(&keys, "data").await?;

        let records: Vec<EventRecord> = ids
            .iter()
            .zip(raw)
            .filter_map(|(id, data)| decode::<EventRecord>("event record", id, data))
            .filter(|r| filter.matches_record(r))
            .collect();
        Ok(Page::paginate(records, filter.page, filter.page_size))
    }

    async fn metrics(&self) -> Result<EventMetrics> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.zrange(self.keys.delayed_list(), 0, -1).await?;
        let keys: Vec<String> = ids.iter().map(|id| self.keys.delayed(id)).collect();

        let mut metrics = EventMetrics::default();
        for status in self.hget_many(&keys, "status").await?.into_iter().flatten() {
            match status.parse::<EventStatus>() {
                Ok(status) => metrics.count(status),
                Err(e) => tracing::warn!(error = %e, "Skipping delayed event with unknown status"),
            }
        }
        Ok(metrics)
    }
}

fn task_fields(task: &Task) -> Result<[(&'static str, String); 4]> {
    Ok([
        ("data", serde_json::to_string(task)?),
        ("type", task.task_type().as_str().to_string()),
        ("status", task.status.as_str().to_string()),
        ("created_at", task.created_at.timestamp().to_string()),
    ])
}

fn delayed_fields(event: &DelayedEvent) -> Result<[(&'static str, String); 9]> {
    Ok([
        ("data", serde_json::to_string(event)?),
        ("type", event.event.event_type.clone()),
        ("source", event.event.source.clone()),
        ("status", event.status.as_str().to_string()),
        ("priority", u8::from(event.priority).to_string()),
        ("delay_until", event.delay_until.timestamp().to_string()),
        ("created_at", event.created_at.timestamp().to_string()),
        ("updated_at", event.updated_at.timestamp().to_string()),
        ("retry_count", event.retry_count.to_string()),
    ])
}

/// Decode a stored JSON blob, logging and skipping entries that fail.
fn decode<T: DeserializeOwned>(kind: &str, id: &str, data: Option<String>) -> Option<T> {
    let data = data?;
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(kind, id, error = %e, "Skipping undecodable record");
            None
        }
    }
}

fn parse_stats(task_id: &str, fields: &HashMap<String, String>) -> TaskStats {
    let count = |name: &str| {
        fields
            .get(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    TaskStats {
        task_id: task_id.to_string(),
        run_count: count("run_count"),
        success_count: count("success_count"),
        failed_count: count("failed_count"),
        last_run_time: fields
            .get("last_run_time")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc)),
        avg_duration_ms: fields
            .get("avg_duration_ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
    }
}
