//! The cron engine.
//!
//! Each registered task gets its own tokio task that sleeps until the next
//! fire time and then fires inline, so fires of one task never overlap and
//! a slow task only delays itself. Every fire goes through the store: the
//! task is re-read (and skipped unless still active), counters are bumped,
//! the result is appended to history and the stats are updated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::cron::{CronExpression, CronParser};
use super::executor::{Attempt, TaskExecutor};
use super::system;
use super::task::{ExecResult, Task, TaskStatus};
use crate::error::{Error, Result};
use crate::registry::{HandlerContext, Params, TaskHandler};
use crate::store::SharedStore;

/// Called after every task fire with the persisted result.
#[async_trait]
pub trait FireObserver: Send + Sync {
    async fn on_fire(&self, task: &Task, result: &ExecResult);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    /// Entries currently registered.
    pub task_count: usize,
    /// Registered entries whose stored status is still active.
    pub active_tasks: usize,
}

/// What an entry runs when it fires.
enum Job {
    Task(String),
    OneShot {
        handler: Arc<dyn TaskHandler>,
        params: Params,
    },
}

struct Entry {
    id: String,
    next: Arc<Mutex<Option<DateTime<Utc>>>>,
    token: CancellationToken,
}

struct State {
    running: bool,
    start_time: Option<DateTime<Utc>>,
    entries: HashMap<String, Entry>,
    one_shots: HashMap<String, Entry>,
}

struct Inner {
    store: SharedStore,
    executor: TaskExecutor,
    stop_grace: Duration,
    state: Mutex<State>,
    tracker: TaskTracker,
    observers: RwLock<Vec<Arc<dyn FireObserver>>>,
}

/// Persistent cron scheduler. Clones share the same engine.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CronScheduler")
            .field("running", &state.running)
            .field("entries", &state.entries.len())
            .field("one_shots", &state.one_shots.len())
            .finish_non_exhaustive()
    }
}

impl CronScheduler {
    pub fn new(store: SharedStore, executor: TaskExecutor, stop_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                stop_grace,
                state: Mutex::new(State {
                    running: false,
                    start_time: None,
                    entries: HashMap::new(),
                    one_shots: HashMap::new(),
                }),
                tracker: TaskTracker::new(),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    /// Register a hook invoked after every task fire.
    pub fn add_observer(&self, observer: Arc<dyn FireObserver>) {
        self.inner.observers.write().push(observer);
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Start the engine and register every active task from the store.
    /// Calling it on a running scheduler does nothing.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.start_time = Some(Utc::now());
        }
        self.inner.tracker.reopen();

        let tasks = match self.inner.store.all_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.inner.state.lock().running = false;
                return Err(e);
            }
        };

        let mut loaded = 0_usize;
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Active) {
            match self.add_task(task) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(
                    task_id = %task.id,
                    cron = %task.cron,
                    error = %e,
                    "Skipping task that cannot be scheduled"
                ),
            }
        }
        tracing::info!(loaded, total = tasks.len(), "Cron scheduler started");
        Ok(())
    }

    /// Stop all entries and wait up to the grace period for in-flight fires.
    /// Fires still running afterwards are left alone and persist their
    /// result when they finish.
    pub async fn stop(&self) {
        let entries = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            let mut entries: Vec<Entry> = state.entries.drain().map(|(_, e)| e).collect();
            entries.extend(state.one_shots.drain().map(|(_, e)| e));
            entries
        };

        for entry in &entries {
            entry.token.cancel();
        }
        self.inner.tracker.close();
        if tokio::time::timeout(self.inner.stop_grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                grace = ?self.inner.stop_grace,
                "In-flight fires still running after stop grace period; leaving them to finish"
            );
        }
        tracing::info!(entries = entries.len(), "Cron scheduler stopped");
    }

    /// Schedule an active task. Non-active tasks are ignored.
    pub fn add_task(&self, task: &Task) -> Result<()> {
        if task.status != TaskStatus::Active {
            tracing::debug!(task_id = %task.id, status = %task.status, "Not scheduling inactive task");
            return Ok(());
        }
        let expr = CronParser::parse(&task.cron)?;

        let mut state = self.inner.state.lock();
        if !state.running {
            return Err(Error::NotRunning("scheduler"));
        }
        let entry = spawn_entry(&self.inner, expr, Job::Task(task.id.clone()));
        if let Some(old) = state.entries.insert(task.id.clone(), entry) {
            old.token.cancel();
        }
        tracing::debug!(task_id = %task.id, cron = %task.cron, "Task scheduled");
        Ok(())
    }

    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        let entry = self
            .inner
            .state
            .lock()
            .entries
            .remove(task_id)
            .ok_or_else(|| Error::not_found("scheduled task", task_id))?;
        entry.token.cancel();
        tracing::debug!(task_id, entry_id = %entry.id, "Task unscheduled");
        Ok(())
    }

    /// Re-register a task after its definition changed.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        match self.remove_task(&task.id) {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.add_task(task)
    }

    /// Fire a task now, outside its schedule. The next scheduled fire is
    /// unaffected.
    pub async fn execute_now(&self, task_id: &str) -> Result<()> {
        let task = self.inner.store.get_task(task_id).await?;
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            run_task(&inner, task).await;
        });
        Ok(())
    }

    pub fn next_run_time(&self, task_id: &str) -> Result<DateTime<Utc>> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(task_id)
            .and_then(|entry| *entry.next.lock())
            .ok_or_else(|| Error::NotScheduled(task_id.to_string()))
    }

    pub fn is_scheduled(&self, task_id: &str) -> bool {
        self.inner.state.lock().entries.contains_key(task_id)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (running, start_time, ids) = {
            let state = self.inner.state.lock();
            let ids: Vec<String> = state.entries.keys().cloned().collect();
            (state.running, state.start_time, ids)
        };

        let mut active_tasks = 0;
        for id in &ids {
            if matches!(self.inner.store.get_status(id).await, Ok(TaskStatus::Active)) {
                active_tasks += 1;
            }
        }
        SchedulerStatus {
            running,
            start_time,
            task_count: ids.len(),
            active_tasks,
        }
    }

    /// Register an entry that runs `handler` once at `at` (rounded up to the
    /// next whole second) and then removes itself. One-shot entries are not
    /// persisted.
    pub fn register_one_shot(
        &self,
        at: DateTime<Utc>,
        handler: &str,
        params: Params,
    ) -> Result<String> {
        let handler = self
            .inner
            .executor
            .registry()
            .lookup(handler)
            .ok_or_else(|| Error::not_found("handler", handler))?;
        let expr = CronParser::one_shot(at)?;
        if expr.next_after(&Utc::now()).is_none() {
            return Err(Error::InvalidTime(format!("{at} is not in the future")));
        }

        let mut state = self.inner.state.lock();
        if !state.running {
            return Err(Error::NotRunning("scheduler"));
        }
        let entry = spawn_entry(&self.inner, expr, Job::OneShot { handler, params });
        let id = entry.id.clone();
        state.one_shots.insert(id.clone(), entry);
        tracing::debug!(entry_id = %id, at = %at, "One-shot entry registered");
        Ok(id)
    }

    /// Revoke a one-shot entry. Returns whether it was still pending.
    pub fn remove_one_shot(&self, entry_id: &str) -> bool {
        match self.inner.state.lock().one_shots.remove(entry_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn one_shot_count(&self) -> usize {
        self.inner.state.lock().one_shots.len()
    }
}

/// The first fire time is computed before the entry is handed out, so
/// `next_run_time` answers as soon as a task is registered.
fn spawn_entry(inner: &Arc<Inner>, expr: CronExpression, job: Job) -> Entry {
    let first = expr.next_after(&Utc::now());
    let entry = Entry {
        id: uuid::Uuid::new_v4().to_string(),
        next: Arc::new(Mutex::new(first)),
        token: CancellationToken::new(),
    };
    let next = Arc::clone(&entry.next);
    let token = entry.token.clone();
    let entry_id = entry.id.clone();
    let inner_ref = Arc::clone(inner);
    inner.tracker.spawn(async move {
        run_entry(&inner_ref, &entry_id, &expr, &job, first, &next, &token).await;
    });
    entry
}

async fn run_entry(
    inner: &Inner,
    entry_id: &str,
    expr: &CronExpression,
    job: &Job,
    first: Option<DateTime<Utc>>,
    next: &Mutex<Option<DateTime<Utc>>>,
    token: &CancellationToken,
) {
    let mut upcoming = first;
    while let Some(at) = upcoming {
        *next.lock() = Some(at);

        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }

        match job {
            Job::Task(task_id) => fire(inner, task_id).await,
            Job::OneShot { handler, params } => {
                fire_one_shot(inner, entry_id, Arc::clone(handler), params.clone()).await;
            }
        }
        // a fire that overran skips the ticks it covered
        upcoming = expr.next_after(&at.max(Utc::now()));
    }
    *next.lock() = None;

    if let Job::OneShot { .. } = job {
        inner.state.lock().one_shots.remove(entry_id);
    }
}

async fn fire(inner: &Inner, task_id: &str) {
    let task = match inner.store.get_task(task_id).await {
        Ok(task) => task,
        Err(e) => {
            tracing::warn!(task_id, error = %e, "Failed to load task for fire");
            return;
        }
    };
    if task.status != TaskStatus::Active {
        tracing::debug!(task_id, status = %task.status, "Skipping fire of inactive task");
        return;
    }
    run_task(inner, task).await;
}

async fn run_task(inner: &Inner, task: Task) {
    if let Err(e) = inner.store.incr_run_count(&task.id).await {
        tracing::warn!(task_id = %task.id, error = %e, "Failed to increment run count");
    }
    if let Err(e) = inner.store.set_last_run_time(&task.id, Utc::now()).await {
        tracing::warn!(task_id = %task.id, error = %e, "Failed to record last run time");
    }

    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();
    let result = inner.executor.execute(&task, &token).await;

    tracing::info!(
        task_id = %task.id,
        task_name = %task.name,
        status = %result.status,
        retry = result.retry,
        duration_ms = result.duration.as_millis(),
        "Task fired"
    );

    if let Err(e) = inner.store.append_result(&result).await {
        tracing::error!(task_id = %task.id, error = %e, "Failed to persist execution result");
    }
    if let Err(e) = inner.store.update_after_result(&result).await {
        tracing::error!(task_id = %task.id, error = %e, "Failed to update task stats");
    }

    let observers: Vec<Arc<dyn FireObserver>> = inner.observers.read().clone();
    for observer in observers {
        observer.on_fire(&task, &result).await;
    }
}

async fn fire_one_shot(
    inner: &Inner,
    entry_id: &str,
    handler: Arc<dyn TaskHandler>,
    params: Params,
) {
    let ctx = HandlerContext {
        task_id: entry_id.to_string(),
        cancel: CancellationToken::new(),
    };
    let name = handler.name().to_string();
    let timeout = inner.executor.default_timeout();
    match tokio::time::timeout(timeout, system::attempt(handler, ctx, params)).await {
        Ok(Attempt::Success(_)) => tracing::debug!(entry_id, handler = %name, "One-shot entry fired"),
        Ok(Attempt::Failure { error, .. } | Attempt::Fatal(error)) => {
            tracing::warn!(entry_id, handler = %name, error = %error, "One-shot handler failed");
        }
        Err(_) => tracing::warn!(entry_id, handler = %name, "One-shot handler timed out"),
    }
}
