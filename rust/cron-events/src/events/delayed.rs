//! Delayed event delivery.
//!
//! Every delayed event is persisted and indexed by due time. A sweeper
//! ticks every poll interval, pops due events and enqueues them on the bus.
//! For delays longer than one poll interval a one-shot scheduler entry is
//! registered as well; when it fires it wakes the sweeper, so delivery
//! happens at the due time instead of up to a poll interval later. The
//! sweeper stays the only place that publishes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::bus::EventPublisher;
use super::types::{DelayedEvent, EventRecord, EventStatus};
use crate::config::DelayedConfig;
use crate::error::{Error, Result};
use crate::logging::OpTimer;
use crate::registry::{HandlerContext, Params, TaskHandler};
use crate::scheduler::CronScheduler;
use crate::store::SharedStore;

/// Name of the system handler behind one-shot wake-up entries.
pub const TRIGGER_HANDLER: &str = "delayed_event_trigger";

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub expired: usize,
}

impl SweepReport {
    pub fn processed(&self) -> usize {
        self.delivered + self.retried + self.failed + self.expired
    }
}

/// Wakes the sweeper when a one-shot entry fires.
#[derive(Debug)]
pub struct DelayedTrigger {
    notify: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for DelayedTrigger {
    fn name(&self) -> &str {
        TRIGGER_HANDLER
    }

    fn description(&self) -> &str {
        "Wakes the delayed event sweeper at a one-shot instant"
    }

    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> anyhow::Result<String> {
        let event_id = params
            .get("event_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("params.event_id must be a string"))?;
        tracing::debug!(entry_id = %ctx.task_id, event_id, "One-shot woke the sweeper");
        self.notify.notify_one();
        Ok(format!("delayed event {event_id} triggered"))
    }
}

struct Workers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct DelayedInner {
    store: SharedStore,
    publisher: Arc<dyn EventPublisher>,
    scheduler: Option<CronScheduler>,
    config: DelayedConfig,
    notify: Arc<Notify>,
    /// event id -> one-shot entry id. Only an index; the store is authoritative.
    one_shots: Mutex<HashMap<String, String>>,
    workers: Mutex<Option<Workers>>,
}

#[derive(Clone)]
pub struct DelayedEventService {
    inner: Arc<DelayedInner>,
}

impl std::fmt::Debug for DelayedEventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedEventService")
            .field("config", &self.inner.config)
            .field("one_shots", &self.inner.one_shots.lock().len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl DelayedEventService {
    /// `scheduler` is optional; without it every event goes through the
    /// poll sweep.
    pub fn new(
        store: SharedStore,
        publisher: Arc<dyn EventPublisher>,
        scheduler: Option<CronScheduler>,
        config: DelayedConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DelayedInner {
                store,
                publisher,
                scheduler,
                config,
                notify: Arc::new(Notify::new()),
                one_shots: Mutex::new(HashMap::new()),
                workers: Mutex::new(None),
            }),
        }
    }

    /// The handler to register under [`TRIGGER_HANDLER`].
    pub fn trigger_handler(&self) -> Arc<DelayedTrigger> {
        Arc::new(DelayedTrigger {
            notify: Arc::clone(&self.inner.notify),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.workers.lock().is_some()
    }

    /// Persist `event` and, for long delays, register a wake-up entry.
    pub async fn schedule(&self, event: DelayedEvent) -> Result<DelayedEvent> {
        let now = Utc::now();
        if event.delay_until <= now {
            return Err(Error::InvalidTime(format!(
                "delay_until {} is not in the future",
                event.delay_until
            )));
        }

        self.inner.store.put_delayed(&event).await?;

        let delay = (event.delay_until - now).to_std().unwrap_or_default();
        if self.inner.config.one_shot_enabled && delay > self.inner.config.poll_interval() {
            self.inner.register_wakeup(event.id(), event.delay_until);
        }

        tracing::info!(
            event_id = %event.id(),
            event_type = %event.event_type(),
            delay_until = %event.delay_until,
            "Delayed event scheduled"
        );
        Ok(event)
    }

    /// Remove a delayed event and its wake-up entry. Absent ids are fine.
    pub async fn cancel(&self, event_id: &str) -> Result<()> {
        self.inner.store.delete_delayed(event_id).await?;
        self.inner.forget_wakeup(event_id);
        tracing::info!(event_id, "Delayed event cancelled");
        Ok(())
    }

    pub async fn get_pending_count(&self) -> Result<u64> {
        Ok(self.inner.store.metrics().await?.pending_events)
    }

    /// Number of wake-up entries currently tracked.
    pub fn scheduled_wakeups(&self) -> usize {
        self.inner.one_shots.lock().len()
    }

    /// Start the sweeper and the cleaner. Starting twice does nothing.
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock();
        if workers.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handles = vec![
            tokio::spawn(run_sweeper(Arc::clone(&self.inner), token.clone())),
            tokio::spawn(run_cleaner(Arc::clone(&self.inner), token.clone())),
        ];
        *workers = Some(Workers { token, handles });
        tracing::info!(
            poll_interval_secs = self.inner.config.poll_interval_secs,
            batch_size = self.inner.config.batch_size,
            "Delayed event service started"
        );
    }

    /// Stop both loops, waiting at most one sweep timeout.
    pub async fn stop(&self) {
        let Some(workers) = self.inner.workers.lock().take() else {
            return;
        };
        workers.token.cancel();
        let mut handles = workers.handles;
        let wait = futures::future::join_all(handles.iter_mut());
        if tokio::time::timeout(self.inner.config.sweep_timeout(), wait)
            .await
            .is_err()
        {
            tracing::warn!("Delayed event workers did not stop in time; aborting them");
            for handle in &handles {
                handle.abort();
            }
        }
        tracing::info!("Delayed event service stopped");
    }

    /// Run one sweep now.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.inner.sweep(Utc::now()).await
    }

    /// Remove failed and expired events last updated before
    /// `now - expire_after`.
    pub async fn cleanup_once(&self) -> Result<usize> {
        self.inner.cleanup().await
    }
}

impl DelayedInner {
    fn register_wakeup(&self, event_id: &str, at: DateTime<Utc>) {
        let Some(scheduler) = self.scheduler.as_ref().filter(|s| s.is_running()) else {
            tracing::debug!(event_id, "Scheduler unavailable; relying on the poll sweep");
            return;
        };

        let mut params = Params::new();
        params.insert("event_id".into(), event_id.into());
        match scheduler.register_one_shot(at, TRIGGER_HANDLER, params) {
            Ok(entry_id) => {
                tracing::debug!(event_id, entry_id = %entry_id, "Wake-up entry registered");
                let replaced = self.one_shots.lock().insert(event_id.to_string(), entry_id);
                if let Some(old) = replaced {
                    scheduler.remove_one_shot(&old);
                }
            }
            Err(e) => tracing::warn!(
                event_id,
                error = %e,
                "Failed to register wake-up entry; relying on the poll sweep"
            ),
        }
    }

    fn forget_wakeup(&self, event_id: &str) {
        let entry = self.one_shots.lock().remove(event_id);
        if let (Some(entry_id), Some(scheduler)) = (entry, self.scheduler.as_ref()) {
            scheduler.remove_one_shot(&entry_id);
        }
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due = self.store.pop_due(now, self.config.batch_size).await?;
        let mut report = SweepReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        tracing::debug!(count = due.len(), "Processing due delayed events");

        let expire_after = chrono::Duration::from_std(self.config.expire_after())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let retry_interval = chrono::Duration::from_std(self.config.retry_interval())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        for mut event in due {
            self.forget_wakeup(event.id());

            if now - event.delay_until > expire_after {
                event.set_status(EventStatus::Expired);
                self.finish(&event, "expired before delivery").await;
                report.expired += 1;
                continue;
            }

            let mut outgoing = event.event.clone();
            outgoing.timestamp = Utc::now();
            match self.publisher.publish_async(outgoing) {
                Ok(()) => {
                    event.set_status(EventStatus::Delivered);
                    self.finish(&event, "").await;
                    report.delivered += 1;
                }
                Err(e) if event.can_retry() => {
                    event.retry_count += 1;
                    event.delay_until = now + retry_interval;
                    event.set_status(EventStatus::Pending);
                    match self.store.update_delayed(&event).await {
                        Ok(()) => tracing::warn!(
                            event_id = %event.id(),
                            retry = event.retry_count,
                            max_retries = event.max_retries,
                            next_attempt = %event.delay_until,
                            error = %e,
                            "Delayed event delivery failed; retry scheduled"
                        ),
                        Err(store_err) => tracing::error!(
                            event_id = %event.id(),
                            error = %store_err,
                            "Failed to record delayed event retry"
                        ),
                    }
                    report.retried += 1;
                }
                Err(e) => {
                    event.set_status(EventStatus::Failed);
                    tracing::error!(
                        event_id = %event.id(),
                        event_type = %event.event_type(),
                        retries = event.retry_count,
                        error = %e,
                        "Delayed event failed after exhausting retries"
                    );
                    self.finish(&event, &e.to_string()).await;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Persist a terminal status and append the audit record.
    async fn finish(&self, event: &DelayedEvent, error: &str) {
        if let Err(e) = self.store.update_delayed(event).await {
            tracing::error!(event_id = %event.id(), status = %event.status, error = %e, "Failed to update delayed event");
            return;
        }
        if let Err(e) = self.store.put_record(&EventRecord::from_delayed(event, error)).await {
            tracing::warn!(event_id = %event.id(), error = %e, "Failed to write event record");
        }
    }

    async fn cleanup(&self) -> Result<usize> {
        let expire_after = chrono::Duration::from_std(self.config.expire_after())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let removed = self.store.cleanup(Utc::now() - expire_after).await?;
        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale delayed events");
        }
        Ok(removed)
    }
}

async fn run_sweeper(inner: Arc<DelayedInner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = inner.notify.notified() => {}
            _ = ticker.tick() => {}
        }

        let timer = OpTimer::new("delayed", "sweep");
        match tokio::time::timeout(inner.config.sweep_timeout(), inner.sweep(Utc::now())).await {
            Ok(Ok(report)) if report.processed() > 0 => {
                tracing::info!(
                    delivered = report.delivered,
                    retried = report.retried,
                    failed = report.failed,
                    expired = report.expired,
                    duration_ms = timer.elapsed_ms(),
                    "Delayed event sweep finished"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Delayed event sweep failed"),
            Err(_) => tracing::warn!(
                timeout = ?inner.config.sweep_timeout(),
                "Delayed event sweep timed out"
            ),
        }
    }
    tracing::debug!("Delayed event sweeper stopped");
}

async fn run_cleaner(inner: Arc<DelayedInner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.cleanup_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let timer = OpTimer::new("delayed", "cleanup");
        let outcome = inner.cleanup().await;
        timer.finish_with_result(outcome.as_ref());
    }
    tracing::debug!("Delayed event cleaner stopped");
}
