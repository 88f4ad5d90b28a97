//! Bridges the scheduler and the bus.
//!
//! Neither component knows the other: the scheduler reports fires through
//! [`FireObserver`], the bus delivers `cron.task.delayed_execute` events to
//! [`DelayedTaskExecutor`], and this module owns both ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::bus::{EventHandler, SubscriptionOptions};
use super::service::{DelayedEventOptions, EventService};
use super::types::{
    CRON_TASK_COMPLETED, CRON_TASK_DELAYED_EXECUTE, CRON_TASK_EXECUTED, CRON_TASK_FAILED,
    DelayedEvent, Event, Priority,
};
use crate::error::Result;
use crate::scheduler::task::duration_nanos;
use crate::scheduler::{
    CronScheduler, ExecResult, ExecStatus, FireObserver, Task, TaskService, TaskType,
};

const SOURCE: &str = "cron_scheduler";

/// Payload of every `cron.task.*` fire event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronTaskPayload {
    pub task_id: String,
    pub task_name: String,
    pub task_type: TaskType,
    pub status: ExecStatus,
    pub executed_at: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
}

impl CronTaskPayload {
    pub fn new(task: &Task, result: &ExecResult) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            task_type: task.task_type(),
            status: result.status,
            executed_at: result.start_time,
            duration: result.duration,
            result: result.output.clone(),
            error: result.error.clone(),
        }
    }
}

/// Publishes fire outcomes and schedules deferred task runs.
#[derive(Debug, Clone)]
pub struct CronEventBridge {
    events: EventService,
}

impl CronEventBridge {
    pub fn new(events: EventService) -> Self {
        Self { events }
    }

    /// Hook the bridge into `scheduler` and subscribe the executor of
    /// deferred runs.
    pub fn install(&self, scheduler: &CronScheduler, tasks: TaskService) -> Result<()> {
        scheduler.add_observer(Arc::new(self.clone()));
        self.events.subscribe(
            CRON_TASK_DELAYED_EXECUTE,
            Arc::new(DelayedTaskExecutor { tasks }),
            SubscriptionOptions::default(),
        )?;
        tracing::info!("Cron event bridge installed");
        Ok(())
    }

    /// Run `task_id` once at `at`, through the delayed event path.
    pub async fn schedule_task_execution(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<DelayedEvent> {
        let event = self
            .events
            .schedule_delayed_event(
                CRON_TASK_DELAYED_EXECUTE,
                json!({ "task_id": task_id }),
                SOURCE,
                at,
                DelayedEventOptions {
                    priority: Priority::High,
                    max_retries: 2,
                },
            )
            .await?;
        tracing::info!(task_id, event_id = %event.id(), at = %at, "Task execution deferred");
        Ok(event)
    }

    fn emit(&self, event_type: &str, payload: &serde_json::Value) {
        let event = Event::new(event_type, payload.clone(), SOURCE);
        if let Err(e) = self.events.bus().publish_async(event) {
            tracing::warn!(event_type, error = %e, "Failed to publish cron event");
        }
    }
}

#[async_trait]
impl FireObserver for CronEventBridge {
    async fn on_fire(&self, task: &Task, result: &ExecResult) {
        let payload = match serde_json::to_value(CronTaskPayload::new(task, result)) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to encode cron event");
                return;
            }
        };
        self.emit(CRON_TASK_EXECUTED, &payload);
        let outcome = if result.is_success() {
            CRON_TASK_COMPLETED
        } else {
            CRON_TASK_FAILED
        };
        self.emit(outcome, &payload);
    }
}

/// Runs the task named by a `cron.task.delayed_execute` event.
#[derive(Debug)]
pub struct DelayedTaskExecutor {
    tasks: TaskService,
}

impl DelayedTaskExecutor {
    pub const NAME: &'static str = "delayed_task_executor";
}

#[async_trait]
impl EventHandler for DelayedTaskExecutor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let task_id = event
            .payload
            .get("task_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("event {} carries no task_id", event.id))?;
        self.tasks.execute_now(task_id).await?;
        Ok(())
    }
}
