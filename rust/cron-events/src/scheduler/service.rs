//! Task management façade used by the hosting layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cron::CronParser;
use super::engine::{CronScheduler, SchedulerStatus};
use super::http;
use super::task::{ExecResult, HttpConfig, SystemConfig, Task, TaskKind, TaskStatus};
use crate::error::{Error, Result};
use crate::registry::{HandlerInfo, Registry};
use crate::store::{HistoryFilter, Page, SharedStore, TaskFilter};

const MAX_NAME_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 500;

/// Body of a create call: `{name, description, cron, type, config}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: Option<String>,
    pub cron: String,
    #[serde(flatten)]
    pub kind: TaskKind,
}

/// Partial update. `config` replaces the whole type-specific config and is
/// decoded against the task's existing type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// A task together with its schedule and run information.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    #[serde(flatten)]
    pub task: Task,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_result: Option<ExecResult>,
    pub run_count: u64,
}

#[derive(Debug, Clone)]
pub struct TaskService {
    store: SharedStore,
    scheduler: CronScheduler,
    registry: Arc<Registry>,
}

impl TaskService {
    pub fn new(store: SharedStore, scheduler: CronScheduler, registry: Arc<Registry>) -> Self {
        Self {
            store,
            scheduler,
            registry,
        }
    }

    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<TaskInfo> {
        let mut task = Task::new(req.name, req.cron, req.kind);
        task.description = req.description;
        task.created_by = req.created_by.unwrap_or_else(|| "system".to_string());
        self.validate(&task)?;

        self.store.create_task(&task).await?;
        if let Err(e) = self.scheduler.add_task(&task) {
            tracing::warn!(task_id = %task.id, error = %e, "Task stored but not scheduled");
        }
        tracing::info!(task_id = %task.id, name = %task.name, task_type = %task.task_type(), "Task created");
        self.get_task(&task.id).await
    }

    pub async fn update_task(&self, id: &str, req: UpdateTaskRequest) -> Result<TaskInfo> {
        let mut task = self.store.get_task(id).await?;

        if let Some(name) = req.name {
            task.name = name;
        }
        if let Some(description) = req.description {
            task.description = description;
        }
        if let Some(cron) = req.cron {
            task.cron = cron;
        }
        if let Some(status) = req.status {
            task.status = status;
        }
        if let Some(config) = req.config {
            task.kind = match task.kind {
                TaskKind::Http(_) => TaskKind::Http(serde_json::from_value::<HttpConfig>(config)?),
                TaskKind::System(_) => {
                    TaskKind::System(serde_json::from_value::<SystemConfig>(config)?)
                }
            };
        }
        task.updated_at = Utc::now();
        self.validate(&task)?;

        self.store.update_task(&task).await?;
        if let Err(e) = self.scheduler.update_task(&task) {
            tracing::warn!(task_id = %task.id, error = %e, "Task updated but not rescheduled");
        }
        tracing::info!(task_id = %task.id, "Task updated");
        self.get_task(&task.id).await
    }

    /// Unschedule, then remove the task with its history and stats.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        match self.scheduler.remove_task(id) {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => tracing::warn!(task_id = id, error = %e, "Failed to unschedule task"),
        }
        self.store.delete_task(id).await?;
        tracing::info!(task_id = id, "Task deleted");
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<TaskInfo> {
        let task = self.store.get_task(id).await?;
        Ok(self.describe(task).await)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Page<TaskInfo>> {
        let page = self.store.list_tasks(filter).await?;
        let mut items = Vec::with_capacity(page.items.len());
        for task in page.items {
            items.push(self.describe(task).await);
        }
        Ok(Page {
            items,
            total: page.total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    pub async fn start_task(&self, id: &str) -> Result<()> {
        self.store.set_status(id, TaskStatus::Active).await?;
        let task = self.store.get_task(id).await?;
        self.scheduler.add_task(&task)?;
        tracing::info!(task_id = id, "Task started");
        Ok(())
    }

    pub async fn stop_task(&self, id: &str) -> Result<()> {
        self.deactivate(id, TaskStatus::Stopped).await
    }

    pub async fn pause_task(&self, id: &str) -> Result<()> {
        self.deactivate(id, TaskStatus::Paused).await
    }

    pub async fn execute_now(&self, id: &str) -> Result<()> {
        self.scheduler.execute_now(id).await?;
        tracing::info!(task_id = id, "Task triggered manually");
        Ok(())
    }

    pub async fn history(&self, filter: &HistoryFilter) -> Result<Page<ExecResult>> {
        self.store.list_history(filter).await
    }

    pub fn handlers(&self) -> Vec<HandlerInfo> {
        self.registry.list()
    }

    pub async fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status().await
    }

    pub async fn start_scheduler(&self) -> Result<()> {
        self.scheduler.start().await
    }

    pub async fn stop_scheduler(&self) {
        self.scheduler.stop().await;
    }

    async fn deactivate(&self, id: &str, status: TaskStatus) -> Result<()> {
        self.store.set_status(id, status).await?;
        if let Err(e) = self.scheduler.remove_task(id) {
            tracing::debug!(task_id = id, error = %e, "Task was not scheduled");
        }
        tracing::info!(task_id = id, status = %status, "Task deactivated");
        Ok(())
    }

    async fn describe(&self, task: Task) -> TaskInfo {
        let next_run_time = self.scheduler.next_run_time(&task.id).ok();
        let (run_count, last_run_time) = match self.store.get_stats(&task.id).await {
            Ok(stats) => (stats.run_count, stats.last_run_time),
            Err(e) => {
                tracing::debug!(task_id = %task.id, error = %e, "Stats unavailable");
                (0, None)
            }
        };
        let last_result = self.store.last_result(&task.id).await.ok().flatten();
        TaskInfo {
            task,
            next_run_time,
            last_run_time,
            last_result,
            run_count,
        }
    }

    fn validate(&self, task: &Task) -> Result<()> {
        let name_len = task.name.trim().chars().count();
        if name_len == 0 || name_len > MAX_NAME_CHARS {
            return Err(Error::InvalidConfig(format!(
                "task name must be 1..={MAX_NAME_CHARS} characters"
            )));
        }
        if task.description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(Error::InvalidConfig(format!(
                "task description must be at most {MAX_DESCRIPTION_CHARS} characters"
            )));
        }
        CronParser::validate(&task.cron)?;

        match &task.kind {
            TaskKind::Http(config) => http::validate(config),
            TaskKind::System(config) if !self.registry.contains(&config.handler_name) => {
                Err(Error::InvalidConfig(format!(
                    "no system task handler named '{}'",
                    config.handler_name
                )))
            }
            TaskKind::System(_) => Ok(()),
        }
    }
}
