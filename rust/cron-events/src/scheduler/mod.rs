//! Persistent cron scheduling.
//!
//! Tasks live in the [`Store`](crate::store::Store); the [`CronScheduler`]
//! keeps one live entry per active task and records every fire back into
//! the store. [`TaskService`] is the façade the hosting layer talks to.

pub mod cron;
pub mod engine;
pub mod executor;
pub mod http;
pub mod service;
pub mod system;
pub mod task;

pub use cron::{CronExpression, CronParser};
pub use engine::{CronScheduler, FireObserver, SchedulerStatus};
pub use executor::TaskExecutor;
pub use service::{CreateTaskRequest, TaskInfo, TaskService, UpdateTaskRequest};
pub use system::LogHandler;
pub use task::{
    ExecResult, ExecStatus, HttpConfig, SystemConfig, Task, TaskKind, TaskStats, TaskStatus,
    TaskType,
};
