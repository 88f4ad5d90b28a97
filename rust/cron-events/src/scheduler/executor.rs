//! Runs one fire of a task: retries, whole-execution deadline, cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::task::{ExecResult, ExecStatus, Task, TaskKind};
use super::{http, system};
use crate::registry::{HandlerContext, Registry};

/// Outcome of a single attempt.
#[derive(Debug)]
pub(crate) enum Attempt {
    Success(String),
    /// Retriable failure. `output` is whatever the attempt captured.
    Failure { output: String, error: String },
    /// Non-retriable failure (handler panic).
    Fatal(String),
}

/// Executes tasks. Cheap to clone; the HTTP client pools connections.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    client: reqwest::Client,
    registry: Arc<Registry>,
    default_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(registry: Arc<Registry>, default_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cron-events/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Timeout applied when a task configures none.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `task` once, retrying per its configuration.
    ///
    /// The configured timeout bounds the whole execution, retry delays
    /// included. Hitting it, or `cancel` firing, ends the fire with
    /// [`ExecStatus::Timeout`].
    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> ExecResult {
        let mut result = ExecResult::running(&task.id);

        let handler = match &task.kind {
            TaskKind::System(config) => match self.registry.lookup(&config.handler_name) {
                Some(handler) => Some(handler),
                None => {
                    result.status = ExecStatus::Failed;
                    result.error = format!("handler '{}' not registered", config.handler_name);
                    result.finish();
                    return result;
                }
            },
            TaskKind::Http(_) => None,
        };

        let timeout = match task.kind.timeout() {
            Duration::ZERO => self.default_timeout,
            t => t,
        };
        let deadline = Instant::now() + timeout;
        let retries = task.kind.retry_count();
        let retry_delay = task.kind.retry_delay();

        for attempt in 0..=retries {
            result.retry = attempt;
            let run = async {
                match (&task.kind, &handler) {
                    (TaskKind::Http(config), _) => http::attempt(&self.client, config).await,
                    (TaskKind::System(config), Some(handler)) => {
                        let ctx = HandlerContext {
                            task_id: task.id.clone(),
                            cancel: cancel.child_token(),
                        };
                        system::attempt(Arc::clone(handler), ctx, config.parameters.clone()).await
                    }
                    (TaskKind::System(config), None) => Attempt::Fatal(format!(
                        "handler '{}' not registered",
                        config.handler_name
                    )),
                }
            };

            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    result.status = ExecStatus::Timeout;
                    result.error = "execution cancelled".to_string();
                    break;
                }
                () = tokio::time::sleep_until(deadline) => {
                    result.status = ExecStatus::Timeout;
                    result.error = format!("execution timed out after {timeout:?}");
                    break;
                }
                outcome = run => outcome,
            };

            match outcome {
                Attempt::Success(output) => {
                    result.status = ExecStatus::Success;
                    result.output = output;
                    result.error.clear();
                    break;
                }
                Attempt::Fatal(error) => {
                    result.status = ExecStatus::Failed;
                    result.error = error;
                    break;
                }
                Attempt::Failure { output, error } => {
                    tracing::debug!(
                        task_id = %task.id,
                        retry = attempt,
                        error = %error,
                        "Task attempt failed"
                    );
                    result.output = output;
                    result.error = error;
                }
            }

            if attempt < retries {
                tokio::select! {
                    () = cancel.cancelled() => {
                        result.status = ExecStatus::Timeout;
                        result.error = format!("execution cancelled after: {}", result.error);
                        break;
                    }
                    () = tokio::time::sleep_until(deadline) => {
                        result.status = ExecStatus::Timeout;
                        result.error = format!(
                            "execution timed out after {timeout:?}, last error: {}",
                            result.error
                        );
                        break;
                    }
                    () = tokio::time::sleep(retry_delay) => {}
                }
            }
        }

        if result.status == ExecStatus::Running {
            result.status = ExecStatus::Failed;
        }
        result.finish();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::registry::{Params, TaskHandler};
    use crate::scheduler::task::SystemConfig;

    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "fails until the configured call"
        }

        async fn handle(&self, _ctx: &HandlerContext, _params: &Params) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.succeed_on {
                Ok(format!("call {n}"))
            } else {
                anyhow::bail!("call {n} failed")
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn description(&self) -> &str {
            "always panics"
        }

        async fn handle(&self, _ctx: &HandlerContext, _params: &Params) -> anyhow::Result<String> {
            panic!("handler exploded");
        }
    }

    struct Sleeps;

    #[async_trait]
    impl TaskHandler for Sleeps {
        fn name(&self) -> &str {
            "sleeps"
        }

        fn description(&self) -> &str {
            "sleeps for params.ms"
        }

        async fn handle(&self, _ctx: &HandlerContext, params: &Params) -> anyhow::Result<String> {
            let ms = params.get("ms").and_then(serde_json::Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok("slept".to_string())
        }
    }

    fn executor() -> TaskExecutor {
        let registry = Arc::new(Registry::new());
        registry
            .register(Arc::new(Flaky {
                calls: AtomicU32::new(0),
                succeed_on: 1,
            }))
            .unwrap();
        registry.register(Arc::new(Panics)).unwrap();
        registry.register(Arc::new(Sleeps)).unwrap();
        TaskExecutor::new(registry, Duration::from_secs(5))
    }

    fn system_task(handler: &str, retries: u32) -> Task {
        let mut config = SystemConfig::new(handler);
        config.retry_count = retries;
        config.retry_delay = Duration::from_millis(10);
        config.timeout = Duration::from_secs(2);
        Task::new("t", "* * * * * *", TaskKind::System(config))
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let result = executor()
            .execute(&system_task("flaky", 2), &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecStatus::Success);
        assert_eq!(result.retry, 1);
        assert_eq!(result.output, "call 1");
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let result = executor()
            .execute(&system_task("flaky", 0), &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecStatus::Failed);
        assert_eq!(result.retry, 0);
        assert_eq!(result.error, "call 0 failed");
    }

    #[tokio::test]
    async fn test_missing_handler_fails_fast() {
        let result = executor()
            .execute(&system_task("nope", 3), &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecStatus::Failed);
        assert!(result.error.contains("nope"));
        assert!(result.end_time >= result.start_time);
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let result = executor()
            .execute(&system_task("panics", 2), &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecStatus::Failed);
        assert_eq!(result.retry, 0);
        assert!(result.error.contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut task = system_task("sleeps", 0);
        if let TaskKind::System(config) = &mut task.kind {
            config.timeout = Duration::from_millis(50);
            config.parameters.insert("ms".into(), json!(1_000));
        }
        let result = executor().execute(&task, &CancellationToken::new()).await;
        assert_eq!(result.status, ExecStatus::Timeout);
        assert!(!result.error.is_empty());
        assert!(result.duration < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_cancel_maps_to_timeout() {
        let mut task = system_task("sleeps", 0);
        if let TaskKind::System(config) = &mut task.kind {
            config.parameters.insert("ms".into(), json!(1_000));
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = executor().execute(&task, &cancel).await;
        assert_eq!(result.status, ExecStatus::Timeout);
        assert_eq!(result.error, "execution cancelled");
    }
}
