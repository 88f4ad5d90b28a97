//! System task attempts and the built-in handlers.

use std::sync::Arc;

use async_trait::async_trait;

use super::executor::Attempt;
use crate::error::panic_message;
use crate::registry::{HandlerContext, Params, TaskHandler};

/// Aborts the spawned handler when the attempt is abandoned.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the handler once on its own task so a panic cannot take down the
/// scheduler. If the caller stops polling (timeout, shutdown) the handler's
/// token is cancelled and its task aborted.
pub(crate) async fn attempt(
    handler: Arc<dyn TaskHandler>,
    ctx: HandlerContext,
    params: Params,
) -> Attempt {
    let _cancel_guard = ctx.cancel.clone().drop_guard();
    let handle = tokio::spawn(async move { handler.handle(&ctx, &params).await });
    let _abort = AbortOnDrop(handle.abort_handle());

    match handle.await {
        Ok(Ok(output)) => Attempt::Success(output),
        Ok(Err(e)) => Attempt::Failure {
            output: String::new(),
            error: format!("{e:#}"),
        },
        Err(e) if e.is_panic() => {
            Attempt::Fatal(format!("handler panicked: {}", panic_message(e.into_panic())))
        }
        Err(e) => Attempt::Fatal(format!("handler task aborted: {e}")),
    }
}

/// Writes `params.message` to the log at `params.level`.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Writes params.message at params.level (debug, info, warn, error)"
    }

    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> anyhow::Result<String> {
        let message = params
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if message.is_empty() {
            anyhow::bail!("params.message is required");
        }

        let level = params
            .get("level")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("info");
        match level {
            "debug" => tracing::debug!(task_id = %ctx.task_id, "{message}"),
            "warn" => tracing::warn!(task_id = %ctx.task_id, "{message}"),
            "error" => tracing::error!(task_id = %ctx.task_id, "{message}"),
            _ => tracing::info!(task_id = %ctx.task_id, "{message}"),
        }
        Ok(format!("logged at {level}: {message}"))
    }
}
