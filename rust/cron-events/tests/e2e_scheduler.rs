//! End-to-end scheduler scenarios against the in-memory store.
//!
//! This test validates:
//! - A system task firing every second with a registered handler
//! - HTTP retries, with the persisted result reflecting the final attempt
//! - HTTP timeouts recorded in the execution history

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cron_events::config::AppConfig;
use cron_events::registry::{HandlerContext, Params, TaskHandler};
use cron_events::runtime::Runtime;
use cron_events::scheduler::{CreateTaskRequest, ExecResult, ExecStatus};
use cron_events::store::{HistoryFilter, InMemoryStore, SharedStore, Store};

struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "returns params.text"
    }

    async fn handle(&self, _ctx: &HandlerContext, params: &Params) -> anyhow::Result<String> {
        Ok(params
            .get("text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

async fn started() -> (Runtime, SharedStore) {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let runtime = Runtime::build(AppConfig::default(), Arc::clone(&store)).unwrap();
    runtime.registry().register(Arc::new(Echo)).unwrap();
    runtime.start().await.unwrap();
    (runtime, store)
}

fn request(value: serde_json::Value) -> CreateTaskRequest {
    serde_json::from_value(value).unwrap()
}

/// Poll the history until `task_id` has a result.
async fn first_result(runtime: &Runtime, task_id: &str) -> ExecResult {
    for _ in 0..100 {
        let page = runtime
            .tasks()
            .history(&HistoryFilter::for_task(task_id))
            .await
            .unwrap();
        if let Some(result) = page.items.into_iter().next() {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no execution recorded for {task_id}");
}

#[tokio::test]
async fn test_system_handler_every_second() {
    let (runtime, store) = started().await;

    let info = runtime
        .tasks()
        .create_task(request(json!({
            "name": "echo every second",
            "cron": "*/1 * * * * *",
            "type": "system",
            "config": {
                "handler_name": "echo",
                "parameters": {"text": "hi"},
                "timeout": 5_000_000_000_u64,
                "retry_count": 0
            }
        })))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    // waits for an in-flight fire so the counters settle
    runtime.shutdown().await;

    let stats = store.get_stats(&info.task.id).await.unwrap();
    assert!(stats.run_count >= 2, "run_count = {}", stats.run_count);
    assert_eq!(stats.success_count, stats.run_count);
    assert_eq!(stats.failed_count, 0);

    let history = store
        .list_history(&HistoryFilter {
            page_size: 100,
            ..HistoryFilter::for_task(&info.task.id)
        })
        .await
        .unwrap();
    assert!(history.total >= 2);
    for result in &history.items {
        assert_eq!(result.status, ExecStatus::Success);
        assert_eq!(result.output, "hi");
        assert_eq!(result.retry, 0);
        assert!(result.end_time >= result.start_time);
    }
}

#[tokio::test]
async fn test_http_retry_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let (runtime, _) = started().await;
    let info = runtime
        .tasks()
        .create_task(request(json!({
            "name": "flaky endpoint",
            "cron": "0 0 0 1 1 *",
            "type": "http",
            "config": {
                "url": format!("{}/flaky", server.uri()),
                "method": "GET",
                "retry_count": 1,
                "retry_delay": 100_000_000_u64,
                "expected_code": 200
            }
        })))
        .await
        .unwrap();
    runtime.tasks().execute_now(&info.task.id).await.unwrap();

    let result = first_result(&runtime, &info.task.id).await;
    assert_eq!(result.status, ExecStatus::Success);
    assert_eq!(result.retry, 1);
    assert_eq!(result.output, "ok");
    assert!(result.error.is_empty());
    assert!(result.duration >= Duration::from_millis(100));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_http_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let (runtime, _) = started().await;
    let info = runtime
        .tasks()
        .create_task(request(json!({
            "name": "slow endpoint",
            "cron": "0 0 0 1 1 *",
            "type": "http",
            "config": {
                "url": format!("{}/slow", server.uri()),
                "timeout": 200_000_000_u64,
                "retry_count": 0
            }
        })))
        .await
        .unwrap();
    runtime.tasks().execute_now(&info.task.id).await.unwrap();

    let result = first_result(&runtime, &info.task.id).await;
    assert_eq!(result.status, ExecStatus::Timeout);
    assert!(!result.error.is_empty());
    assert!(result.duration < Duration::from_secs(2));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_invalid_cron_is_rejected_immediately() {
    let (runtime, _) = started().await;
    let err = runtime
        .tasks()
        .create_task(request(json!({
            "name": "broken",
            "cron": "every tuesday",
            "type": "system",
            "config": {"handler_name": "echo"}
        })))
        .await
        .unwrap_err();
    assert!(matches!(err, cron_events::Error::InvalidExpression { .. }));
    runtime.shutdown().await;
}
