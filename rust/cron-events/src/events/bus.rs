//! Fan-out event bus with per-subscription sync/async dispatch.
//!
//! # Architecture
//!
//! ```text
//! publish_async(event) ─▶ [main channel, B] ─▶ dispatcher
//!                                               │ hash(type + id) % W
//!                          ┌────────────────────┼────────────────────┐
//!                          ▼                    ▼                    ▼
//!                     worker 0 [B/W]       worker 1 [B/W]  ...  worker W-1
//!                          │
//!                          ▼
//!                async subscriptions of event.type, one after another
//! ```
//!
//! Events with the same type and id always land on the same worker, so
//! they are handled in publish order. Publishing never blocks: a full
//! channel is reported as [`Error::QueueFull`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::types::Event;
use crate::config::BusConfig;
use crate::error::{Error, Result, panic_message};
use crate::scheduler::task::duration_nanos;

/// A subscriber. Handlers get the event by reference and must not rely on
/// being called more than once per delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Unique per event type.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

/// Build a handler from a closure.
///
/// ```rust,ignore
/// let audit = handler_fn("audit", |event: Event| async move {
///     tracing::info!(event_id = %event.id, "seen");
///     anyhow::Ok(())
/// });
/// bus.subscribe("user.login", audit, SubscriptionOptions::default())?;
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Per-subscription policy.
///
/// `max_retries` and `retry_delay` are carried for producers that retry
/// (the delayed event service); the bus itself delivers once.
/// `persistent` is recorded but subscriptions are not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    #[serde(rename = "async")]
    pub is_async: bool,
    pub max_retries: u32,
    #[serde(with = "duration_nanos")]
    pub retry_delay: Duration,
    /// Zero falls back to the bus-wide handler timeout.
    #[serde(with = "duration_nanos")]
    pub timeout: Duration,
    pub persistent: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            is_async: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
            persistent: false,
        }
    }
}

impl SubscriptionOptions {
    /// Default options with synchronous delivery.
    pub fn sync() -> Self {
        Self {
            is_async: false,
            ..Self::default()
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub total_events: u64,
    /// Accepted on the main channel, not yet routed to a worker.
    pub pending_events: u64,
    /// Successful handler invocations.
    pub delivered_events: u64,
    /// Failed handler invocations plus events dropped on full channels.
    pub failed_events: u64,
}

/// Anything events can be enqueued on without blocking.
pub trait EventPublisher: Send + Sync {
    fn publish_async(&self, event: Event) -> Result<()>;
}

struct Subscription {
    handler: Arc<dyn EventHandler>,
    options: SubscriptionOptions,
}

struct Running {
    tx: mpsc::Sender<Event>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    pending: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn dec_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

struct BusInner {
    config: BusConfig,
    subscriptions: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
    running: Mutex<Option<Running>>,
    counters: Counters,
}

/// The event bus. Clones share the same channels and subscriptions.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffer_size", &self.inner.config.buffer_size)
            .field("worker_count", &self.inner.config.worker_count)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: RwLock::new(HashMap::new()),
                running: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Create the channels and spawn the dispatcher and workers. Starting a
    /// running bus does nothing.
    pub fn start(&self) {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return;
        }

        let workers = self.inner.config.worker_count.max(1);
        let buffer = self.inner.config.buffer_size.max(1);
        let per_worker = (buffer / workers).max(1);
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(buffer);

        let mut handles = Vec::with_capacity(workers + 1);
        let mut senders = Vec::with_capacity(workers);
        for id in 0..workers {
            let (worker_tx, worker_rx) = mpsc::channel(per_worker);
            senders.push(worker_tx);
            handles.push(tokio::spawn(run_worker(
                id,
                worker_rx,
                token.clone(),
                Arc::clone(&self.inner),
            )));
        }
        handles.push(tokio::spawn(run_dispatcher(
            rx,
            senders,
            token.clone(),
            Arc::clone(&self.inner),
        )));

        *running = Some(Running { tx, token, handles });
        tracing::info!(
            worker_count = workers,
            buffer_size = buffer,
            "Event bus started"
        );
    }

    /// Cancel the workers, close the channel and wait up to the stop timeout.
    /// Events still queued are counted as failed.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };
        running.token.cancel();
        drop(running.tx);

        let mut handles = running.handles;
        let wait = futures::future::join_all(handles.iter_mut());
        if tokio::time::timeout(self.inner.config.stop_timeout(), wait)
            .await
            .is_err()
        {
            tracing::warn!("Event bus workers did not stop in time; aborting them");
            for handle in &handles {
                handle.abort();
            }
        }
        tracing::info!("Event bus stopped");
    }

    pub fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Result<()> {
        let name = handler.name().to_string();
        let mut subscriptions = self.inner.subscriptions.write();
        let list = subscriptions.entry(event_type.to_string()).or_default();
        if list.iter().any(|s| s.handler.name() == name) {
            return Err(Error::conflict("subscription", format!("{event_type}/{name}")));
        }
        tracing::info!(
            event_type,
            handler = %name,
            is_async = options.is_async,
            "Handler subscribed"
        );
        list.push(Arc::new(Subscription { handler, options }));
        Ok(())
    }

    pub fn unsubscribe(&self, event_type: &str, handler_name: &str) -> Result<()> {
        let mut subscriptions = self.inner.subscriptions.write();
        let list = subscriptions
            .get_mut(event_type)
            .ok_or_else(|| Error::not_found("subscription", format!("{event_type}/{handler_name}")))?;
        let before = list.len();
        list.retain(|s| s.handler.name() != handler_name);
        if list.len() == before {
            return Err(Error::not_found(
                "subscription",
                format!("{event_type}/{handler_name}"),
            ));
        }
        if list.is_empty() {
            subscriptions.remove(event_type);
        }
        tracing::info!(event_type, handler = handler_name, "Handler unsubscribed");
        Ok(())
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Deliver to every subscription of `event.event_type`.
    ///
    /// Sync subscriptions run here, each under its timeout. If any async
    /// subscription exists the event is enqueued once for the workers. Every
    /// subscription is attempted; the last error is returned.
    pub async fn publish(&self, event: Event) -> Result<()> {
        let tx = self.sender()?;
        self.inner.counters.total.fetch_add(1, Ordering::Relaxed);

        let subscriptions = self.inner.snapshot(&event.event_type);
        if subscriptions.is_empty() {
            tracing::debug!(event_type = %event.event_type, event_id = %event.id, "No subscribers");
            return Ok(());
        }

        let mut last_error = None;
        let mut enqueued = false;
        for sub in &subscriptions {
            if sub.options.is_async {
                if !enqueued {
                    enqueued = true;
                    if let Err(e) = self.inner.enqueue(&tx, event.clone()) {
                        last_error = Some(e);
                    }
                }
                continue;
            }

            match self.inner.invoke(sub, &event).await {
                Ok(()) => {
                    self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        event_type = %event.event_type,
                        event_id = %event.id,
                        handler = %sub.handler.name(),
                        error = %e,
                        "Sync handler failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        last_error.map_or(Ok(()), Err)
    }

    /// Enqueue for async subscriptions. Never waits.
    pub fn publish_async(&self, event: Event) -> Result<()> {
        let tx = self.sender()?;
        self.inner.counters.total.fetch_add(1, Ordering::Relaxed);
        self.inner.enqueue(&tx, event)
    }

    pub fn metrics(&self) -> BusMetrics {
        let c = &self.inner.counters;
        BusMetrics {
            total_events: c.total.load(Ordering::Relaxed),
            pending_events: c.pending.load(Ordering::Relaxed),
            delivered_events: c.delivered.load(Ordering::Relaxed),
            failed_events: c.failed.load(Ordering::Relaxed),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Event>> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.tx.clone())
            .ok_or(Error::NotRunning("event bus"))
    }
}

impl EventPublisher for EventBus {
    fn publish_async(&self, event: Event) -> Result<()> {
        EventBus::publish_async(self, event)
    }
}

impl BusInner {
    fn snapshot(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn enqueue(&self, tx: &mpsc::Sender<Event>, event: Event) -> Result<()> {
        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.counters.dec_pending();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Event channel full"
                );
                Err(Error::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dec_pending();
                Err(Error::Cancelled)
            }
        }
    }

    /// Run one handler on its own task under the subscription timeout.
    async fn invoke(&self, sub: &Subscription, event: &Event) -> Result<()> {
        let handler = Arc::clone(&sub.handler);
        let name = handler.name().to_string();
        let timeout = if sub.options.timeout.is_zero() {
            self.config.handler_timeout()
        } else {
            sub.options.timeout
        };

        let owned = event.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned).await });
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::HandlerFailed {
                handler: name,
                reason: format!("{e:#}"),
            }),
            Ok(Err(e)) if e.is_panic() => Err(Error::HandlerPanic {
                handler: name,
                message: panic_message(e.into_panic()),
            }),
            Ok(Err(e)) => Err(Error::HandlerFailed {
                handler: name,
                reason: e.to_string(),
            }),
            Err(_) => {
                task.abort();
                Err(Error::HandlerTimeout {
                    handler: name,
                    timeout,
                })
            }
        }
    }

    async fn deliver(&self, worker_id: usize, event: &Event) {
        for sub in self.snapshot(&event.event_type) {
            if !sub.options.is_async {
                continue;
            }
            match self.invoke(&sub, event).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        worker_id,
                        event_type = %event.event_type,
                        event_id = %event.id,
                        handler = %sub.handler.name(),
                        error = %e,
                        "Async handler failed"
                    );
                }
            }
        }
    }

    fn discard(&self, rx: &mut mpsc::Receiver<Event>, routed: bool) -> u64 {
        rx.close();
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            if !routed {
                self.counters.dec_pending();
            }
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            dropped += 1;
        }
        dropped
    }
}

/// Multiply-by-31 string hash over type and id; stable across runs.
fn route(event: &Event, workers: usize) -> usize {
    let mut h: i64 = 0;
    for c in event.event_type.chars().chain(event.id.chars()) {
        h = h.wrapping_mul(31).wrapping_add(i64::from(u32::from(c)));
    }
    #[allow(clippy::cast_possible_truncation, reason = "result is below the worker count")]
    let index = (h.unsigned_abs() % workers as u64) as usize;
    index
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<Event>,
    workers: Vec<mpsc::Sender<Event>>,
    token: CancellationToken,
    inner: Arc<BusInner>,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        inner.counters.dec_pending();

        let worker_id = route(&event, workers.len());
        if let Err(e) = workers[worker_id].try_send(event) {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            let event = match e {
                TrySendError::Full(event) | TrySendError::Closed(event) => event,
            };
            tracing::warn!(
                worker_id,
                event_type = %event.event_type,
                event_id = %event.id,
                "Worker channel full, dropping event"
            );
        }
    }

    let dropped = inner.discard(&mut rx, false);
    tracing::debug!(dropped, "Dispatcher stopped");
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<Event>,
    token: CancellationToken,
    inner: Arc<BusInner>,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => inner.deliver(id, &event).await,
                None => break,
            },
        }
    }

    let dropped = inner.discard(&mut rx, true);
    tracing::debug!(worker_id = id, dropped, "Worker stopped");
}
