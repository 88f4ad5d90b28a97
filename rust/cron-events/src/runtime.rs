//! Component wiring and lifecycle.
//!
//! Build order is store, registry, scheduler, bus, delayed service, the
//! services and the bridge. Start order is bus, scheduler, delayed service;
//! shutdown runs in reverse, each step bounded by its own grace period.

use std::sync::Arc;

use serde_json::json;

use crate::config::AppConfig;
use crate::error::Result;
use crate::events::{
    CronEventBridge, DelayedEventService, EventBus, EventPublisher, EventService, SYSTEM_SHUTDOWN,
    SYSTEM_STARTUP,
};
use crate::logging::OpTimer;
use crate::registry::Registry;
use crate::scheduler::{CronScheduler, LogHandler, TaskExecutor, TaskService};
use crate::store::SharedStore;
use crate::{log_init_step, log_success};

const SOURCE: &str = "runtime";
const STEPS: u32 = 6;

#[derive(Debug)]
pub struct Runtime {
    config: AppConfig,
    registry: Arc<Registry>,
    scheduler: CronScheduler,
    tasks: TaskService,
    events: EventService,
    bridge: CronEventBridge,
}

impl Runtime {
    /// Wire every component over `store`. Nothing is started yet.
    pub fn build(config: AppConfig, store: SharedStore) -> Result<Self> {
        let timer = OpTimer::new("runtime", "build");

        let registry = Arc::new(Registry::new());
        registry.register(Arc::new(LogHandler))?;
        log_init_step!(1, STEPS, "Task Registry", "built-in handlers registered");

        let executor = TaskExecutor::new(
            Arc::clone(&registry),
            config.scheduler.default_task_timeout(),
        );
        let scheduler = CronScheduler::new(
            Arc::clone(&store),
            executor,
            config.scheduler.stop_grace(),
        );
        log_init_step!(2, STEPS, "Scheduler", "cron engine ready");

        let bus = EventBus::new(config.bus.clone());
        log_init_step!(
            3,
            STEPS,
            "Event Bus",
            format!(
                "{} workers, buffer {}",
                config.bus.worker_count, config.bus.buffer_size
            )
        );

        let delayed = DelayedEventService::new(
            Arc::clone(&store),
            Arc::new(bus.clone()) as Arc<dyn EventPublisher>,
            Some(scheduler.clone()),
            config.delayed.clone(),
        );
        registry.register(delayed.trigger_handler())?;
        log_init_step!(
            4,
            STEPS,
            "Delayed Events",
            format!("poll every {:?}", config.delayed.poll_interval())
        );

        let tasks = TaskService::new(Arc::clone(&store), scheduler.clone(), Arc::clone(&registry));
        let events = EventService::new(bus, delayed, store);
        log_init_step!(5, STEPS, "Services", "task and event façades ready");

        let bridge = CronEventBridge::new(events.clone());
        bridge.install(&scheduler, tasks.clone())?;
        log_init_step!(6, STEPS, "Cron Event Bridge", "fire events enabled");

        timer.finish();
        Ok(Self {
            config,
            registry,
            scheduler,
            tasks,
            events,
            bridge,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskService {
        &self.tasks
    }

    pub fn events(&self) -> &EventService {
        &self.events
    }

    pub fn bridge(&self) -> &CronEventBridge {
        &self.bridge
    }

    /// Start the bus, then the scheduler, then the delayed service.
    pub async fn start(&self) -> Result<()> {
        self.events.bus().start();
        self.scheduler.start().await?;
        self.events.delayed().start();

        self.announce(SYSTEM_STARTUP).await;
        log_success!("All components started");
        Ok(())
    }

    /// Stop everything in reverse start order.
    pub async fn shutdown(&self) {
        let timer = OpTimer::new("runtime", "shutdown");
        self.announce(SYSTEM_SHUTDOWN).await;

        self.events.delayed().stop().await;
        self.scheduler.stop().await;
        self.events.bus().stop().await;
        timer.finish();
    }

    /// Sync subscribers run before this returns; async ones get the event
    /// queued.
    async fn announce(&self, event_type: &str) {
        let payload = json!({ "version": env!("CARGO_PKG_VERSION") });
        if let Err(e) = self.events.publish_event(event_type, payload, SOURCE).await {
            tracing::warn!(event_type, error = %e, "Failed to publish lifecycle event");
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::events::{Event, SubscriptionOptions, TRIGGER_HANDLER, handler_fn};
    use crate::store::InMemoryStore;

    fn runtime() -> Runtime {
        Runtime::build(AppConfig::default(), Arc::new(InMemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_build_registers_handlers() {
        let runtime = runtime();
        assert!(runtime.registry().contains("log"));
        assert!(runtime.registry().contains(TRIGGER_HANDLER));
        assert!(!runtime.tasks().scheduler_status().await.running);
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let runtime = runtime();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for event_type in [SYSTEM_STARTUP, SYSTEM_SHUTDOWN] {
            let sink = Arc::clone(&seen);
            runtime
                .events()
                .subscribe(
                    event_type,
                    handler_fn("lifecycle", move |event: Event| {
                        let sink = Arc::clone(&sink);
                        async move {
                            sink.lock().push(event.event_type);
                            anyhow::Ok(())
                        }
                    }),
                    SubscriptionOptions::sync(),
                )
                .unwrap();
        }

        runtime.start().await.unwrap();
        assert!(runtime.tasks().scheduler_status().await.running);
        assert!(runtime.events().delayed().is_running());

        runtime.shutdown().await;
        assert!(!runtime.events().bus().is_running());
        assert!(!runtime.events().delayed().is_running());
        assert_eq!(
            seen.lock().as_slice(),
            &[SYSTEM_STARTUP.to_string(), SYSTEM_SHUTDOWN.to_string()]
        );
    }
}
