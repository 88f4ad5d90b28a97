//! Event façade used by the hosting layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bus::{BusMetrics, EventBus, EventHandler, SubscriptionOptions};
use super::delayed::DelayedEventService;
use super::types::{DelayedEvent, Event, EventRecord, Priority};
use crate::error::Result;
use crate::store::{EventFilter, EventMetrics, Page, SharedStore};

/// Delivery policy for a scheduled delayed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedEventOptions {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for DelayedEventOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            max_retries: default_max_retries(),
        }
    }
}

/// Bus counters plus persisted delayed-event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceMetrics {
    pub bus: BusMetrics,
    /// `None` when the store could not be queried.
    pub store: Option<EventMetrics>,
}

#[derive(Debug, Clone)]
pub struct EventService {
    bus: EventBus,
    delayed: DelayedEventService,
    store: SharedStore,
}

impl EventService {
    pub fn new(bus: EventBus, delayed: DelayedEventService, store: SharedStore) -> Self {
        Self {
            bus,
            delayed,
            store,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn delayed(&self) -> &DelayedEventService {
        &self.delayed
    }

    /// Publish and wait for synchronous subscribers. Returns the event id.
    pub async fn publish_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
    ) -> Result<String> {
        let event = Event::new(event_type, payload, source);
        let id = event.id.clone();
        self.bus.publish(event).await?;
        Ok(id)
    }

    /// Enqueue for asynchronous subscribers only. Returns the event id.
    pub fn publish_event_async(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
    ) -> Result<String> {
        let event = Event::new(event_type, payload, source);
        let id = event.id.clone();
        self.bus.publish_async(event)?;
        Ok(id)
    }

    pub async fn schedule_delayed_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
        delay_until: DateTime<Utc>,
        options: DelayedEventOptions,
    ) -> Result<DelayedEvent> {
        let mut event = DelayedEvent::new(Event::new(event_type, payload, source), delay_until);
        event.priority = options.priority;
        event.max_retries = options.max_retries;
        self.delayed.schedule(event).await
    }

    pub async fn cancel_delayed_event(&self, id: &str) -> Result<()> {
        self.delayed.cancel(id).await
    }

    pub async fn get_delayed_event(&self, id: &str) -> Result<DelayedEvent> {
        self.store.get_delayed(id).await
    }

    pub async fn list_delayed_events(&self, filter: &EventFilter) -> Result<Page<DelayedEvent>> {
        self.store.list_delayed(filter).await
    }

    pub async fn list_event_records(&self, filter: &EventFilter) -> Result<Page<EventRecord>> {
        self.store.list_records(filter).await
    }

    pub fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Result<()> {
        self.bus.subscribe(event_type, handler, options)
    }

    pub fn unsubscribe(&self, event_type: &str, handler_name: &str) -> Result<()> {
        self.bus.unsubscribe(event_type, handler_name)
    }

    pub async fn metrics(&self) -> ServiceMetrics {
        let store = match self.store.metrics().await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read delayed event metrics");
                None
            }
        };
        ServiceMetrics {
            bus: self.bus.metrics(),
            store,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::config::{BusConfig, DelayedConfig};
    use crate::error::Error;
    use crate::events::bus::{EventPublisher, handler_fn};
    use crate::events::types::EventStatus;
    use crate::store::InMemoryStore;

    fn service() -> EventService {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let bus = EventBus::new(BusConfig::default());
        let delayed = DelayedEventService::new(
            Arc::clone(&store),
            Arc::new(bus.clone()) as Arc<dyn EventPublisher>,
            None,
            DelayedConfig::default(),
        );
        EventService::new(bus, delayed, store)
    }

    #[tokio::test]
    async fn test_publish_reaches_sync_subscriber() {
        let service = service();
        service.bus().start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service
            .subscribe(
                "user.login",
                handler_fn("audit", move |event: Event| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push(event.payload["user"].clone());
                        anyhow::Ok(())
                    }
                }),
                SubscriptionOptions::sync(),
            )
            .unwrap();

        let id = service
            .publish_event("user.login", json!({"user": "ana"}), "test")
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(seen.lock().as_slice(), &[json!("ana")]);

        service.unsubscribe("user.login", "audit").unwrap();
        assert!(service.unsubscribe("user.login", "audit").is_err());
        service.bus().stop().await;
    }

    #[tokio::test]
    async fn test_publish_requires_running_bus() {
        let service = service();
        let err = service
            .publish_event_async("user.login", json!({}), "test")
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_schedule_applies_options() {
        let service = service();
        let scheduled = service
            .schedule_delayed_event(
                "report.ready",
                json!({"n": 1}),
                "reports",
                Utc::now() + chrono::Duration::minutes(5),
                DelayedEventOptions {
                    priority: Priority::Critical,
                    max_retries: 1,
                },
            )
            .await
            .unwrap();

        let stored = service.get_delayed_event(scheduled.id()).await.unwrap();
        assert_eq!(stored.priority, Priority::Critical);
        assert_eq!(stored.max_retries, 1);
        assert_eq!(stored.status, EventStatus::Pending);

        let page = service
            .list_delayed_events(&EventFilter {
                types: vec!["report.ready".into()],
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let metrics = service.metrics().await;
        assert_eq!(metrics.store.map(|m| m.pending_events), Some(1));
        assert_eq!(metrics.bus.total_events, 0);

        service.cancel_delayed_event(scheduled.id()).await.unwrap();
        assert!(service.get_delayed_event(scheduled.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_records_delivery() {
        let service = service();
        service.bus().start();
        let scheduled = service
            .schedule_delayed_event(
                "report.ready",
                json!({}),
                "reports",
                Utc::now() + chrono::Duration::milliseconds(20),
                DelayedEventOptions::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        service.delayed().sweep_once().await.unwrap();

        let records = service
            .list_event_records(&EventFilter::default())
            .await
            .unwrap();
        assert_eq!(records.total, 1);
        assert_eq!(records.items[0].event_id, scheduled.id());
        assert_eq!(records.items[0].status, EventStatus::Delivered);
        service.bus().stop().await;
    }
}
