//! Event bus, delayed delivery and the bridge to the scheduler.
//!
//! - [`bus`]: in-process fan-out with sync and async subscriptions
//! - [`delayed`]: persisted events delivered at a due time
//! - [`service`]: the façade the hosting layer calls
//! - [`integration`]: publishes scheduler fires and runs deferred tasks

pub mod bus;
pub mod delayed;
pub mod integration;
pub mod service;
mod types;

pub use bus::{
    BusMetrics, EventBus, EventHandler, EventPublisher, FnHandler, SubscriptionOptions, handler_fn,
};
pub use delayed::{DelayedEventService, DelayedTrigger, SweepReport, TRIGGER_HANDLER};
pub use integration::{CronEventBridge, CronTaskPayload, DelayedTaskExecutor};
pub use service::{DelayedEventOptions, EventService, ServiceMetrics};
pub use types::*;
