//! Persistent cron scheduling and delayed event delivery.
//!
//! The crate combines three cooperating components over one durable store:
//!
//! - [`scheduler`]: six-field cron tasks (HTTP calls or registered system
//!   handlers) with retries, timeouts, execution history and stats
//! - [`events`]: a bounded in-process event bus with per-key ordering, and
//!   a delayed event service that delivers persisted events at their due time
//! - [`store`]: the [`Store`](store::Store) trait with Redis and in-memory
//!   backends
//!
//! [`runtime::Runtime`] wires everything together and owns start-up and
//! shutdown ordering.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cron_events::{config::AppConfig, runtime::Runtime, store::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let runtime = Runtime::build(config, Arc::new(InMemoryStore::new()))?;
//!     runtime.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use error::{Error, Result};
