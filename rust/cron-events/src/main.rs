//! cron-events - main entry point
//!
//! Runs the cron scheduler, the event bus and the delayed event service
//! until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;

use cron_events::config::AppConfig;
use cron_events::logging::{OpTimer, init_tracing};
use cron_events::runtime::Runtime;
use cron_events::store::{InMemoryStore, RedisStore, SharedStore};
use cron_events::{log_banner, log_init_warning, log_success};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "cron-events")]
#[command(about = "Persistent cron scheduler with a delayed event bus")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, env = "CRON_EVENTS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level; overrides `logging.level`.
    #[arg(long, env = "CRON_EVENTS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Keep everything in memory even when Redis is configured.
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_tracing(&config.logging);

    log_banner!(
        format!("cron-events v{}", env!("CARGO_PKG_VERSION")),
        format!(
            "bus: {} workers | delayed poll: {:?}",
            config.bus.worker_count,
            config.delayed.poll_interval()
        )
    );

    let store = open_store(&config, args.memory_store).await;
    let runtime = Runtime::build(config, store)?;
    runtime.start().await?;

    shutdown_signal().await;

    runtime.shutdown().await;
    log_success!("Shut down gracefully");
    Ok(())
}

/// Connect to Redis, falling back to the in-memory store.
async fn open_store(config: &AppConfig, force_memory: bool) -> SharedStore {
    let timer = OpTimer::new("main", "store");
    let memory = || -> SharedStore {
        Arc::new(InMemoryStore::with_limits(
            config.scheduler.history_ttl(),
            config.records.retention,
        ))
    };

    let store = match (&config.redis.url, force_memory) {
        (_, true) => {
            log_init_warning!("--memory-store given; nothing will survive a restart");
            memory()
        }
        (None, false) => {
            log_init_warning!("No Redis URL configured; using the in-memory store");
            memory()
        }
        (Some(url), false) => match RedisStore::connect(url, &config.redis.key_prefix).await {
            Ok(store) => {
                tracing::info!(url = %url, "Connected to Redis");
                Arc::new(
                    store.with_limits(config.scheduler.history_ttl(), config.records.retention),
                )
            }
            Err(e) => {
                log_init_warning!(
                    "Failed to connect to Redis: {}. Using the in-memory store.",
                    e
                );
                memory()
            }
        },
    };
    timer.finish();
    store
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        () = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
