//! mlsched scheduler
//!
//! Runs the model placement scheduler: the in-memory store, the placement
//! engine and the background retry and cleanup sweeps. A transport layer
//! drives placement through the library API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mlsched_events::EventHub;
use mlsched_scheduler::{
    cleanup::{CleanupWorker, CleanupWorkerConfig},
    config,
    scheduler::{Scheduler, SchedulerWorker},
    store::MemoryStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MLSCHED_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mlsched scheduler");
    info!(
        retry_interval_secs = config.retry_interval.as_secs(),
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        event_queue_size = config.event_queue_size,
        "Configuration loaded"
    );

    let hub = Arc::new(EventHub::new());
    let store = Arc::new(MemoryStore::new(hub.clone()));

    match store.restore().await {
        Ok(restored) => info!(restored, "Model catalog restored"),
        Err(e) => {
            error!(error = %e, "Failed to restore model catalog");
            return Err(e.into());
        }
    }

    let scheduler = Arc::new(Scheduler::new(store.clone()));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start scheduler worker in background
    let scheduler_worker = SchedulerWorker::new(scheduler.clone(), config.retry_interval);
    scheduler_worker.subscribe(&hub, config.event_queue_size)?;
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler_worker.run(shutdown_rx).await;
        }
    });

    // Start cleanup worker in background
    let cleanup_worker = CleanupWorker::new(
        store.clone(),
        CleanupWorkerConfig {
            interval: config.cleanup_interval,
        },
    );
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup_worker.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, cleanup_handle).await {
        warn!(error = %e, "Cleanup worker did not shut down in time");
    }

    hub.close();
    if tokio::time::timeout(shutdown_timeout, hub.wait_for_handlers())
        .await
        .is_err()
    {
        warn!("Event handlers did not drain in time");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
