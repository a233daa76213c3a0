use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::store::{MemoryStore, StoreResult};

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Periodically unloads model versions superseded by a fully available
/// successor.
pub struct CleanupWorker {
    store: Arc<MemoryStore>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(store: Arc<MemoryStore>, config: CleanupWorkerConfig) -> Self {
        Self { store, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cleanup().await {
                        error!(error = %e, "Failed to reclaim superseded model versions");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one sweep and returns how many versions were asked to unload.
    pub async fn run_cleanup(&self) -> StoreResult<usize> {
        let reclaimed = self.store.reclaim_superseded_versions().await?;
        if !reclaimed.is_empty() {
            let versions: Vec<String> = reclaimed.iter().map(|id| id.to_string()).collect();
            info!(
                reclaimed = reclaimed.len(),
                versions = ?versions,
                "Cleanup pass complete"
            );
        }
        Ok(reclaimed.len())
    }
}
