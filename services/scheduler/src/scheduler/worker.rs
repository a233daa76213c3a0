//! Scheduler background worker.
//!
//! Retries failed and under-replicated models on a periodic interval, and
//! immediately when a server replica connects.

use std::sync::Arc;
use std::time::Duration;

use mlsched_events::{EventError, EventHub, ServerUpdateContext};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument};

use super::engine::{Scheduler, SchedulerResult};

/// Hub consumer name used by [`SchedulerWorker::subscribe`].
pub const SCHEDULER_WORKER_HANDLER: &str = "scheduler-worker";

/// Scheduler worker that runs the retry loop.
pub struct SchedulerWorker {
    scheduler: Arc<Scheduler>,
    interval: Duration,
    nudge: Arc<Notify>,
}

impl SchedulerWorker {
    pub fn new(scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            nudge: Arc::new(Notify::new()),
        }
    }

    /// Wakes the worker for an immediate retry pass.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    /// Registers a Server topic consumer that nudges the worker whenever a
    /// replica connects.
    pub fn subscribe(&self, hub: &EventHub, queue_capacity: usize) -> Result<(), EventError> {
        let nudge = self.nudge.clone();
        hub.register_server_handler(SCHEDULER_WORKER_HANDLER, queue_capacity, move |evt| {
            if evt.payload.update_context == ServerUpdateContext::ReplicaConnected {
                debug!(server = %evt.payload.server_name, "Replica connected, nudging scheduler");
                nudge.notify_one();
            }
        })
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                _ = self.nudge.notified() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_pass(&self) {
        if let Err(e) = self.run_once().await {
            error!(error = %e, "Scheduler retry pass failed");
        }
    }

    /// Run a single retry pass, returning the models that were placed.
    pub async fn run_once(&self) -> SchedulerResult<Vec<String>> {
        let scheduled = self.scheduler.schedule_failed_models().await?;

        if !scheduled.is_empty() {
            info!(
                scheduled = scheduled.len(),
                models = ?scheduled,
                "Scheduler retry pass complete"
            );
        }

        Ok(scheduled)
    }
}
