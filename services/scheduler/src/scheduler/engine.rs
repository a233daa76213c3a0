//! Placement engine.
//!
//! Picks one server and a set of its replicas for the latest version of a
//! model, and commits the choice to the store. A model's replicas never
//! span servers: a server is only a candidate if it alone has enough
//! qualifying replicas.

use std::sync::Arc;

use mlsched_events::{event_sources, ServerEventMsg, ServerUpdateContext};
use mlsched_placement::{retain_passing, sort_candidates};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::filters::{
    default_replica_filters, default_server_filters, ReplicaFilterChain, ServerFilterChain,
};
use super::sorters::{
    default_replica_sorters, default_server_sorters, ReplicaSorterChain, ServerSorterChain,
};
use crate::store::{MemoryStore, ModelSnapshot, ModelState, ModelVersion, StoreError};

const NO_MATCHING_SERVERS: &str = "no matching servers available";
const NOT_ENOUGH_REPLICAS: &str =
    "failed to schedule model as no matching server had enough suitable replicas";

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no candidate server for model {model}")]
    NoCandidate { model: String },

    #[error("model {0} has no versions")]
    NoLatestVersion(String),
}

/// Filter and sorter chains used by a [`Scheduler`].
pub struct SchedulerConfig {
    pub server_filters: ServerFilterChain,
    pub server_sorters: ServerSorterChain,
    pub replica_filters: ReplicaFilterChain,
    pub replica_sorters: ReplicaSorterChain,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            server_filters: default_server_filters(),
            server_sorters: default_server_sorters(),
            replica_filters: default_replica_filters(),
            replica_sorters: default_replica_sorters(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_server_sorters(mut self, sorters: ServerSorterChain) -> Self {
        self.server_sorters = sorters;
        self
    }

    pub fn with_replica_sorters(mut self, sorters: ReplicaSorterChain) -> Self {
        self.replica_sorters = sorters;
        self
    }
}

/// Model placement engine.
pub struct Scheduler {
    store: Arc<MemoryStore>,
    server_filters: ServerFilterChain,
    server_sorters: ServerSorterChain,
    replica_filters: ReplicaFilterChain,
    replica_sorters: ReplicaSorterChain,
    /// Serializes filter evaluation and commit across callers.
    commit_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self::with_config(store, SchedulerConfig::default())
    }

    pub fn with_config(store: Arc<MemoryStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            server_filters: config.server_filters,
            server_sorters: config.server_sorters,
            replica_filters: config.replica_filters,
            replica_sorters: config.replica_sorters,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Places, re-places or tears down the latest version of a model.
    ///
    /// Fails with [`SchedulerError::NoCandidate`] after recording
    /// `ScheduleFailed` on the version when no server fits.
    #[instrument(skip(self), fields(model = %model_name))]
    pub async fn schedule(&self, model_name: &str) -> SchedulerResult<()> {
        let _guard = self.commit_lock.lock().await;

        let model = self.store.get_model(model_name).await?;
        let latest = model
            .latest()
            .cloned()
            .ok_or_else(|| SchedulerError::NoLatestVersion(model_name.to_string()))?;

        if model.deleted {
            return self.teardown(&model, &latest).await;
        }

        let servers = self.store.get_servers().await?;
        let mut candidates = retain_passing(&self.server_filters, &latest, servers);
        if candidates.is_empty() {
            self.store
                .failed_scheduling(
                    model_name,
                    latest.version,
                    NO_MATCHING_SERVERS,
                    !latest.has_live_replicas(),
                )
                .await?;
            return Err(SchedulerError::NoCandidate {
                model: model_name.to_string(),
            });
        }
        sort_candidates(&self.server_sorters, &latest, &mut candidates);

        let desired = latest.desired_replicas() as usize;
        for server in &candidates {
            let mut replicas =
                retain_passing(&self.replica_filters, &latest, server.replicas.clone());
            if replicas.len() < desired {
                debug!(
                    server = %server.name,
                    suitable = replicas.len(),
                    desired,
                    "Not enough suitable replicas on server"
                );
                continue;
            }
            sort_candidates(&self.replica_sorters, &latest, &mut replicas);
            let target: Vec<u32> = replicas.iter().take(desired).map(|r| r.idx).collect();

            match self
                .store
                .update_loaded_models(model_name, latest.version, &server.name, &target)
                .await
            {
                Ok(()) => {
                    info!(
                        version = latest.version,
                        server = %server.name,
                        replicas = ?target,
                        "Scheduled model"
                    );
                    return Ok(());
                }
                Err(e @ (StoreError::ServerNotFound(_) | StoreError::ReplicaNotFound(_))) => {
                    warn!(server = %server.name, error = %e, "Failed to commit placement, trying next server");
                }
                Err(e) => {
                    // The model changed under us; its new state gets its own pass.
                    warn!(version = latest.version, error = %e, "Placement superseded, abandoning pass");
                    return Err(e.into());
                }
            }
        }

        if !latest.server.is_empty() {
            self.store.event_hub().publish_server_event(
                event_sources::SERVER_SCALE_UP,
                ServerEventMsg::new(&latest.server, 0, ServerUpdateContext::ScaleUp),
            );
        }
        let reset = !latest.has_live_replicas() && !latest.has_loading_replicas();
        self.store
            .failed_scheduling(model_name, latest.version, NOT_ENOUGH_REPLICAS, reset)
            .await?;
        Err(SchedulerError::NoCandidate {
            model: model_name.to_string(),
        })
    }

    /// Unloads every version of a deleted model.
    async fn teardown(&self, model: &ModelSnapshot, latest: &ModelVersion) -> SchedulerResult<()> {
        for mv in &model.versions {
            if !mv.replicas_to_unload().is_empty() {
                self.store
                    .unload_version_models(&model.name, mv.version)
                    .await?;
            }
        }
        self.store
            .update_loaded_models(&model.name, latest.version, &latest.server, &[])
            .await?;
        info!(version = latest.version, "Tore down deleted model");
        Ok(())
    }

    /// Retries models whose latest version failed or is under-replicated.
    ///
    /// Returns the names that were scheduled successfully.
    #[instrument(skip(self))]
    pub async fn schedule_failed_models(&self) -> SchedulerResult<Vec<String>> {
        let models = self.store.get_models().await?;

        let mut scheduled = Vec::new();
        for model in models.iter().filter(|m| needs_retry(m)) {
            match self.schedule(&model.name).await {
                Ok(()) => scheduled.push(model.name.clone()),
                Err(e) => {
                    debug!(model = %model.name, error = %e, "Failed to reschedule model");
                }
            }
        }
        Ok(scheduled)
    }
}

fn needs_retry(model: &ModelSnapshot) -> bool {
    if model.deleted {
        return false;
    }
    let Some(latest) = model.latest() else {
        return false;
    };
    match latest.status.state {
        ModelState::Failed | ModelState::ScheduleFailed => true,
        ModelState::Available | ModelState::Progressing => {
            latest.status.available_replicas < latest.desired_replicas()
        }
        _ => false,
    }
}
