//! In-memory scheduler store.
//!
//! All state lives behind one store-wide async `RwLock`. Every mutation
//! validates and applies inside a single write-lock critical section, and
//! publishes its events before the lock is released, so each hub consumer
//! sees Model and Server events in mutation order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mlsched_events::{
    event_sources, EventHub, ModelEventMsg, ServerEventMsg, ServerUpdateContext,
};
use mlsched_id::{ModelName, ModelVersionId, ServerName, ServerReplicaId};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::error::{StoreError, StoreResult};
use super::model::{Model, ModelSnapshot, ModelSpec, ModelState, ModelVersion, ReplicaState};
use super::persistence::{NoopPersistence, Persistence};
use super::server::{Server, ServerReplica, ServerReplicaConfig, ServerSnapshot, ServerStats};
use super::status::schedule_failed_status;

#[derive(Default)]
struct StoreState {
    models: BTreeMap<String, Model>,
    servers: BTreeMap<String, Server>,
}

/// Authoritative state for models, servers and placements.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    hub: Arc<EventHub>,
    persistence: Arc<dyn Persistence>,
}

impl MemoryStore {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self::with_persistence(hub, Arc::new(NoopPersistence))
    }

    pub fn with_persistence(hub: Arc<EventHub>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            hub,
            persistence,
        }
    }

    pub fn event_hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    // =========================================================================
    // Models
    // =========================================================================

    /// Creates or updates a model from a load request.
    ///
    /// Returns the latest version number after the update. A new version is
    /// only appended when the spec materially changes, or when a deleted
    /// model whose latest version has fully wound down is loaded again.
    #[instrument(skip(self, spec), fields(model = %spec.name))]
    pub async fn update_model(&self, spec: ModelSpec) -> StoreResult<u32> {
        ModelName::parse(&spec.name)?;
        if let Some(server) = &spec.server {
            ServerName::parse(server)?;
        }

        let name = spec.name.clone();
        let mut state = self.state.write().await;

        if !state.models.contains_key(&name) {
            let model = Model::new(spec, 1);
            self.persist(&model);
            state.models.insert(name, model);
            info!(version = 1, "Created model");
            return Ok(1);
        }
        let model = model_mut(&mut state.models, &name)?;

        let (latest_version, latest_inactive, differs) = match model.latest() {
            Some(latest) => (
                latest.version,
                latest.is_inactive(),
                latest.spec.materially_differs(&spec),
            ),
            None => return Err(StoreError::VersionNotFound(ModelVersionId::new(&name, 0))),
        };

        let version = if model.deleted {
            if !latest_inactive {
                return Err(StoreError::Conflict(format!(
                    "model {} is being deleted",
                    name
                )));
            }
            model.deleted = false;
            let version = model.push_version(spec);
            info!(version, "Re-created deleted model");
            version
        } else if differs {
            let version = model.push_version(spec);
            info!(version, previous = latest_version, "Created new model version");
            version
        } else {
            debug!(version = latest_version, "Model spec unchanged");
            return Ok(latest_version);
        };

        self.persist(model);
        Ok(version)
    }

    pub async fn get_model(&self, name: &str) -> StoreResult<ModelSnapshot> {
        let state = self.state.read().await;
        state
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::ModelNotFound(name.to_string()))
    }

    pub async fn get_models(&self) -> StoreResult<Vec<ModelSnapshot>> {
        let state = self.state.read().await;
        Ok(state.models.values().cloned().collect())
    }

    pub async fn get_model_names(&self) -> StoreResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.models.keys().cloned().collect())
    }

    /// Marks a model deleted. Placement teardown happens on the next
    /// schedule pass for the model.
    #[instrument(skip(self))]
    pub async fn remove_model(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let model = model_mut(&mut state.models, name)?;
        let version = model
            .latest_version()
            .ok_or_else(|| StoreError::VersionNotFound(ModelVersionId::new(name, 0)))?;

        model.deleted = true;
        model.refresh_status(version);
        self.publish_model(event_sources::MODEL_UPDATE, name, version);
        self.persist(model);

        info!(version, "Marked model deleted");
        Ok(())
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Commits a placement of the latest version of a model.
    ///
    /// `target` is the full set of replica indices on `server` that should
    /// host the model. Indices not yet loading are requested; tracked
    /// indices outside `target` are asked to unload. Committing the same
    /// placement twice is a no-op apart from a status refresh.
    #[instrument(skip_all, fields(model = %model_name, version = version, server = %server))]
    pub async fn update_loaded_models(
        &self,
        model_name: &str,
        version: u32,
        server: &str,
        target: &[u32],
    ) -> StoreResult<()> {
        let mut guard = self.state.write().await;
        let StoreState { models, servers } = &mut *guard;

        let model = model_mut(models, model_name)?;
        let latest = model
            .latest_version()
            .ok_or_else(|| StoreError::VersionNotFound(ModelVersionId::new(model_name, version)))?;
        if latest != version {
            return Err(StoreError::Conflict(format!(
                "model {} version {} is not the latest ({})",
                model_name, version, latest
            )));
        }

        if server.is_empty() {
            if !target.is_empty() {
                return Err(StoreError::ServerNotFound(String::new()));
            }
            model.refresh_status(version);
            self.publish_model(event_sources::MODEL_UPDATE, model_name, version);
            self.evict_if_terminated(models, model_name);
            return Ok(());
        }

        let mut host = servers.get_mut(server);
        match host.as_deref() {
            None if !target.is_empty() => {
                return Err(StoreError::ServerNotFound(server.to_string()));
            }
            Some(host) => {
                if let Some(missing) = target.iter().find(|idx| !host.replicas.contains_key(*idx)) {
                    return Err(StoreError::ReplicaNotFound(ServerReplicaId::new(
                        server, *missing,
                    )));
                }
            }
            None => {}
        }

        // Replica indices from two servers never share one replica map.
        let mut version = version;
        let current_server = model.latest().map(|v| v.server.clone()).unwrap_or_default();
        if !current_server.is_empty() && current_server != server {
            let spec = model
                .latest()
                .map(|v| v.spec.clone())
                .ok_or_else(|| StoreError::VersionNotFound(ModelVersionId::new(model_name, version)))?;
            version = model.push_version(spec);
            info!(
                from = %current_server,
                version,
                "Placement moved to another server, created new model version"
            );
            self.persist(model);
        }

        let deleted = model.deleted;
        let mv = version_mut(model, version)?;

        let mut updated = false;
        for &idx in target {
            if !mv.replica_state(idx).is_loading_or_loaded() {
                let replica = host.as_mut().and_then(|h| h.replicas.get_mut(&idx));
                transition(mv, replica, idx, ReplicaState::LoadRequested, "");
                updated = true;
            }
        }
        let to_unload: Vec<u32> = mv
            .replicas
            .iter()
            .filter(|(idx, r)| !target.contains(*idx) && !r.state.is_unloading_or_unloaded())
            .map(|(idx, _)| *idx)
            .collect();
        for idx in to_unload {
            let replica = host.as_mut().and_then(|h| h.replicas.get_mut(&idx));
            transition(mv, replica, idx, ReplicaState::UnloadRequested, "");
            updated = true;
        }

        let status = mv.status.state;
        let under_replicated =
            status == ModelState::Available && mv.live_replicas() < mv.desired_replicas();
        if updated
            || deleted
            || under_replicated
            || matches!(status, ModelState::ScheduleFailed | ModelState::Progressing)
        {
            mv.server = server.to_string();
            model.refresh_status(version);
            self.publish_model(event_sources::MODEL_UPDATE, model_name, version);
            debug!(?target, updated, "Committed placement");
        }

        self.evict_if_terminated(models, model_name);
        Ok(())
    }

    /// Asks every replica of one version to unload.
    ///
    /// Returns true if any replica changed state.
    #[instrument(skip(self))]
    pub async fn unload_version_models(&self, model_name: &str, version: u32) -> StoreResult<bool> {
        let mut guard = self.state.write().await;
        let StoreState { models, servers } = &mut *guard;

        let model = model_mut(models, model_name)?;
        let mv = version_mut(model, version)?;
        let changed = request_unload(servers, mv);
        if changed {
            model.refresh_status(version);
            self.publish_model(event_sources::MODEL_UPDATE, model_name, version);
        }
        Ok(changed)
    }

    /// Records a replica lifecycle report from a server agent.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(model = %model_name, version = version, server = %server, replica = replica_idx))]
    pub async fn update_model_state(
        &self,
        model_name: &str,
        version: u32,
        server: &str,
        replica_idx: u32,
        available_memory: Option<u64>,
        state: ReplicaState,
        reason: &str,
    ) -> StoreResult<()> {
        let mut guard = self.state.write().await;
        let StoreState { models, servers } = &mut *guard;

        let model = model_mut(models, model_name)?;
        let host = servers
            .get_mut(server)
            .ok_or_else(|| StoreError::ServerNotFound(server.to_string()))?;
        let replica = host
            .replicas
            .get_mut(&replica_idx)
            .ok_or_else(|| StoreError::ReplicaNotFound(ServerReplicaId::new(server, replica_idx)))?;

        let mv = version_mut(model, version)?;
        if !mv.server.is_empty() && mv.server != server {
            return Err(StoreError::Conflict(format!(
                "model {} version {} is assigned to server {}, not {}",
                model_name, version, mv.server, server
            )));
        }

        let previous = mv.replica_state(replica_idx);
        let changed = previous != state;
        let mut removed_reference = false;
        if changed {
            let id = mv.id();
            transition(mv, Some(&mut *replica), replica_idx, state, reason);
            match state {
                ReplicaState::Loading | ReplicaState::Loaded | ReplicaState::Available => {
                    replica.loaded_models.insert(id);
                }
                ReplicaState::Unloaded | ReplicaState::LoadFailed => {
                    removed_reference = replica.loaded_models.remove(&id);
                }
                _ => {}
            }
            debug!(from = %previous, to = %state, "Replica state changed");
        }

        if let Some(memory) = available_memory {
            replica.available_memory_bytes = memory;
        }

        if !changed {
            return Ok(());
        }

        model.refresh_status(version);
        self.publish_model(event_sources::MODEL_UPDATE, model_name, version);
        if removed_reference {
            self.hub.publish_server_event(
                event_sources::SERVER_UPDATE,
                ServerEventMsg::new(server, replica_idx, ServerUpdateContext::ScaleDown),
            );
        }

        self.evict_if_terminated(models, model_name);
        Ok(())
    }

    /// Records that no placement could be found.
    ///
    /// With `reset` the assigned server is cleared so the next attempt may
    /// pick any server. Only the latest version can fail scheduling; a
    /// superseded version is rejected with [`StoreError::Conflict`].
    #[instrument(skip(self, reason))]
    pub async fn failed_scheduling(
        &self,
        model_name: &str,
        version: u32,
        reason: &str,
        reset: bool,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let model = model_mut(&mut state.models, model_name)?;
        let latest = model.latest_version();
        let mv = version_mut(model, version)?;
        if latest != Some(version) {
            return Err(StoreError::Conflict(format!(
                "model {} version {} is not the latest ({})",
                model_name,
                version,
                latest.unwrap_or_default()
            )));
        }

        mv.status = schedule_failed_status(mv, reason);
        if reset {
            mv.server.clear();
        }
        self.publish_model(event_sources::MODEL_SCHEDULING_FAILED, model_name, version);

        warn!(reason, reset, "Model scheduling failed");
        Ok(())
    }

    /// Unloads superseded versions once their successor is fully available,
    /// and every non-latest version of a deleted model.
    ///
    /// Returns the versions that were asked to unload.
    #[instrument(skip(self))]
    pub async fn reclaim_superseded_versions(&self) -> StoreResult<Vec<ModelVersionId>> {
        let mut guard = self.state.write().await;
        let StoreState { models, servers } = &mut *guard;

        let mut reclaimed = Vec::new();
        for model in models.values_mut() {
            let Some(latest) = model.latest() else {
                continue;
            };
            let fully_available = latest.status.state == ModelState::Available
                && latest.status.available_replicas >= latest.desired_replicas();
            if !(model.deleted || fully_available) {
                continue;
            }

            let latest_version = latest.version;
            let stale: Vec<u32> = model
                .versions
                .iter()
                .filter(|v| v.version != latest_version && !v.replicas_to_unload().is_empty())
                .map(|v| v.version)
                .collect();

            for version in stale {
                let Some(mv) = model.version_mut(version) else {
                    continue;
                };
                request_unload(servers, mv);
                reclaimed.push(mv.id());
                model.refresh_status(version);
                self.publish_model(event_sources::MODEL_UPDATE, &model.name, version);
            }
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed superseded model versions");
        }
        Ok(reclaimed)
    }

    // =========================================================================
    // Servers
    // =========================================================================

    /// Servers ordered by name.
    pub async fn get_servers(&self) -> StoreResult<Vec<ServerSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .servers
            .values()
            .map(|s| snapshot_server(s, &state.models))
            .collect())
    }

    pub async fn get_server(&self, name: &str) -> StoreResult<ServerSnapshot> {
        let state = self.state.read().await;
        state
            .servers
            .get(name)
            .map(|s| snapshot_server(s, &state.models))
            .ok_or_else(|| StoreError::ServerNotFound(name.to_string()))
    }

    /// Registers a connecting server replica, creating the server if needed.
    ///
    /// Models the agent reports as already loaded are adopted as `Loaded` on
    /// this replica.
    #[instrument(skip_all, fields(server = %config.server_name, replica = config.replica_idx))]
    pub async fn add_server_replica(&self, config: ServerReplicaConfig) -> StoreResult<()> {
        ServerName::parse(&config.server_name)?;
        for loaded in &config.loaded_models {
            ModelName::parse(&loaded.spec.name)?;
        }

        let mut guard = self.state.write().await;
        let StoreState { models, servers } = &mut *guard;

        let server_name = config.server_name.clone();
        let idx = config.replica_idx;
        let server = servers
            .entry(server_name.clone())
            .or_insert_with(|| Server::new(server_name.clone(), config.shared));
        server.shared = config.shared;

        let mut replica = config.to_replica();
        for loaded in &config.loaded_models {
            let name = loaded.spec.name.clone();
            let model = models
                .entry(name.clone())
                .or_insert_with(|| Model::new(loaded.spec.clone(), loaded.version));

            if model.version(loaded.version).is_none() {
                if model.latest_version().is_some_and(|latest| loaded.version > latest) {
                    model.push_version_numbered(loaded.spec.clone(), loaded.version);
                } else {
                    warn!(model = %name, version = loaded.version, "Ignoring unknown older model version reported by agent");
                    continue;
                }
            }

            let Some(mv) = model.version_mut(loaded.version) else {
                continue;
            };
            if !mv.server.is_empty() && mv.server != server_name {
                warn!(
                    model = %name,
                    version = loaded.version,
                    assigned = %mv.server,
                    "Agent reports model assigned to another server, ignoring"
                );
                continue;
            }
            mv.server = server_name.clone();
            mv.set_replica_state(idx, ReplicaState::Loaded, "");
            replica.loaded_models.insert(mv.id());

            model.refresh_status(loaded.version);
            self.publish_model(event_sources::MODEL_UPDATE, &name, loaded.version);
            self.persist(model);
        }

        let adopted = replica.loaded_models.len();
        server.replicas.insert(idx, replica);
        self.hub.publish_server_event(
            event_sources::SERVER_UPDATE,
            ServerEventMsg::new(&server_name, idx, ServerUpdateContext::ReplicaConnected),
        );

        info!(adopted, "Server replica connected");
        Ok(())
    }

    /// Removes a server replica and releases every model placed on it.
    ///
    /// The server itself is removed with its last replica. Returns the
    /// names of live models whose latest version lost a replica and needs
    /// rescheduling.
    #[instrument(skip(self))]
    pub async fn remove_server_replica(
        &self,
        server_name: &str,
        replica_idx: u32,
    ) -> StoreResult<Vec<String>> {
        let mut guard = self.state.write().await;
        let StoreState { models, servers } = &mut *guard;

        let server = servers
            .get_mut(server_name)
            .ok_or_else(|| StoreError::ServerNotFound(server_name.to_string()))?;
        let replica = server.replicas.remove(&replica_idx).ok_or_else(|| {
            StoreError::ReplicaNotFound(ServerReplicaId::new(server_name, replica_idx))
        })?;
        if server.replicas.is_empty() {
            servers.remove(server_name);
            info!("Last replica removed, server deleted");
        }

        let mut affected: BTreeSet<ModelVersionId> = replica.loaded_models;
        for model in models.values() {
            for mv in &model.versions {
                if mv.server == server_name && mv.replicas.contains_key(&replica_idx) {
                    affected.insert(mv.id());
                }
            }
        }

        let mut reschedule = BTreeSet::new();
        for id in affected {
            let Some(model) = models.get_mut(&id.name) else {
                continue;
            };
            let deleted = model.deleted;
            let is_latest = model.is_latest(id.version);
            let Some(mv) = model.version_mut(id.version) else {
                continue;
            };

            mv.replicas.remove(&replica_idx);
            if deleted || !is_latest {
                mv.set_replica_state(replica_idx, ReplicaState::Unloaded, "server replica removed");
            }
            model.refresh_status(id.version);
            self.publish_model(event_sources::MODEL_UPDATE, &id.name, id.version);

            if deleted {
                self.evict_if_terminated(models, &id.name);
            } else if is_latest {
                reschedule.insert(id.name);
            }
        }

        info!(reschedule = reschedule.len(), "Server replica removed");
        Ok(reschedule.into_iter().collect())
    }

    /// Stops new placements on a replica.
    ///
    /// Returns the live models hosted there, which should be rescheduled
    /// elsewhere.
    #[instrument(skip(self))]
    pub async fn drain_server_replica(
        &self,
        server_name: &str,
        replica_idx: u32,
    ) -> StoreResult<Vec<String>> {
        let mut guard = self.state.write().await;
        let StoreState { models, servers } = &mut *guard;

        let replica = servers
            .get_mut(server_name)
            .ok_or_else(|| StoreError::ServerNotFound(server_name.to_string()))?
            .replicas
            .get_mut(&replica_idx)
            .ok_or_else(|| {
                StoreError::ReplicaNotFound(ServerReplicaId::new(server_name, replica_idx))
            })?;
        replica.draining = true;

        let mut hosted: BTreeSet<String> = replica
            .loaded_models
            .iter()
            .map(|id| id.name.clone())
            .collect();
        for model in models.values() {
            if let Some(latest) = model.latest() {
                if latest.is_placed_on(server_name, replica_idx) {
                    hosted.insert(model.name.clone());
                }
            }
        }
        hosted.retain(|name| models.get(name).is_some_and(|m| !m.deleted));

        info!(hosted = hosted.len(), "Server replica draining");
        Ok(hosted.into_iter().collect())
    }

    /// Records scaling expectations for a server.
    ///
    /// `expected_replicas` of `0` marks the server as being deleted.
    #[instrument(skip(self))]
    pub async fn server_notify(
        &self,
        name: &str,
        shared: bool,
        expected_replicas: i32,
    ) -> StoreResult<()> {
        ServerName::parse(name)?;
        let mut state = self.state.write().await;
        let server = state
            .servers
            .entry(name.to_string())
            .or_insert_with(|| Server::new(name, shared));
        server.shared = shared;
        server.expected_replicas = expected_replicas;

        info!("Server expectations updated");
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Reloads the model catalog from persistence.
    ///
    /// Placements are not restored; agents re-report what they have loaded
    /// when they reconnect. Deleted models hold nothing once placements are
    /// cleared, so they are dropped here and from persistence. Returns the
    /// number of models restored.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> StoreResult<usize> {
        let mut records = Vec::new();
        self.persistence
            .restore_models(&mut |model| records.push(model))?;

        let mut state = self.state.write().await;
        let mut restored = 0;
        for mut model in records {
            if let Err(e) = ModelName::parse(&model.name) {
                warn!(model = %model.name, error = %e, "Skipping persisted model with invalid name");
                continue;
            }
            if model.versions.is_empty() {
                warn!(model = %model.name, "Skipping persisted model without versions");
                continue;
            }
            if model.deleted {
                info!(model = %model.name, "Dropping persisted model marked deleted");
                if let Err(e) = self.persistence.delete_model(&model.name) {
                    warn!(model = %model.name, error = %e, "Failed to delete persisted model");
                }
                continue;
            }
            for mv in &mut model.versions {
                mv.replicas.clear();
                mv.server.clear();
            }
            model.refresh_all_statuses();
            state.models.insert(model.name.clone(), model);
            restored += 1;
        }

        info!(restored, "Restored models from persistence");
        Ok(restored)
    }

    fn persist(&self, model: &Model) {
        if let Err(e) = self.persistence.save_model(model) {
            warn!(model = %model.name, error = %e, "Failed to persist model");
        }
    }

    /// Drops a deleted model once none of its versions hold resources.
    fn evict_if_terminated(&self, models: &mut BTreeMap<String, Model>, name: &str) {
        let terminated = models
            .get(name)
            .is_some_and(|m| m.deleted && m.is_inactive());
        if !terminated {
            return;
        }
        models.remove(name);
        if let Err(e) = self.persistence.delete_model(name) {
            warn!(error = %e, "Failed to delete persisted model");
        }
        info!(model = name, "Deleted model fully terminated, removed from store");
    }

    fn publish_model(&self, source: &str, name: &str, version: u32) {
        self.hub
            .publish_model_event(source, ModelEventMsg::new(name, version));
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn model_mut<'a>(models: &'a mut BTreeMap<String, Model>, name: &str) -> StoreResult<&'a mut Model> {
    models
        .get_mut(name)
        .ok_or_else(|| StoreError::ModelNotFound(name.to_string()))
}

fn version_mut(model: &mut Model, version: u32) -> StoreResult<&mut ModelVersion> {
    let name = model.name.clone();
    model
        .version_mut(version)
        .ok_or_else(|| StoreError::VersionNotFound(ModelVersionId::new(name, version)))
}

fn is_pending_load(state: ReplicaState) -> bool {
    matches!(state, ReplicaState::LoadRequested | ReplicaState::Loading)
}

/// Moves one replica of `mv` to `state`, keeping the host's memory
/// reservation in step with in-flight loads.
fn transition(
    mv: &mut ModelVersion,
    host: Option<&mut ServerReplica>,
    idx: u32,
    state: ReplicaState,
    reason: &str,
) {
    let was_pending = is_pending_load(mv.replica_state(idx));
    let now_pending = is_pending_load(state);
    if let Some(host) = host {
        if now_pending && !was_pending {
            host.reserve(mv.spec.memory_bytes);
        } else if was_pending && !now_pending {
            host.release(mv.spec.memory_bytes);
        }
    }
    mv.set_replica_state(idx, state, reason);
}

fn request_unload(servers: &mut BTreeMap<String, Server>, mv: &mut ModelVersion) -> bool {
    let host_name = mv.server.clone();
    let pending = mv.replicas_to_unload();
    for &idx in &pending {
        let host = servers
            .get_mut(&host_name)
            .and_then(|s| s.replicas.get_mut(&idx));
        transition(mv, host, idx, ReplicaState::UnloadRequested, "");
    }
    !pending.is_empty()
}

fn snapshot_server(server: &Server, models: &BTreeMap<String, Model>) -> ServerSnapshot {
    let num_empty_replicas = server.replicas.values().filter(|r| r.is_empty()).count() as u32;
    let max_num_replica_hosted_models = models
        .values()
        .filter(|m| !m.deleted)
        .filter_map(|m| m.latest())
        .filter(|v| v.server == server.name)
        .map(|v| v.desired_replicas())
        .max()
        .unwrap_or(0);

    ServerSnapshot {
        name: server.name.clone(),
        replicas: server.replicas.values().cloned().collect(),
        shared: server.shared,
        expected_replicas: server.expected_replicas,
        stats: ServerStats {
            num_empty_replicas,
            max_num_replica_hosted_models,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlsched_events::Topic;
    use parking_lot::Mutex;

    fn new_store() -> MemoryStore {
        MemoryStore::new(Arc::new(EventHub::new()))
    }

    async fn add_replica(store: &MemoryStore, server: &str, idx: u32, memory: u64) {
        store
            .add_server_replica(
                ServerReplicaConfig::new(server, idx, memory).with_capabilities(&["sklearn"]),
            )
            .await
            .unwrap();
    }

    async fn report(store: &MemoryStore, model: &str, version: u32, server: &str, idx: u32, state: ReplicaState) {
        store
            .update_model_state(model, version, server, idx, None, state, "")
            .await
            .unwrap();
    }

    fn state_of(model: &ModelSnapshot, version: u32) -> ModelState {
        model.version(version).map(|v| v.status.state).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_update_model_versions() {
        let store = new_store();
        let spec = ModelSpec::new("iris", 1, 100).with_requirements(&["sklearn"]);

        assert_eq!(store.update_model(spec.clone()).await.unwrap(), 1);
        assert_eq!(store.update_model(spec.clone()).await.unwrap(), 1);
        assert_eq!(
            store
                .update_model(spec.clone().with_requirements(&[" sklearn", "sklearn"]))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.update_model(ModelSpec::new("iris", 2, 100)).await.unwrap(),
            2
        );

        let model = store.get_model("iris").await.unwrap();
        assert_eq!(model.versions.len(), 2);
        assert_eq!(model.latest_version(), Some(2));
        assert_eq!(store.get_model_names().await.unwrap(), vec!["iris"]);
    }

    #[tokio::test]
    async fn test_update_model_rejects_invalid_names() {
        let store = new_store();
        let err = store.update_model(ModelSpec::new("bad name", 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));

        let err = store
            .update_model(ModelSpec::new("iris", 1, 1).with_server("bad/server"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_get_missing_model() {
        let store = new_store();
        let err = store.get_model("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::ModelNotFound(_)));
        assert!(err.is_not_found());
        assert!(store.remove_model("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_commit_requests_loads_and_reserves_memory() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        add_replica(&store, "mlserver", 1, 1000).await;
        store.update_model(ModelSpec::new("iris", 2, 100)).await.unwrap();

        store
            .update_loaded_models("iris", 1, "mlserver", &[0, 1])
            .await
            .unwrap();

        let model = store.get_model("iris").await.unwrap();
        let latest = model.latest().unwrap();
        assert_eq!(latest.server, "mlserver");
        assert_eq!(latest.replica_state(0), ReplicaState::LoadRequested);
        assert_eq!(latest.replica_state(1), ReplicaState::LoadRequested);
        assert_eq!(latest.status.state, ModelState::Progressing);

        let server = store.get_server("mlserver").await.unwrap();
        assert_eq!(server.replica(0).unwrap().reserved_memory_bytes, 100);

        // Same commit again changes nothing.
        store
            .update_loaded_models("iris", 1, "mlserver", &[0, 1])
            .await
            .unwrap();
        let server = store.get_server("mlserver").await.unwrap();
        assert_eq!(server.replica(0).unwrap().reserved_memory_bytes, 100);
    }

    #[tokio::test]
    async fn test_commit_validation() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_model(ModelSpec::new("iris", 1, 200)).await.unwrap();

        let err = store
            .update_loaded_models("iris", 1, "mlserver", &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store
            .update_loaded_models("iris", 2, "mlserver", &[3])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReplicaNotFound(_)));

        let err = store
            .update_loaded_models("iris", 2, "triton", &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ServerNotFound(_)));

        // Empty server and target only refreshes status.
        store.update_loaded_models("iris", 2, "", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_unloads_indices_outside_target() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        add_replica(&store, "mlserver", 1, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();
        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Available).await;

        store.update_loaded_models("iris", 1, "mlserver", &[1]).await.unwrap();

        let model = store.get_model("iris").await.unwrap();
        let latest = model.latest().unwrap();
        assert_eq!(latest.replica_state(0), ReplicaState::UnloadRequested);
        assert_eq!(latest.replica_state(1), ReplicaState::LoadRequested);
    }

    #[tokio::test]
    async fn test_commit_to_another_server_creates_version() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        add_replica(&store, "triton", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();

        store.update_loaded_models("iris", 1, "triton", &[0]).await.unwrap();

        let model = store.get_model("iris").await.unwrap();
        assert_eq!(model.latest_version(), Some(2));
        assert_eq!(model.version(1).unwrap().server, "mlserver");
        assert_eq!(model.version(2).unwrap().server, "triton");
        assert_eq!(
            model.version(2).unwrap().replica_state(0),
            ReplicaState::LoadRequested
        );
    }

    #[tokio::test]
    async fn test_replica_lifecycle_reaches_available() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();

        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Loading).await;
        store
            .update_model_state("iris", 1, "mlserver", 0, Some(700), ReplicaState::Loaded, "")
            .await
            .unwrap();

        let server = store.get_server("mlserver").await.unwrap();
        let replica = server.replica(0).unwrap();
        assert_eq!(replica.reserved_memory_bytes, 0);
        assert_eq!(replica.available_memory_bytes, 700);
        assert!(replica
            .loaded_models
            .contains(&ModelVersionId::new("iris", 1)));

        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Available).await;
        let model = store.get_model("iris").await.unwrap();
        assert_eq!(state_of(&model, 1), ModelState::Available);
        assert_eq!(model.latest().unwrap().status.available_replicas, 1);
    }

    #[tokio::test]
    async fn test_load_failure_releases_reservation() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();

        store
            .update_model_state("iris", 1, "mlserver", 0, None, ReplicaState::LoadFailed, "oom")
            .await
            .unwrap();

        let server = store.get_server("mlserver").await.unwrap();
        assert_eq!(server.replica(0).unwrap().reserved_memory_bytes, 0);
        let model = store.get_model("iris").await.unwrap();
        assert_eq!(state_of(&model, 1), ModelState::Failed);
        assert_eq!(model.latest().unwrap().status.reason, "oom");
    }

    #[tokio::test]
    async fn test_unload_emits_scale_down_and_evicts_deleted_model() {
        let hub = Arc::new(EventHub::new());
        let store = MemoryStore::new(hub.clone());
        let contexts = Arc::new(Mutex::new(Vec::new()));
        {
            let contexts = contexts.clone();
            hub.register_server_handler("test", 100, move |evt| {
                contexts.lock().push(evt.payload.update_context);
            })
            .unwrap();
        }

        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();
        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Available).await;

        store.remove_model("iris").await.unwrap();
        let model = store.get_model("iris").await.unwrap();
        assert!(model.deleted);
        assert_eq!(state_of(&model, 1), ModelState::Terminating);

        assert!(store.unload_version_models("iris", 1).await.unwrap());
        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Unloaded).await;
        assert!(matches!(
            store.get_model("iris").await,
            Err(StoreError::ModelNotFound(_))
        ));

        hub.close();
        hub.wait_for_handlers().await;
        assert_eq!(
            *contexts.lock(),
            vec![
                ServerUpdateContext::ReplicaConnected,
                ServerUpdateContext::ScaleDown
            ]
        );
    }

    #[tokio::test]
    async fn test_update_deleted_model() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();
        store.remove_model("iris").await.unwrap();

        let err = store
            .update_model(ModelSpec::new("iris", 1, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let other = new_store();
        other.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        other.remove_model("iris").await.unwrap();
        assert_eq!(
            other.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap(),
            2
        );
        assert!(!other.get_model("iris").await.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_remove_server_replica_cascades() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        add_replica(&store, "mlserver", 1, 1000).await;
        store.update_model(ModelSpec::new("iris", 2, 100)).await.unwrap();
        store.update_model(ModelSpec::new("wine", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0, 1]).await.unwrap();
        store.update_loaded_models("wine", 1, "mlserver", &[0]).await.unwrap();
        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Available).await;
        store.remove_model("wine").await.unwrap();

        let reschedule = store.remove_server_replica("mlserver", 0).await.unwrap();
        assert_eq!(reschedule, vec!["iris"]);

        let server = store.get_server("mlserver").await.unwrap();
        assert_eq!(server.replicas.len(), 1);
        assert_eq!(server.replicas[0].idx, 1);

        let iris = store.get_model("iris").await.unwrap();
        let latest = iris.latest().unwrap();
        assert!(!latest.replicas.contains_key(&0));
        assert_eq!(latest.replica_state(1), ReplicaState::LoadRequested);

        // Deleted model lost its only replica and is gone.
        assert!(matches!(
            store.get_model("wine").await,
            Err(StoreError::ModelNotFound(_))
        ));

        store.remove_server_replica("mlserver", 1).await.unwrap();
        assert!(matches!(
            store.get_server("mlserver").await,
            Err(StoreError::ServerNotFound(_))
        ));
        assert!(store.get_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_server_replica() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();

        let hosted = store.drain_server_replica("mlserver", 0).await.unwrap();
        assert_eq!(hosted, vec!["iris"]);
        let server = store.get_server("mlserver").await.unwrap();
        assert!(server.replica(0).unwrap().draining);

        assert!(store.drain_server_replica("mlserver", 9).await.is_err());
    }

    #[tokio::test]
    async fn test_server_notify_and_stats() {
        let store = new_store();
        store.server_notify("mlserver", false, 0).await.unwrap();
        let server = store.get_server("mlserver").await.unwrap();
        assert!(server.is_deleting());
        assert!(!server.shared);
        assert!(server.replicas.is_empty());

        add_replica(&store, "mlserver", 0, 1000).await;
        add_replica(&store, "mlserver", 1, 1000).await;
        store.update_model(ModelSpec::new("iris", 3, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();

        let server = store.get_server("mlserver").await.unwrap();
        assert_eq!(server.stats.num_empty_replicas, 1);
        assert_eq!(server.stats.max_num_replica_hosted_models, 3);
    }

    #[tokio::test]
    async fn test_add_replica_adopts_loaded_models() {
        let store = new_store();
        store
            .add_server_replica(
                ServerReplicaConfig::new("mlserver", 0, 1000)
                    .with_loaded_model(ModelSpec::new("iris", 1, 100), 3),
            )
            .await
            .unwrap();

        let model = store.get_model("iris").await.unwrap();
        assert_eq!(model.latest_version(), Some(3));
        let latest = model.latest().unwrap();
        assert_eq!(latest.server, "mlserver");
        assert_eq!(latest.replica_state(0), ReplicaState::Loaded);

        let server = store.get_server("mlserver").await.unwrap();
        assert!(server
            .replica(0)
            .unwrap()
            .loaded_models
            .contains(&ModelVersionId::new("iris", 3)));
    }

    #[tokio::test]
    async fn test_failed_scheduling() {
        let hub = Arc::new(EventHub::new());
        let store = MemoryStore::new(hub.clone());
        let sources = Arc::new(Mutex::new(Vec::new()));
        {
            let sources = sources.clone();
            hub.register_model_handler("test", 100, move |evt| {
                sources.lock().push(evt.source);
            })
            .unwrap();
        }

        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 2, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();
        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Available).await;

        store
            .failed_scheduling("iris", 1, "no capacity", false)
            .await
            .unwrap();
        let model = store.get_model("iris").await.unwrap();
        let latest = model.latest().unwrap();
        assert_eq!(latest.status.state, ModelState::ScheduleFailed);
        assert_eq!(latest.status.available_replicas, 1);
        assert_eq!(latest.status.unavailable_replicas, 1);
        assert_eq!(latest.server, "mlserver");

        store.failed_scheduling("iris", 1, "no capacity", true).await.unwrap();
        assert!(store.get_model("iris").await.unwrap().latest().unwrap().server.is_empty());

        hub.close();
        hub.wait_for_handlers().await;
        assert_eq!(
            sources.lock().last().map(String::as_str),
            Some(event_sources::MODEL_SCHEDULING_FAILED)
        );
        assert!(hub.handler_names(Topic::Model).is_empty());
    }

    #[tokio::test]
    async fn test_failed_scheduling_rejects_superseded_version() {
        let store = new_store();
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_model(ModelSpec::new("iris", 1, 200)).await.unwrap();

        let err = store
            .failed_scheduling("iris", 1, "no capacity", true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = store
            .failed_scheduling("iris", 7, "no capacity", true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionNotFound(_)));

        let model = store.get_model("iris").await.unwrap();
        assert_ne!(state_of(&model, 1), ModelState::ScheduleFailed);
        assert_ne!(state_of(&model, 2), ModelState::ScheduleFailed);
    }

    #[tokio::test]
    async fn test_reclaim_superseded_versions() {
        let store = new_store();
        add_replica(&store, "mlserver", 0, 1000).await;
        add_replica(&store, "mlserver", 1, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();
        report(&store, "iris", 1, "mlserver", 0, ReplicaState::Available).await;

        store.update_model(ModelSpec::new("iris", 1, 200)).await.unwrap();
        store.update_loaded_models("iris", 2, "mlserver", &[1]).await.unwrap();

        // Successor not available yet: nothing to reclaim.
        assert!(store.reclaim_superseded_versions().await.unwrap().is_empty());

        report(&store, "iris", 2, "mlserver", 1, ReplicaState::Available).await;
        let reclaimed = store.reclaim_superseded_versions().await.unwrap();
        assert_eq!(reclaimed, vec![ModelVersionId::new("iris", 1)]);

        let model = store.get_model("iris").await.unwrap();
        assert_eq!(
            model.version(1).unwrap().replica_state(0),
            ReplicaState::UnloadRequested
        );
        assert_eq!(state_of(&model, 1), ModelState::Terminating);
        assert!(store.reclaim_superseded_versions().await.unwrap().is_empty());
    }

    struct RecordingPersistence {
        saved: Mutex<BTreeMap<String, ModelSnapshot>>,
    }

    impl Persistence for RecordingPersistence {
        fn save_model(&self, model: &ModelSnapshot) -> StoreResult<()> {
            self.saved.lock().insert(model.name.clone(), model.clone());
            Ok(())
        }

        fn delete_model(&self, name: &str) -> StoreResult<()> {
            self.saved.lock().remove(name);
            Ok(())
        }

        fn restore_models(&self, callback: &mut dyn FnMut(ModelSnapshot)) -> StoreResult<()> {
            for model in self.saved.lock().values() {
                callback(model.clone());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_restore_from_persistence() {
        let persistence = Arc::new(RecordingPersistence {
            saved: Mutex::new(BTreeMap::new()),
        });
        let store = MemoryStore::with_persistence(Arc::new(EventHub::new()), persistence.clone());
        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_model(ModelSpec::new("iris", 2, 100)).await.unwrap();
        store.update_loaded_models("iris", 2, "mlserver", &[0]).await.unwrap();
        assert_eq!(persistence.saved.lock().len(), 1);

        let restored = MemoryStore::with_persistence(Arc::new(EventHub::new()), persistence);
        assert_eq!(restored.restore().await.unwrap(), 1);

        let model = restored.get_model("iris").await.unwrap();
        assert_eq!(model.latest_version(), Some(2));
        let latest = model.latest().unwrap();
        assert!(latest.replicas.is_empty());
        assert!(latest.server.is_empty());
        assert_eq!(latest.status.state, ModelState::Progressing);
    }

    #[tokio::test]
    async fn test_restore_drops_deleted_models() {
        let persistence = Arc::new(RecordingPersistence {
            saved: Mutex::new(BTreeMap::new()),
        });
        let store = MemoryStore::with_persistence(Arc::new(EventHub::new()), persistence.clone());
        add_replica(&store, "mlserver", 0, 1000).await;
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.update_model(ModelSpec::new("wine", 1, 100)).await.unwrap();
        store.update_loaded_models("iris", 1, "mlserver", &[0]).await.unwrap();
        // Still loading, so the deleted model stays until restart.
        store.remove_model("iris").await.unwrap();
        assert!(persistence.saved.lock()["iris"].deleted);

        let restored = MemoryStore::with_persistence(Arc::new(EventHub::new()), persistence.clone());
        assert_eq!(restored.restore().await.unwrap(), 1);

        assert!(matches!(
            restored.get_model("iris").await,
            Err(StoreError::ModelNotFound(_))
        ));
        assert!(restored.get_model("wine").await.is_ok());
        assert_eq!(
            persistence.saved.lock().keys().cloned().collect::<Vec<_>>(),
            vec!["wine"]
        );
    }

    struct UnavailablePersistence;

    impl Persistence for UnavailablePersistence {
        fn save_model(&self, _model: &ModelSnapshot) -> StoreResult<()> {
            Err(StoreError::Persistence("disk full".to_string()))
        }

        fn delete_model(&self, _name: &str) -> StoreResult<()> {
            Err(StoreError::Persistence("disk full".to_string()))
        }

        fn restore_models(&self, _callback: &mut dyn FnMut(ModelSnapshot)) -> StoreResult<()> {
            Err(StoreError::Persistence("backend unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_persistence_failures_never_fail_mutations() {
        let store =
            MemoryStore::with_persistence(Arc::new(EventHub::new()), Arc::new(UnavailablePersistence));
        store.update_model(ModelSpec::new("iris", 1, 100)).await.unwrap();
        store.remove_model("iris").await.unwrap();
        // Never placed, so the first teardown commit evicts it.
        store.update_loaded_models("iris", 1, "", &[]).await.unwrap();
        assert!(store.get_model("iris").await.is_err());

        let err = store.restore().await.unwrap_err();
        assert!(matches!(err, StoreError::Persistence(_)));
    }
}
