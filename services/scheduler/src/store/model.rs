//! Model catalog types.
//!
//! A [`Model`] is an append-only list of [`ModelVersion`]s. Each version
//! tracks the lifecycle of every replica it was assigned, keyed by the
//! replica index on its assigned server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mlsched_id::ModelVersionId;
use mlsched_placement::normalize_tags;
use serde::{Deserialize, Serialize};

use super::status::compute_status;

// =============================================================================
// Spec
// =============================================================================

/// Immutable load request for one version of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Desired number of replicas.
    pub replicas: u32,
    pub memory_bytes: u64,
    /// Capability tags every hosting replica must advertise.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Pins the model to a named server.
    #[serde(default)]
    pub server: Option<String>,
    /// Explainer models need an explainer-capable runtime.
    #[serde(default)]
    pub explainer: bool,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, replicas: u32, memory_bytes: u64) -> Self {
        Self {
            name: name.into(),
            replicas,
            memory_bytes,
            requirements: Vec::new(),
            server: None,
            explainer: false,
        }
    }

    pub fn with_requirements<S: AsRef<str>>(mut self, requirements: &[S]) -> Self {
        self.requirements = requirements.iter().map(|r| r.as_ref().to_string()).collect();
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_explainer(mut self, explainer: bool) -> Self {
        self.explainer = explainer;
        self
    }

    /// Returns true if a change from `self` to `other` needs a new version.
    ///
    /// Requirements are compared after trimming, sorting and deduplication.
    pub fn materially_differs(&self, other: &ModelSpec) -> bool {
        self.memory_bytes != other.memory_bytes
            || self.replicas != other.replicas
            || self.server != other.server
            || self.explainer != other.explainer
            || normalize_tags(&self.requirements) != normalize_tags(&other.requirements)
    }
}

// =============================================================================
// Replica lifecycle
// =============================================================================

/// Lifecycle state of one model replica on one server replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    #[default]
    Unknown,
    LoadRequested,
    Loading,
    Loaded,
    Available,
    LoadFailed,
    UnloadRequested,
    Unloading,
    Unloaded,
    UnloadFailed,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::LoadRequested => "load_requested",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Available => "available",
            Self::LoadFailed => "load_failed",
            Self::UnloadRequested => "unload_requested",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
            Self::UnloadFailed => "unload_failed",
        }
    }

    /// Requested, in progress, or done loading.
    ///
    /// Also the "no reload needed" check: a replica already in one of these
    /// states is left alone when the same placement is committed again.
    pub fn is_loading_or_loaded(&self) -> bool {
        matches!(
            self,
            Self::LoadRequested | Self::Loading | Self::Loaded | Self::Available
        )
    }

    pub fn is_unloading_or_unloaded(&self) -> bool {
        matches!(
            self,
            Self::Unknown | Self::UnloadRequested | Self::Unloading | Self::Unloaded
        )
    }

    /// Holds no resources on the server replica.
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            Self::Unknown | Self::Unloaded | Self::UnloadFailed | Self::LoadFailed
        )
    }

    /// Can serve traffic.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Loaded | Self::Available)
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl ReplicaStatus {
    pub fn new(state: ReplicaState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Aggregate status
// =============================================================================

/// Aggregate state of a model version, derived from its replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Unknown,
    Progressing,
    Available,
    Failed,
    Terminating,
    Terminated,
    TerminateFailed,
    ScheduleFailed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Progressing => "progressing",
            Self::Available => "available",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::TerminateFailed => "terminate_failed",
            Self::ScheduleFailed => "schedule_failed",
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub available_replicas: u32,
    pub unavailable_replicas: u32,
}

impl Default for ModelStatus {
    fn default() -> Self {
        Self {
            state: ModelState::Unknown,
            reason: String::new(),
            timestamp: Utc::now(),
            available_replicas: 0,
            unavailable_replicas: 0,
        }
    }
}

// =============================================================================
// Versions
// =============================================================================

/// One version of a model and its placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: u32,
    pub spec: ModelSpec,
    /// Replica index on `server` to that replica's lifecycle.
    pub replicas: BTreeMap<u32, ReplicaStatus>,
    /// Assigned server name, empty when unassigned.
    pub server: String,
    pub status: ModelStatus,
}

impl ModelVersion {
    pub fn new(version: u32, spec: ModelSpec) -> Self {
        Self {
            version,
            spec,
            replicas: BTreeMap::new(),
            server: String::new(),
            status: ModelStatus::default(),
        }
    }

    pub fn id(&self) -> ModelVersionId {
        ModelVersionId::new(self.spec.name.clone(), self.version)
    }

    pub fn desired_replicas(&self) -> u32 {
        self.spec.replicas
    }

    /// State of a replica index; untracked indices are `Unknown`.
    pub fn replica_state(&self, idx: u32) -> ReplicaState {
        self.replicas
            .get(&idx)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    /// Returns true if this version is loading or loaded on `server:idx`.
    pub fn is_placed_on(&self, server: &str, idx: u32) -> bool {
        !self.server.is_empty()
            && self.server == server
            && self.replica_state(idx).is_loading_or_loaded()
    }

    pub fn count_replicas(&self, pred: impl Fn(ReplicaState) -> bool) -> u32 {
        self.replicas.values().filter(|r| pred(r.state)).count() as u32
    }

    pub fn live_replicas(&self) -> u32 {
        self.count_replicas(|s| s.is_live())
    }

    pub fn has_live_replicas(&self) -> bool {
        self.live_replicas() > 0
    }

    /// Replicas requested or loading but not yet live.
    pub fn has_loading_replicas(&self) -> bool {
        self.count_replicas(|s| matches!(s, ReplicaState::LoadRequested | ReplicaState::Loading)) > 0
    }

    /// Indices currently requested, loading or loaded.
    pub fn assigned_replicas(&self) -> Vec<u32> {
        self.replicas
            .iter()
            .filter(|(_, r)| r.state.is_loading_or_loaded())
            .map(|(idx, _)| *idx)
            .collect()
    }

    /// Every replica holds no resources.
    pub fn is_inactive(&self) -> bool {
        self.replicas.values().all(|r| r.state.is_inactive())
    }

    pub(crate) fn set_replica_state(&mut self, idx: u32, state: ReplicaState, reason: &str) {
        self.replicas.insert(idx, ReplicaStatus::new(state, reason));
    }

    /// Indices of replicas not already unloading or unloaded.
    pub fn replicas_to_unload(&self) -> Vec<u32> {
        self.replicas
            .iter()
            .filter(|(_, r)| !r.state.is_unloading_or_unloaded())
            .map(|(idx, _)| *idx)
            .collect()
    }
}

// =============================================================================
// Models
// =============================================================================

/// A named model and its version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    /// Ascending by version number.
    pub versions: Vec<ModelVersion>,
    pub deleted: bool,
}

/// Deep copy of a [`Model`] handed out by store reads.
pub type ModelSnapshot = Model;

impl Model {
    pub(crate) fn new(spec: ModelSpec, version: u32) -> Self {
        let mut model = Self {
            name: spec.name.clone(),
            versions: vec![ModelVersion::new(version, spec)],
            deleted: false,
        };
        model.refresh_status(version);
        model
    }

    pub fn latest(&self) -> Option<&ModelVersion> {
        self.versions.last()
    }

    pub fn latest_version(&self) -> Option<u32> {
        self.latest().map(|v| v.version)
    }

    pub fn version(&self, version: u32) -> Option<&ModelVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub(crate) fn version_mut(&mut self, version: u32) -> Option<&mut ModelVersion> {
        self.versions.iter_mut().find(|v| v.version == version)
    }

    pub fn is_latest(&self, version: u32) -> bool {
        self.latest_version() == Some(version)
    }

    /// Highest version whose aggregate state is `Available`.
    pub fn last_available_version(&self) -> Option<u32> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.status.state == ModelState::Available)
            .map(|v| v.version)
    }

    /// Every version holds no resources.
    pub fn is_inactive(&self) -> bool {
        self.versions.iter().all(|v| v.is_inactive())
    }

    /// Appends `spec` as the next version and returns its number.
    ///
    /// The previous version keeps its status until its own replicas change,
    /// which lets a rolling update inherit its availability.
    pub(crate) fn push_version(&mut self, spec: ModelSpec) -> u32 {
        let next = self.latest_version().map_or(1, |v| v + 1);
        self.push_version_numbered(spec, next);
        next
    }

    /// Appends a version with an explicit number, which must exceed the
    /// current latest.
    pub(crate) fn push_version_numbered(&mut self, spec: ModelSpec, version: u32) {
        self.versions.push(ModelVersion::new(version, spec));
        self.refresh_status(version);
    }

    /// Recomputes the aggregate status of one version from its replicas.
    pub(crate) fn refresh_status(&mut self, version: u32) {
        let deleted = self.deleted;
        let is_latest = self.is_latest(version);
        let last_available = self.last_available_version();
        if let Some(mv) = self.version_mut(version) {
            mv.status = compute_status(mv, deleted, is_latest, last_available);
        }
    }

    pub(crate) fn refresh_all_statuses(&mut self) {
        let versions: Vec<u32> = self.versions.iter().map(|v| v.version).collect();
        for version in versions {
            self.refresh_status(version);
        }
    }
}
