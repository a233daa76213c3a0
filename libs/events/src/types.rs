//! Event payload definitions for all hub topics.
//!
//! Payloads are deliberately thin: they name the entity that changed and
//! subscribers fetch current state from the store. This keeps events cheap
//! to clone across consumers and avoids stale copies of large state.

use mlsched_id::ModelVersionId;
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Source Constants
// =============================================================================

/// Well-known event source names.
pub mod event_sources {
    // Store
    pub const MODEL_UPDATE: &str = "store.model.update";
    pub const MODEL_SCHEDULING_FAILED: &str = "store.model.scheduling_failed";
    pub const SERVER_UPDATE: &str = "store.server.update";

    // Scheduler
    pub const SERVER_SCALE_UP: &str = "scheduler.server.scale_up";
}

// =============================================================================
// Model Events
// =============================================================================

/// A model version's aggregate status or assignment changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEventMsg {
    pub model_name: String,
    pub model_version: u32,
}

impl ModelEventMsg {
    pub fn new(model_name: impl Into<String>, model_version: u32) -> Self {
        Self {
            model_name: model_name.into(),
            model_version,
        }
    }

    /// Returns the key of the model version this event refers to.
    pub fn model_version_id(&self) -> ModelVersionId {
        ModelVersionId::new(self.model_name.clone(), self.model_version)
    }
}

// =============================================================================
// Server Events
// =============================================================================

/// Why a server event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerUpdateContext {
    #[default]
    Unspecified,
    /// A replica checked in (new or reconnecting).
    ReplicaConnected,
    /// Placement failed; the server may need more replicas.
    ScaleUp,
    /// A model left a replica; the server may be able to shrink.
    ScaleDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEventMsg {
    pub server_name: String,
    pub server_idx: u32,
    pub update_context: ServerUpdateContext,
}

impl ServerEventMsg {
    pub fn new(
        server_name: impl Into<String>,
        server_idx: u32,
        update_context: ServerUpdateContext,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            server_idx,
            update_context,
        }
    }
}

// =============================================================================
// Pipeline and Experiment Events
// =============================================================================

/// Emitted by the pipeline registrant when a pipeline version changes state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEventMsg {
    pub pipeline_name: String,
    pub pipeline_version: u32,
    pub uid: String,
    /// Set when the change was triggered by an experiment update.
    pub experiment_update: bool,
}

/// Emitted when the dataflow streams backing a pipeline change readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStreamsEventMsg {
    pub pipeline_name: String,
    pub pipeline_version: u32,
    pub ready: bool,
}

/// Emitted by the experiment registrant when an experiment changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentEventMsg {
    pub experiment_name: String,
    /// Models whose routing is affected by the change.
    pub updated_models: Vec<String>,
}
