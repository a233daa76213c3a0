//! Server fleet types.

use std::collections::{BTreeMap, BTreeSet};

use mlsched_id::{ModelVersionId, ServerReplicaId};
use mlsched_placement::trim_tags;
use serde::{Deserialize, Serialize};

use super::model::ModelSpec;

/// `expected_replicas` value for a server with no scaling constraint.
pub const UNCONSTRAINED_REPLICAS: i32 = -1;

/// One numbered replica of an inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReplica {
    pub server_name: String,
    pub idx: u32,
    pub total_memory_bytes: u64,
    /// Last value reported by the replica's agent.
    pub available_memory_bytes: u64,
    /// Held for in-flight load requests.
    pub reserved_memory_bytes: u64,
    /// Trimmed on ingest.
    pub capabilities: Vec<String>,
    /// Versions loading or loaded here.
    pub loaded_models: BTreeSet<ModelVersionId>,
    pub draining: bool,
}

impl ServerReplica {
    pub fn id(&self) -> ServerReplicaId {
        ServerReplicaId::new(self.server_name.clone(), self.idx)
    }

    /// Memory a new load could use right now.
    pub fn free_memory_bytes(&self) -> u64 {
        self.available_memory_bytes
            .saturating_sub(self.reserved_memory_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.loaded_models.is_empty() && self.reserved_memory_bytes == 0
    }

    pub(crate) fn reserve(&mut self, bytes: u64) {
        self.reserved_memory_bytes = self.reserved_memory_bytes.saturating_add(bytes);
    }

    pub(crate) fn release(&mut self, bytes: u64) {
        self.reserved_memory_bytes = self.reserved_memory_bytes.saturating_sub(bytes);
    }
}

/// Internal server record.
#[derive(Debug, Clone)]
pub(crate) struct Server {
    pub name: String,
    pub replicas: BTreeMap<u32, ServerReplica>,
    pub shared: bool,
    pub expected_replicas: i32,
}

impl Server {
    pub fn new(name: impl Into<String>, shared: bool) -> Self {
        Self {
            name: name.into(),
            replicas: BTreeMap::new(),
            shared,
            expected_replicas: UNCONSTRAINED_REPLICAS,
        }
    }
}

/// Derived occupancy figures for a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Replicas hosting nothing and holding no reservations.
    pub num_empty_replicas: u32,
    /// Largest desired replica count among models assigned to the server.
    pub max_num_replica_hosted_models: u32,
}

/// Deep copy of a server handed out by store reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub name: String,
    /// Ascending by replica index.
    pub replicas: Vec<ServerReplica>,
    pub shared: bool,
    /// `-1` unconstrained, `0` being deleted.
    pub expected_replicas: i32,
    pub stats: ServerStats,
}

impl ServerSnapshot {
    pub fn replica(&self, idx: u32) -> Option<&ServerReplica> {
        self.replicas.iter().find(|r| r.idx == idx)
    }

    /// Lowest-index replica, taken as representative of the whole server.
    pub fn first_replica(&self) -> Option<&ServerReplica> {
        self.replicas.first()
    }

    pub fn is_deleting(&self) -> bool {
        self.expected_replicas == 0
    }
}

/// A model version an agent reports as already loaded on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub spec: ModelSpec,
    pub version: u32,
}

/// Registration payload sent when a server replica connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReplicaConfig {
    pub server_name: String,
    pub replica_idx: u32,
    #[serde(default)]
    pub shared: bool,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub loaded_models: Vec<LoadedModel>,
}

impl ServerReplicaConfig {
    pub fn new(server_name: impl Into<String>, replica_idx: u32, memory_bytes: u64) -> Self {
        Self {
            server_name: server_name.into(),
            replica_idx,
            shared: true,
            total_memory_bytes: memory_bytes,
            available_memory_bytes: memory_bytes,
            capabilities: Vec::new(),
            loaded_models: Vec::new(),
        }
    }

    pub fn with_capabilities<S: AsRef<str>>(mut self, capabilities: &[S]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_loaded_model(mut self, spec: ModelSpec, version: u32) -> Self {
        self.loaded_models.push(LoadedModel { spec, version });
        self
    }

    pub(crate) fn to_replica(&self) -> ServerReplica {
        ServerReplica {
            server_name: self.server_name.clone(),
            idx: self.replica_idx,
            total_memory_bytes: self.total_memory_bytes,
            available_memory_bytes: self.available_memory_bytes,
            reserved_memory_bytes: 0,
            capabilities: trim_tags(&self.capabilities),
            loaded_models: BTreeSet::new(),
            draining: false,
        }
    }
}
