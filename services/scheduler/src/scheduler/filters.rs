//! Default placement filters.
//!
//! Server filters decide whether a server as a whole can host a model
//! version; replica filters decide per server replica.

use mlsched_placement::{capabilities_satisfied, Filter, FilterChain};

use crate::store::{ModelVersion, ServerReplica, ServerSnapshot};

/// Capability an explainer model needs on its hosting replica.
pub const EXPLAINER_CAPABILITY: &str = "alibi-explain";

pub type ServerFilterChain = FilterChain<ModelVersion, ServerSnapshot>;
pub type ReplicaFilterChain = FilterChain<ModelVersion, ServerReplica>;

/// Server filters, in evaluation order.
pub fn default_server_filters() -> ServerFilterChain {
    vec![
        Box::new(DeletedServerFilter),
        Box::new(ServerReplicaFilter),
        Box::new(SharingServerFilter),
        Box::new(ServerRequirementFilter),
    ]
}

/// Replica filters, in evaluation order.
pub fn default_replica_filters() -> ReplicaFilterChain {
    vec![
        Box::new(ReplicaDrainingFilter),
        Box::new(AvailableMemoryReplicaFilter),
        Box::new(RequirementsReplicaFilter),
        Box::new(ExplainerFilter),
    ]
}

// =============================================================================
// Server filters
// =============================================================================

/// Rejects servers that are being deleted.
pub struct DeletedServerFilter;

impl Filter<ModelVersion, ServerSnapshot> for DeletedServerFilter {
    fn name(&self) -> &'static str {
        "deleted_server"
    }

    fn filter(&self, _model: &ModelVersion, server: &ServerSnapshot) -> bool {
        !server.is_deleting()
    }

    fn description(&self, _model: &ModelVersion, server: &ServerSnapshot) -> String {
        format!("server {} expected replicas {}", server.name, server.expected_replicas)
    }
}

/// Rejects servers without any connected replica.
pub struct ServerReplicaFilter;

impl Filter<ModelVersion, ServerSnapshot> for ServerReplicaFilter {
    fn name(&self) -> &'static str {
        "server_replica"
    }

    fn filter(&self, _model: &ModelVersion, server: &ServerSnapshot) -> bool {
        !server.replicas.is_empty()
    }

    fn description(&self, _model: &ModelVersion, server: &ServerSnapshot) -> String {
        format!("server {} has {} replicas", server.name, server.replicas.len())
    }
}

/// Pinned models only go to their named server; others only to shared
/// servers.
pub struct SharingServerFilter;

impl Filter<ModelVersion, ServerSnapshot> for SharingServerFilter {
    fn name(&self) -> &'static str {
        "sharing"
    }

    fn filter(&self, model: &ModelVersion, server: &ServerSnapshot) -> bool {
        match &model.spec.server {
            Some(pinned) => *pinned == server.name,
            None => server.shared,
        }
    }

    fn description(&self, model: &ModelVersion, server: &ServerSnapshot) -> String {
        format!(
            "model server {:?}, server {} shared {}",
            model.spec.server, server.name, server.shared
        )
    }
}

/// Checks requirements against the server's lowest-index replica.
pub struct ServerRequirementFilter;

impl Filter<ModelVersion, ServerSnapshot> for ServerRequirementFilter {
    fn name(&self) -> &'static str {
        "server_requirement"
    }

    fn filter(&self, model: &ModelVersion, server: &ServerSnapshot) -> bool {
        server
            .first_replica()
            .is_some_and(|r| capabilities_satisfied(&model.spec.requirements, &r.capabilities))
    }

    fn description(&self, model: &ModelVersion, server: &ServerSnapshot) -> String {
        let capabilities = server
            .first_replica()
            .map(|r| r.capabilities.clone())
            .unwrap_or_default();
        format!(
            "model requirements {:?}, server {} capabilities {:?}",
            model.spec.requirements, server.name, capabilities
        )
    }
}

// =============================================================================
// Replica filters
// =============================================================================

pub struct ReplicaDrainingFilter;

impl Filter<ModelVersion, ServerReplica> for ReplicaDrainingFilter {
    fn name(&self) -> &'static str {
        "replica_draining"
    }

    fn filter(&self, _model: &ModelVersion, replica: &ServerReplica) -> bool {
        !replica.draining
    }

    fn description(&self, _model: &ModelVersion, replica: &ServerReplica) -> String {
        format!("replica {} draining {}", replica.id(), replica.draining)
    }
}

/// Requires enough unreserved memory, unless the version is already
/// placed on this exact replica.
pub struct AvailableMemoryReplicaFilter;

impl Filter<ModelVersion, ServerReplica> for AvailableMemoryReplicaFilter {
    fn name(&self) -> &'static str {
        "available_memory"
    }

    fn filter(&self, model: &ModelVersion, replica: &ServerReplica) -> bool {
        model.spec.memory_bytes <= replica.free_memory_bytes()
            || model.is_placed_on(&replica.server_name, replica.idx)
    }

    fn description(&self, model: &ModelVersion, replica: &ServerReplica) -> String {
        format!(
            "model memory {}, replica {} available {} reserved {}",
            model.spec.memory_bytes,
            replica.id(),
            replica.available_memory_bytes,
            replica.reserved_memory_bytes
        )
    }
}

pub struct RequirementsReplicaFilter;

impl Filter<ModelVersion, ServerReplica> for RequirementsReplicaFilter {
    fn name(&self) -> &'static str {
        "requirements"
    }

    fn filter(&self, model: &ModelVersion, replica: &ServerReplica) -> bool {
        capabilities_satisfied(&model.spec.requirements, &replica.capabilities)
    }

    fn description(&self, model: &ModelVersion, replica: &ServerReplica) -> String {
        format!(
            "model requirements {:?}, replica {} capabilities {:?}",
            model.spec.requirements,
            replica.id(),
            replica.capabilities
        )
    }
}

pub struct ExplainerFilter;

impl Filter<ModelVersion, ServerReplica> for ExplainerFilter {
    fn name(&self) -> &'static str {
        "explainer"
    }

    fn filter(&self, model: &ModelVersion, replica: &ServerReplica) -> bool {
        !model.spec.explainer
            || replica
                .capabilities
                .iter()
                .any(|c| c.trim() == EXPLAINER_CAPABILITY)
    }

    fn description(&self, model: &ModelVersion, replica: &ServerReplica) -> String {
        format!(
            "model explainer {}, replica {} capabilities {:?}",
            model.spec.explainer,
            replica.id(),
            replica.capabilities
        )
    }
}
