//! Scheduler module for model placement.
//!
//! The scheduler is responsible for:
//! - Choosing one server and enough of its replicas for a model's latest version
//! - Tearing down placements of deleted models
//! - Retrying failed and under-replicated models in the background
//!
//! Placement runs two pipelines of filters and sorters: one over servers,
//! one over the replicas of each surviving server.

mod engine;
mod filters;
mod sorters;
mod worker;

pub use engine::{Scheduler, SchedulerConfig, SchedulerError, SchedulerResult};
pub use filters::{
    default_replica_filters, default_server_filters, AvailableMemoryReplicaFilter,
    DeletedServerFilter, ExplainerFilter, ReplicaDrainingFilter, ReplicaFilterChain,
    RequirementsReplicaFilter, ServerFilterChain, ServerReplicaFilter, ServerRequirementFilter,
    SharingServerFilter, EXPLAINER_CAPABILITY,
};
pub use sorters::{
    default_replica_sorters, default_server_sorters, AvailableMemorySorter,
    ModelAlreadyLoadedOnServerSorter, ModelAlreadyLoadedSorter, ReplicaIndexSorter,
    ReplicaSorterChain, ServerSorterChain,
};
pub use worker::{SchedulerWorker, SCHEDULER_WORKER_HANDLER};
