//! Scheduler state store.
//!
//! The store is the single source of truth for:
//! - The model catalog and every version's replica lifecycle
//! - The server fleet, replica capacity and back-references to hosted models
//! - Aggregate model status, derived from replica states on every change
//!
//! Reads hand out deep copies. Relationships are kept as keys
//! (`ModelVersionId`, server name), never as references into the store.

mod error;
mod memory;
mod model;
mod persistence;
mod server;
mod status;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use model::{
    Model, ModelSnapshot, ModelSpec, ModelState, ModelStatus, ModelVersion, ReplicaState,
    ReplicaStatus,
};
pub use persistence::{NoopPersistence, Persistence};
pub use server::{
    LoadedModel, ServerReplica, ServerReplicaConfig, ServerSnapshot, ServerStats,
    UNCONSTRAINED_REPLICAS,
};
