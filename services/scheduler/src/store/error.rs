//! Store error types.

use mlsched_id::{IdError, ModelVersionId, ServerReplicaId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by [`MemoryStore`](super::MemoryStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("model version not found: {0}")]
    VersionNotFound(ModelVersionId),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server replica not found: {0}")]
    ReplicaNotFound(ServerReplicaId),

    /// The request raced with, or contradicts, the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] IdError),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl StoreError {
    /// Returns true for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_)
                | Self::VersionNotFound(_)
                | Self::ServerNotFound(_)
                | Self::ReplicaNotFound(_)
        )
    }
}
