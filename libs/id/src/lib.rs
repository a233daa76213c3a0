//! # mlsched-id
//!
//! Resource names and composite keys for the model placement scheduler.
//!
//! ## Design Principles
//!
//! - Names are user-controlled labels and are validated once, on ingest
//! - Relationships between entities are expressed as keys, never pointers
//! - Keys have a canonical `name:number` string form with strict parsing
//!
//! ## Key Format
//!
//! - `ModelVersionId`: `{model}:{version}`, e.g. `iris:2`
//! - `ServerReplicaId`: `{server}:{replica_idx}`, e.g. `mlserver:0`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
