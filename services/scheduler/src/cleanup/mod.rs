//! Background reclamation of superseded model versions.

mod worker;

pub use worker::{CleanupWorker, CleanupWorkerConfig};
