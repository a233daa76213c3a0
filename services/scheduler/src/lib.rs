//! mlsched model placement scheduler library.
//!
//! This crate primarily ships a `scheduler` binary, but we expose the
//! store, placement engine and sweeps as a library so a transport layer
//! and the integration tests can drive them directly.

pub mod cleanup;
pub mod config;
pub mod scheduler;
pub mod store;
