//! # mlsched-events
//!
//! Event payloads and the in-process pub/sub hub that connects the
//! scheduler store to its consumers.
//!
//! ## Design Principles
//!
//! - Payloads name the entity that changed; consumers read state from the store
//! - Publishing never blocks the publisher
//! - Every consumer has its own bounded queue and dispatch task
//! - Ordering holds per consumer, per topic, and nowhere else
//!
//! ## Topics
//!
//! - `Model`: a model version's status or assignment changed
//! - `Server`: a server replica connected, or needs to scale up or down
//! - `Pipeline`, `PipelineStreams`, `Experiment`: carried for the
//!   registrants that sit on top of the scheduler

mod envelope;
mod error;
mod hub;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use hub::{EventHub, DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY};
pub use types::*;
