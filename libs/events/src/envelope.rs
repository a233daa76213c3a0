//! Event envelope - the common wrapper for all hub events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic an event is published on.
///
/// Topics are independent: ordering is only guaranteed within one topic
/// for one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Model,
    Server,
    Pipeline,
    PipelineStreams,
    Experiment,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Topic::Model => "model",
            Topic::Server => "server",
            Topic::Pipeline => "pipeline",
            Topic::PipelineStreams => "pipeline_streams",
            Topic::Experiment => "experiment",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Hub-wide monotonic sequence number, assigned at publish time.
    pub sequence: u64,

    /// When the event was published.
    pub occurred_at: DateTime<Utc>,

    /// The topic this event was published on.
    pub topic: Topic,

    /// Component that published the event (e.g. `store.model.update`).
    pub source: String,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates an envelope stamped with the current time.
    pub fn new(sequence: u64, topic: Topic, source: impl Into<String>, payload: P) -> Self {
        Self {
            sequence,
            occurred_at: Utc::now(),
            topic,
            source: source.into(),
            payload,
        }
    }
}
