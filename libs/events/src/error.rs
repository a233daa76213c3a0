//! Error types for event handling.

use thiserror::Error;

use crate::Topic;

/// Errors that can occur when registering handlers or publishing events.
///
/// Publish paths never return these to callers; they are logged by the hub.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The hub has been closed.
    #[error("event hub is closed")]
    Closed,

    /// A consumer's dispatch loop has stopped.
    #[error("handler '{handler}' on topic {topic} has stopped")]
    HandlerStopped { topic: Topic, handler: String },

    /// A handler with this name is already registered on the topic.
    #[error("handler '{handler}' already registered on topic {topic}")]
    DuplicateHandler { topic: Topic, handler: String },

    /// Registration happened outside a tokio runtime.
    #[error("no tokio runtime available to spawn handler '{0}'")]
    NoRuntime(String),
}
