//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating names and keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The name is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name contains a character outside `[A-Za-z0-9_-]`.
    #[error("invalid {kind} name '{name}': must be alphanumeric and must not contain dots (.)")]
    InvalidName { kind: &'static str, name: String },

    /// The key is missing its `:` separator.
    #[error("key missing ':' separator: {0}")]
    MissingSeparator(String),

    /// The numeric part of a key could not be parsed.
    #[error("invalid number in key '{key}': {message}")]
    InvalidNumber { key: String, message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
