//! Name and key definitions for scheduler resources.
//!
//! Models and servers are addressed by user-chosen names. Versions and
//! replicas are addressed by composite keys built from those names, which
//! is how the store expresses back-references without holding pointers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{define_name, IdError};

// =============================================================================
// Names
// =============================================================================

define_name!(ModelName, "model");
define_name!(ServerName, "server");

/// Validates a resource name.
///
/// A valid name is non-empty and made of ASCII letters, digits, `-` and `_`.
/// Dots are rejected because they act as separators in downstream topics.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), IdError> {
    if name.is_empty() {
        return Err(IdError::Empty);
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(IdError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Model Versions
// =============================================================================

/// Key of one version of a model, rendered as `name:version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelVersionId {
    pub name: String,
    pub version: u32,
}

impl ModelVersionId {
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ModelVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl FromStr for ModelVersionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = split_key(s)?;
        Ok(Self { name, version })
    }
}

// =============================================================================
// Server Replicas
// =============================================================================

/// Key of one replica of a server, rendered as `server:idx`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerReplicaId {
    pub server: String,
    pub replica_idx: u32,
}

impl ServerReplicaId {
    #[must_use]
    pub fn new(server: impl Into<String>, replica_idx: u32) -> Self {
        Self {
            server: server.into(),
            replica_idx,
        }
    }
}

impl fmt::Display for ServerReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.replica_idx)
    }
}

impl FromStr for ServerReplicaId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (server, replica_idx) = split_key(s)?;
        Ok(Self {
            server,
            replica_idx,
        })
    }
}

fn split_key(s: &str) -> Result<(String, u32), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    let Some((name, number)) = s.rsplit_once(':') else {
        return Err(IdError::MissingSeparator(s.to_string()));
    };
    if name.is_empty() {
        return Err(IdError::Empty);
    }
    let number = number.parse::<u32>().map_err(|e| IdError::InvalidNumber {
        key: s.to_string(),
        message: e.to_string(),
    })?;
    Ok((name.to_string(), number))
}
