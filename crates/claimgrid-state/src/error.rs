//! Error types for the ClaimGrid object store.

use thiserror::Error;

use crate::types::ObjectKind;
use crate::version::ResourceVersion;

/// Result type alias for object store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: String },

    /// The version presented by the writer does not match the stored one.
    #[error("{kind} {key}: version must match the object that gets updated (have {expected}, stored {actual})")]
    Conflict {
        kind: ObjectKind,
        key: String,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("invalid {kind} {key}: {reason}")]
    Invalid {
        kind: ObjectKind,
        key: String,
        reason: String,
    },
}

impl StateError {
    /// Whether this is an optimistic-concurrency version mismatch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }
}
