//! Graph and batch validation errors

use thiserror::Error;

/// Structural problems found while building a graph or assembling a batch
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("graph has no nodes")]
    Empty,

    #[error("entry node not set")]
    MissingEntry,

    #[error("entry node '{0}' not found")]
    UnknownEntry(String),

    #[error("resume node '{0}' not found")]
    UnknownResume(String),

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownEdgeNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("node '{0}' is unreachable from the entry node")]
    Unreachable(String),

    #[error("edge {from} -> {to} has an invalid condition: {message}")]
    InvalidCondition {
        from: String,
        to: String,
        message: String,
    },

    #[error("'{first}' and '{second}' both write {fields}")]
    ConflictingWrites {
        first: String,
        second: String,
        fields: String,
    },
}
