//! Node execution errors

use crate::graph::ValidationError;
use crate::state::{Field, TransitionError};
use thiserror::Error;

/// Why a node failed to execute
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// Worth retrying: flaky dependency, contention
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("decision failed: {0}")]
    Decision(String),

    #[error("message source error: {0}")]
    Source(String),

    #[error("message source closed")]
    SourceClosed,

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("state change rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("node '{node}' wrote undeclared field {field}")]
    UndeclaredWrite { node: String, field: Field },
}

impl NodeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether the runner may retry the node
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Source(_))
    }
}
