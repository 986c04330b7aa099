//! Run checkpoints
//!
//! The runner saves a [`Checkpoint`] after every step when a
//! [`Checkpointer`] is attached; `WorkflowRunner::resume` continues from the
//! latest one.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryCheckpointer;
pub use sqlite::SqliteCheckpointer;

use crate::state::WorkflowState;
use crate::workflow::RunPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to serialize checkpoint: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint for run '{run_id}': {message}")]
    Corrupt { run_id: String, message: String },
}

/// Everything needed to continue a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Node executions so far
    pub step: u32,
    /// Node to execute next; `None` once the run has ended
    pub next_node: Option<String>,
    pub awaiting_input: bool,
    pub phase: RunPhase,
    pub state: WorkflowState,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A checkpoint holding just the state, e.g. a finished transcript
    pub fn snapshot(state: WorkflowState) -> Self {
        Self {
            run_id: state.run_id().to_string(),
            step: 0,
            next_node: None,
            awaiting_input: false,
            phase: RunPhase::Idle,
            state,
            saved_at: Utc::now(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

/// One line of `list_runs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub checkpoints: u64,
    pub last_step: u32,
    pub phase: RunPhase,
    pub status: String,
    pub saved_at: DateTime<Utc>,
}

/// Checkpoint storage
pub trait Checkpointer: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Stored runs, most recently saved first
    fn list_runs(&self) -> Result<Vec<RunSummary>, CheckpointError>;

    /// Remove every checkpoint of a run; returns how many were removed
    fn delete(&self, run_id: &str) -> Result<usize, CheckpointError>;
}
