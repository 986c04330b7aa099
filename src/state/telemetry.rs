//! Per-run execution bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node error observed during the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub node: String,
    pub error: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Timing and error counters kept alongside the state.
///
/// Maintained by the runner; not journaled and not part of any
/// capability declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Accumulated execution time per node, in milliseconds
    #[serde(default)]
    pub node_time_ms: BTreeMap<String, u64>,

    #[serde(default)]
    pub total_processing_ms: u64,

    #[serde(default)]
    pub errors: Vec<ErrorRecord>,

    #[serde(default)]
    pub retries: u32,
}

impl Telemetry {
    pub(crate) fn record_execution(&mut self, node: &str, elapsed_ms: u64) {
        *self.node_time_ms.entry(node.to_string()).or_default() += elapsed_ms;
        self.total_processing_ms += elapsed_ms;
    }

    pub(crate) fn record_error(&mut self, node: &str, error: impl Into<String>, attempt: u32) {
        self.errors.push(ErrorRecord {
            node: node.to_string(),
            error: error.into(),
            attempt,
            at: Utc::now(),
        });
    }

    pub(crate) fn record_retry(&mut self) {
        self.retries += 1;
    }
}
