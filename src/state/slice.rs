//! Isolated read-only views handed to parallel tasks

use super::field::{Field, FieldSet};
use super::message::{Message, Results, Task};
use super::{Status, WorkflowState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One shared copy of the state's fields, captured before a batch runs.
///
/// Slices clone the `Arc`s, so a batch of tasks shares a single copy.
#[derive(Debug, Clone)]
pub struct SliceSource {
    history: Arc<Vec<Message>>,
    task_queue: Arc<Vec<Task>>,
    results: Arc<Results>,
    status: Status,
    metadata: Arc<BTreeMap<String, Value>>,
}

impl SliceSource {
    pub fn capture(state: &WorkflowState) -> Self {
        Self {
            history: Arc::new(state.history().to_vec()),
            task_queue: Arc::new(state.task_queue().to_vec()),
            results: Arc::new(state.results().clone()),
            status: state.status(),
            metadata: Arc::new(state.metadata().clone()),
        }
    }

    /// A view containing only the `reads` fields
    pub fn slice(&self, reads: &FieldSet) -> StateSlice {
        let metadata = if reads.permits(&Field::AnyMetadata) {
            Some(self.metadata.clone())
        } else {
            let picked: BTreeMap<String, Value> = reads
                .iter()
                .filter_map(|f| match f {
                    Field::Metadata(key) => {
                        self.metadata.get(key).map(|v| (key.clone(), v.clone()))
                    }
                    _ => None,
                })
                .collect();
            (!picked.is_empty()).then(|| Arc::new(picked))
        };

        StateSlice {
            reads: reads.clone(),
            history: reads
                .permits(&Field::History)
                .then(|| self.history.clone()),
            task_queue: reads
                .permits(&Field::TaskQueue)
                .then(|| self.task_queue.clone()),
            results: reads
                .permits(&Field::Results)
                .then(|| self.results.clone()),
            status: reads.permits(&Field::Status).then_some(self.status),
            metadata,
        }
    }
}

/// Read-only copy of the declared read fields
#[derive(Debug, Clone)]
pub struct StateSlice {
    reads: FieldSet,
    history: Option<Arc<Vec<Message>>>,
    task_queue: Option<Arc<Vec<Task>>>,
    results: Option<Arc<Results>>,
    status: Option<Status>,
    metadata: Option<Arc<BTreeMap<String, Value>>>,
}

impl StateSlice {
    /// Build a slice straight from a state
    pub fn of(state: &WorkflowState, reads: &FieldSet) -> Self {
        SliceSource::capture(state).slice(reads)
    }

    pub fn reads(&self) -> &FieldSet {
        &self.reads
    }

    /// `None` when history was not declared
    pub fn history(&self) -> Option<&[Message]> {
        self.history.as_deref().map(Vec::as_slice)
    }

    pub fn task_queue(&self) -> Option<&[Task]> {
        self.task_queue.as_deref().map(Vec::as_slice)
    }

    pub fn results(&self) -> Option<&Results> {
        self.results.as_deref()
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// `None` when the key was not declared or is absent
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        if !self.reads.permits(&Field::metadata(key)) {
            return None;
        }
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}
