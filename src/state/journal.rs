//! Change journal for the workflow state

use super::field::{Field, FieldSet};
use super::message::{Message, Task, TaskResult};
use super::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A partial update merged into the state by [`super::WorkflowState::update`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<(String, TaskResult)>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_metadata: Vec<String>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.history.push(message);
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn result(mut self, task_id: impl Into<String>, result: TaskResult) -> Self {
        self.results.push((task_id.into(), result));
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.remove_metadata.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
            && self.tasks.is_empty()
            && self.results.is_empty()
            && self.metadata.is_empty()
            && self.remove_metadata.is_empty()
    }

    /// Fields this delta writes
    pub fn touched_fields(&self) -> FieldSet {
        let mut fields = FieldSet::new();
        if !self.history.is_empty() {
            fields.insert(Field::History);
        }
        if !self.tasks.is_empty() {
            fields.insert(Field::TaskQueue);
        }
        if !self.results.is_empty() {
            fields.insert(Field::Results);
        }
        for key in self.metadata.keys().chain(self.remove_metadata.iter()) {
            fields.insert(Field::Metadata(key.clone()));
        }
        fields
    }
}

/// One recorded change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    Delta(StateDelta),
    Transition {
        to: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TasksTaken {
        ids: Vec<String>,
    },
}

impl Change {
    pub fn touched_fields(&self) -> FieldSet {
        match self {
            Self::Delta(delta) => delta.touched_fields(),
            Self::Transition { .. } => FieldSet::new().with(Field::Status),
            Self::TasksTaken { .. } => FieldSet::new().with(Field::TaskQueue),
        }
    }
}

/// A sequenced, timestamped change with the name of whoever made it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub origin: String,
    pub change: Change,
}
