//! Shared workflow state
//!
//! [`WorkflowState`] is the single record a run mutates. Every change goes
//! through [`WorkflowState::update`], [`WorkflowState::transition`],
//! [`WorkflowState::fail`] or [`WorkflowState::take_tasks`] and is appended to
//! the journal, so a run can be replayed from its entries.

mod field;
mod journal;
mod message;
mod slice;
mod telemetry;

pub use field::{Field, FieldSet};
pub use journal::{Change, JournalEntry, StateDelta};
pub use message::{Message, Results, Role, Task, TaskErrorKind, TaskResult, TaskSpec};
pub use slice::{SliceSource, StateSlice};
pub use telemetry::{ErrorRecord, Telemetry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Lifecycle status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Pending -> Running -> {Completed | Failed}, plus Pending -> Failed
    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state changes
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("workflow is {status}; {field} can no longer change")]
    Terminal { status: Status, field: Field },
}

/// The shared record mutated across a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    run_id: String,
    history: Vec<Message>,
    task_queue: Vec<Task>,
    results: Results,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    metadata: BTreeMap<String, Value>,
    #[serde(default)]
    ingested: BTreeSet<String>,
    #[serde(default)]
    tasks_enqueued: u64,
    #[serde(default)]
    journal: Vec<JournalEntry>,
    #[serde(default)]
    telemetry: Telemetry,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create an empty, pending state
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            history: Vec::new(),
            task_queue: Vec::new(),
            results: Results::new(),
            status: Status::Pending,
            failure_reason: None,
            metadata: BTreeMap::new(),
            ingested: BTreeSet::new(),
            tasks_enqueued: 0,
            journal: Vec::new(),
            telemetry: Telemetry::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Seed a pending state with initial messages
    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        let delta = StateDelta {
            history: messages.into_iter().collect(),
            ..Default::default()
        };
        self.record("input", Change::Delta(delta));
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.history.last()
    }

    pub fn task_queue(&self) -> &[Task] {
        &self.task_queue
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn journal(&self) -> &[JournalEntry] {
        &self.journal
    }

    /// Journal entries recorded at or after `seq`
    pub fn journal_since(&self, seq: u64) -> &[JournalEntry] {
        let start = (seq as usize).min(self.journal.len());
        &self.journal[start..]
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub(crate) fn telemetry_mut(&mut self) -> &mut Telemetry {
        &mut self.telemetry
    }

    pub fn is_ingested(&self, message_id: &str) -> bool {
        self.ingested.contains(message_id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Deterministic id for the `offset`-th task of the next enqueue
    pub fn next_task_id(&self, offset: usize) -> String {
        format!("task-{}", self.tasks_enqueued + offset as u64 + 1)
    }

    /// Merge a partial update.
    ///
    /// Once the workflow is terminal, the queue and results are frozen;
    /// history and metadata still accept bookkeeping writes.
    pub fn update(
        &mut self,
        origin: impl Into<String>,
        delta: StateDelta,
    ) -> Result<(), TransitionError> {
        if delta.is_empty() {
            return Ok(());
        }
        if self.status.is_terminal() {
            let frozen = if !delta.tasks.is_empty() {
                Some(Field::TaskQueue)
            } else if !delta.results.is_empty() {
                Some(Field::Results)
            } else {
                None
            };
            if let Some(field) = frozen {
                return Err(TransitionError::Terminal {
                    status: self.status,
                    field,
                });
            }
        }
        self.record(origin, Change::Delta(delta));
        Ok(())
    }

    /// Move to `next`; only monotonic transitions are accepted
    pub fn transition(
        &mut self,
        origin: impl Into<String>,
        next: Status,
    ) -> Result<(), TransitionError> {
        self.transition_with(origin, next, None)
    }

    /// Move to Failed, recording why
    pub fn fail(
        &mut self,
        origin: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition_with(origin, Status::Failed, Some(reason.into()))
    }

    fn transition_with(
        &mut self,
        origin: impl Into<String>,
        next: Status,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.record(origin, Change::Transition { to: next, reason });
        Ok(())
    }

    /// Remove every queued task for execution
    pub fn take_tasks(&mut self, origin: impl Into<String>) -> Vec<Task> {
        if self.task_queue.is_empty() {
            return Vec::new();
        }
        let tasks = self.task_queue.clone();
        let ids = tasks.iter().map(|t| t.id.clone()).collect();
        self.record(origin, Change::TasksTaken { ids });
        tasks
    }

    /// Current value of a field
    pub fn read(&self, field: &Field) -> Value {
        match field {
            Field::History => serde_json::to_value(&self.history).unwrap_or(Value::Null),
            Field::TaskQueue => serde_json::to_value(&self.task_queue).unwrap_or(Value::Null),
            Field::Results => self.results.to_json(),
            Field::Status => Value::String(self.status.to_string()),
            Field::Metadata(key) => self.metadata.get(key).cloned().unwrap_or(Value::Null),
            Field::AnyMetadata => serde_json::to_value(&self.metadata).unwrap_or(Value::Null),
        }
    }

    /// Rebuild a state from a journal
    pub fn replay(
        run_id: impl Into<String>,
        entries: &[JournalEntry],
    ) -> Result<Self, TransitionError> {
        let mut state = Self::new(run_id);
        if let Some(first) = entries.first() {
            state.created_at = first.at;
        }
        for entry in entries {
            if let Change::Transition { to, .. } = &entry.change {
                if !state.status.can_transition_to(*to) {
                    return Err(TransitionError::InvalidTransition {
                        from: state.status,
                        to: *to,
                    });
                }
            }
            state.apply(&entry.change);
            state.journal.push(entry.clone());
            state.updated_at = entry.at;
        }
        Ok(state)
    }

    /// Template/expression view of the state
    pub fn view(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "status": self.status.as_str(),
            "failure_reason": self.failure_reason,
            "history": self.history,
            "last_message": self.history.last(),
            "task_queue": self.task_queue,
            "pending_tasks": self.task_queue.len(),
            "results": self.results.to_json(),
            "failed_tasks": self.results.failures(),
            "metadata": self.metadata,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    fn record(&mut self, origin: impl Into<String>, change: Change) {
        self.apply(&change);
        let now = Utc::now();
        self.journal.push(JournalEntry {
            seq: self.journal.len() as u64,
            at: now,
            origin: origin.into(),
            change,
        });
        self.updated_at = now;
    }

    fn apply(&mut self, change: &Change) {
        match change {
            Change::Delta(delta) => {
                for message in &delta.history {
                    self.ingested.insert(message.id.clone());
                    self.history.push(message.clone());
                }
                for task in &delta.tasks {
                    self.task_queue.push(task.clone());
                    self.tasks_enqueued += 1;
                }
                for (task_id, result) in &delta.results {
                    self.results.insert(task_id.clone(), result.clone());
                }
                for (key, value) in &delta.metadata {
                    self.metadata.insert(key.clone(), value.clone());
                }
                for key in &delta.remove_metadata {
                    self.metadata.remove(key);
                }
            }
            Change::Transition { to, reason } => {
                self.status = *to;
                if reason.is_some() {
                    self.failure_reason = reason.clone();
                }
            }
            Change::TasksTaken { ids } => {
                self.task_queue.retain(|t| !ids.contains(&t.id));
            }
        }
    }
}
