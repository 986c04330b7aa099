//! Conversation messages, tasks and task results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single entry of the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,

    /// Work requested by the message itself; the listener enqueues it as a task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSpec>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            task: None,
        }
    }

    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content)
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content)
    }

    pub fn system(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::System, content)
    }

    /// Attach a task request to the message
    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.task = Some(task);
        self
    }
}

/// A request for delegated work, before an id has been assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id; assigned by the state when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A queued unit of delegated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Why a task produced no value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Failed,
    Cancelled,
    Panicked,
    TimedOut,
    UnknownKind,
    UndeclaredWrite,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
            Self::TimedOut => "timed out",
            Self::UnknownKind => "unknown kind",
            Self::UndeclaredWrite => "undeclared write",
        };
        f.write_str(s)
    }
}

/// Outcome of one task, persisted into `results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
    Success { value: Value },
    Failure { kind: TaskErrorKind, message: String },
}

impl TaskResult {
    pub fn success(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success { value } => Some(value),
            Self::Failure { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { message, .. } => Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResultEntry {
    task_id: String,
    #[serde(flatten)]
    result: TaskResult,
}

/// Task results keyed by task id, kept in the order they were recorded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Results {
    entries: Vec<ResultEntry>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the result for a task; replacing keeps the original position
    pub fn insert(&mut self, task_id: impl Into<String>, result: TaskResult) {
        let task_id = task_id.into();
        match self.entries.iter_mut().find(|e| e.task_id == task_id) {
            Some(entry) => entry.result = result,
            None => self.entries.push(ResultEntry { task_id, result }),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskResult> {
        self.entries
            .iter()
            .find(|e| e.task_id == task_id)
            .map(|e| &e.result)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.get(task_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskResult)> {
        self.entries.iter().map(|e| (e.task_id.as_str(), &e.result))
    }

    /// Task ids in recording order
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.task_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.entries.iter().filter(|e| !e.result.is_success()).count()
    }

    /// JSON object view: task id to result
    pub fn to_json(&self) -> Value {
        let map = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.task_id.clone(),
                    serde_json::to_value(&e.result).unwrap_or(Value::Null),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }
}
