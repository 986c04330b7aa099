//! Parallel task execution
//!
//! Drains the task queue, runs each task on a bounded worker pool against an
//! isolated [`StateSlice`], and merges the outcomes back in submission order.

use super::{Capabilities, NodeContext, NodeError, NodeOutcome};
use crate::graph::ValidationError;
use crate::state::{
    Field, FieldSet, SliceSource, StateDelta, StateSlice, Task, TaskErrorKind, TaskResult,
    WorkflowState,
};
use crate::workflow::{CancellationToken, with_cancellation};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const LAST_BATCH_KEY: &str = "parallel.last_batch";
const PARTIAL_FAILURE_KEY: &str = "parallel.partial_failure";

/// Errors returned by task handlers
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Value produced by a task plus the metadata it writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub value: Value,
    pub metadata: BTreeMap<String, Value>,
}

impl TaskOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Executes tasks of one kind
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task kind this handler serves
    fn kind(&self) -> &str;

    /// Fields the handler reads and the metadata keys it writes.
    ///
    /// Every task implicitly writes its own result slot.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn run(&self, slice: &StateSlice, task: &Task) -> Result<TaskOutput, TaskError>;
}

/// One failed task of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailureRecord {
    pub task_id: String,
    pub kind: TaskErrorKind,
    pub message: String,
}

/// Recorded in metadata when at least one task of a batch fails
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialFailure {
    pub failed: usize,
    pub total: usize,
    pub threshold: usize,
    pub errors: Vec<TaskFailureRecord>,
}

#[derive(Debug)]
struct TaskFailure {
    kind: TaskErrorKind,
    message: String,
}

impl TaskFailure {
    fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Parallel execution node
#[derive(Default)]
pub struct ParallelExecutor {
    handlers: Vec<Arc<dyn TaskHandler>>,
}

impl ParallelExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later handler for the same kind replaces the earlier one
    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.retain(|h| h.kind() != handler.kind());
        self.handlers.push(handler);
        self
    }

    pub fn handler(&self, kind: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.iter().find(|h| h.kind() == kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.kind()).collect()
    }

    /// Reject handlers whose declared writes overlap
    pub fn validate_handlers(&self) -> Result<(), ValidationError> {
        for (i, a) in self.handlers.iter().enumerate() {
            for b in &self.handlers[i + 1..] {
                check_disjoint(a.kind(), &a.capabilities().writes, b.kind(), &b.capabilities().writes)?;
            }
        }
        Ok(())
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        let mut reads = FieldSet::new();
        let mut writes = FieldSet::new()
            .with(Field::TaskQueue)
            .with(Field::Results)
            .with(Field::Status)
            .with(Field::metadata(LAST_BATCH_KEY))
            .with(Field::metadata(PARTIAL_FAILURE_KEY));
        for handler in &self.handlers {
            let caps = handler.capabilities();
            reads.extend(&caps.reads);
            writes.extend(&caps.writes);
        }
        Capabilities::new(reads, writes)
    }

    /// Reject a batch in which two tasks would write the same non-result field
    fn validate_batch(&self, tasks: &[Task]) -> Result<(), ValidationError> {
        let declared: Vec<(&Task, FieldSet)> = tasks
            .iter()
            .filter_map(|t| self.handler(&t.kind).map(|h| (t, h.capabilities().writes)))
            .collect();
        for (i, (a, a_writes)) in declared.iter().enumerate() {
            for (b, b_writes) in &declared[i + 1..] {
                check_disjoint(&a.id, a_writes, &b.id, b_writes)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn execute(
        &self,
        name: &str,
        state: &mut WorkflowState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        self.validate_batch(state.task_queue())?;
        let tasks = state.take_tasks(name);
        if tasks.is_empty() {
            return Ok(NodeOutcome::Continue);
        }

        let workers = tasks.len().min(ctx.config.max_parallel_workers.max(1));
        tracing::info!(node = name, tasks = tasks.len(), workers, "dispatching task batch");

        let source = SliceSource::capture(state);
        let semaphore = Arc::new(Semaphore::new(workers));
        let timeout = ctx.config.task_timeout();

        // Dropping the set (e.g. when the run times out) aborts every task
        let mut running = JoinSet::new();
        let mut slot_of = HashMap::new();
        let mut slots: Vec<Option<Result<TaskOutput, TaskFailure>>> = Vec::with_capacity(tasks.len());
        for (idx, task) in tasks.iter().enumerate() {
            match self.handler(&task.kind) {
                None => slots.push(Some(Err(TaskFailure::new(
                    TaskErrorKind::UnknownKind,
                    format!("no handler for task kind '{}'", task.kind),
                )))),
                Some(handler) => {
                    let abort = running.spawn(run_task(
                        handler.clone(),
                        source.slice(&handler.capabilities().reads),
                        task.clone(),
                        semaphore.clone(),
                        ctx.cancel.clone(),
                        timeout,
                    ));
                    slot_of.insert(abort.id(), idx);
                    slots.push(None);
                }
            }
        }

        while let Some(joined) = running.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) if e.is_panic() => (
                    e.id(),
                    Err(TaskFailure::new(TaskErrorKind::Panicked, "task panicked")),
                ),
                Err(e) => (
                    e.id(),
                    Err(TaskFailure::new(TaskErrorKind::Cancelled, e.to_string())),
                ),
            };
            if let Some(&idx) = slot_of.get(&id) {
                slots[idx] = Some(outcome);
            }
        }

        // Merge strictly in submission order, whatever the completion order
        let mut delta = StateDelta::new();
        let mut succeeded = Map::new();
        let mut failures = Vec::new();
        for (task, slot) in tasks.iter().zip(slots) {
            let outcome = slot.unwrap_or_else(|| {
                Err(TaskFailure::new(TaskErrorKind::Cancelled, "task never reported"))
            });
            let outcome = outcome.and_then(|output| self.check_writes(task, output));

            match outcome {
                Ok(output) => {
                    succeeded.insert(task.id.clone(), output.value.clone());
                    delta.results.push((task.id.clone(), TaskResult::success(output.value)));
                    delta.metadata.extend(output.metadata);
                }
                Err(failure) => {
                    tracing::warn!(
                        node = name,
                        task = %task.id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "task failed"
                    );
                    delta.results.push((
                        task.id.clone(),
                        TaskResult::failure(failure.kind, failure.message.clone()),
                    ));
                    failures.push(TaskFailureRecord {
                        task_id: task.id.clone(),
                        kind: failure.kind,
                        message: failure.message,
                    });
                }
            }
        }

        let failed: Map<String, Value> = failures
            .iter()
            .map(|f| (f.task_id.clone(), json!(f.message)))
            .collect();
        delta.metadata.insert(
            LAST_BATCH_KEY.into(),
            json!({
                "tasks": tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
                "workers": workers,
                "succeeded": succeeded,
                "failed": failed,
            }),
        );

        let threshold = ctx.config.failure_threshold;
        let failed_count = failures.len();
        if failed_count > 0 {
            let record = PartialFailure {
                failed: failed_count,
                total: tasks.len(),
                threshold,
                errors: failures,
            };
            delta.metadata.insert(
                PARTIAL_FAILURE_KEY.into(),
                serde_json::to_value(&record).unwrap_or(Value::Null),
            );
        }

        state.update(name, delta)?;

        if threshold > 0 && failed_count >= threshold {
            state.fail(
                name,
                format!(
                    "{} of {} tasks failed (threshold {})",
                    failed_count,
                    tasks.len(),
                    threshold
                ),
            )?;
        }

        tracing::info!(
            node = name,
            succeeded = tasks.len() - failed_count,
            failed = failed_count,
            "task batch merged"
        );
        Ok(NodeOutcome::Continue)
    }

    fn check_writes(&self, task: &Task, output: TaskOutput) -> Result<TaskOutput, TaskFailure> {
        let writes = self
            .handler(&task.kind)
            .map(|h| h.capabilities().writes)
            .unwrap_or_default();
        match output
            .metadata
            .keys()
            .find(|key| !writes.permits(&Field::metadata(key.as_str())))
        {
            Some(key) => Err(TaskFailure::new(
                TaskErrorKind::UndeclaredWrite,
                format!("task wrote undeclared metadata key '{}'", key),
            )),
            None => Ok(output),
        }
    }
}

fn check_disjoint(
    first: &str,
    a: &FieldSet,
    second: &str,
    b: &FieldSet,
) -> Result<(), ValidationError> {
    let overlap = a.overlap(b);
    if overlap.is_empty() {
        return Ok(());
    }
    Err(ValidationError::ConflictingWrites {
        first: first.to_string(),
        second: second.to_string(),
        fields: overlap.into_iter().collect::<FieldSet>().to_string(),
    })
}

async fn run_task(
    handler: Arc<dyn TaskHandler>,
    slice: StateSlice,
    task: Task,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> Result<TaskOutput, TaskFailure> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| TaskFailure::new(TaskErrorKind::Cancelled, "worker pool closed"))?;

    let work = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, handler.run(&slice, &task))
                .await
                .map_err(|_| {
                    TaskFailure::new(
                        TaskErrorKind::TimedOut,
                        format!("task exceeded {}ms", limit.as_millis()),
                    )
                }),
            None => Ok(handler.run(&slice, &task).await),
        }
    };

    let result = with_cancellation(&cancel, work)
        .await
        .unwrap_or_else(|| Err(TaskFailure::new(TaskErrorKind::Cancelled, "run cancelled")))?;

    result.map_err(|e| TaskFailure::new(TaskErrorKind::Failed, e.to_string()))
}
