//! Workflow runner - drives a state through the graph

use super::cancel::{CancellationToken, with_cancellation};
use super::retry::RetryPolicy;
use crate::checkpoint::{Checkpoint, CheckpointError, Checkpointer};
use crate::config::EngineConfig;
use crate::graph::{GraphBuilder, ValidationError, WorkflowGraph};
use crate::node::{Node, NodeContext, NodeError, NodeOutcome};
use crate::state::{Role, Status, TransitionError, WorkflowState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Lifecycle of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    /// Waiting for the listener to receive input
    Suspended,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a run ended in Failed
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("max steps exceeded ({limit})")]
    MaxStepsExceeded { limit: u32 },

    #[error("run timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("node '{node}' failed after {attempts} attempt(s): {message}")]
    NodeFailed {
        node: String,
        message: String,
        attempts: u32,
    },

    #[error("message source closed while '{node}' was waiting for input")]
    SourceClosed { node: String },

    #[error("run ended with status {status}")]
    Incomplete { status: Status },

    /// A node moved the state to Failed itself
    #[error("{reason}")]
    Reported { reason: String },
}

/// Errors that prevent a run from starting or resuming
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("a run must start from a pending state, found {0}")]
    InvalidStart(Status),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("no checkpoint found for run '{0}'")]
    NoCheckpoint(String),

    #[error("checkpoint references unknown node '{0}'")]
    UnknownNode(String),

    #[error("no checkpointer configured")]
    NoCheckpointer,

    #[error("invalid graph: {0}")]
    Validation(#[from] ValidationError),
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub phase: RunPhase,
    pub state: WorkflowState,
    /// Node executions, across resumptions
    pub steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.phase == RunPhase::Completed
    }

    /// Last assistant message, if any
    pub fn reply(&self) -> Option<&str> {
        self.state
            .history()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

/// Position of a run in the graph
#[derive(Debug, Clone, Copy)]
struct Cursor {
    node: Option<usize>,
    steps: u32,
    phase: RunPhase,
    awaiting_input: bool,
}

/// Executes workflow graphs
pub struct WorkflowRunner {
    graph: Arc<WorkflowGraph>,
    config: EngineConfig,
    retry: RetryPolicy,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    cancel: CancellationToken,
}

impl WorkflowRunner {
    pub fn new(graph: Arc<WorkflowGraph>, config: EngineConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            graph,
            config,
            retry,
            checkpointer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the graph and wrap it in a runner
    pub fn build(builder: GraphBuilder, config: EngineConfig) -> Result<Self, WorkflowError> {
        Ok(Self::new(Arc::new(builder.build()?), config))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    /// Run a pending state from the entry node until END or failure
    pub async fn run(&self, mut state: WorkflowState) -> Result<RunReport, WorkflowError> {
        if state.status() != Status::Pending {
            return Err(WorkflowError::InvalidStart(state.status()));
        }
        state.transition("runner", Status::Running)?;
        tracing::info!(run_id = %state.run_id(), messages = state.history().len(), "run started");

        let cursor = Cursor {
            node: Some(self.graph.entry()),
            steps: 0,
            phase: RunPhase::Running,
            awaiting_input: false,
        };
        Ok(self.drive(state, cursor).await)
    }

    /// Continue a run from its latest checkpoint
    pub async fn resume(&self, run_id: &str) -> Result<RunReport, WorkflowError> {
        let store = self
            .checkpointer
            .as_ref()
            .ok_or(WorkflowError::NoCheckpointer)?;
        let checkpoint = store
            .load_latest(run_id)?
            .ok_or_else(|| WorkflowError::NoCheckpoint(run_id.to_string()))?;

        let node = match &checkpoint.next_node {
            Some(name) => Some(
                self.graph
                    .node_index(name)
                    .ok_or_else(|| WorkflowError::UnknownNode(name.clone()))?,
            ),
            None => None,
        };

        if node.is_none() || checkpoint.phase.is_finished() {
            tracing::info!(run_id, phase = %checkpoint.phase, "run already finished");
            let failure = (checkpoint.phase == RunPhase::Failed).then(|| RunFailure::Reported {
                reason: checkpoint
                    .state
                    .failure_reason()
                    .unwrap_or("failed")
                    .to_string(),
            });
            return Ok(RunReport {
                run_id: run_id.to_string(),
                phase: checkpoint.phase,
                steps: checkpoint.step,
                state: checkpoint.state,
                failure,
                duration_ms: 0,
            });
        }

        tracing::info!(
            run_id,
            step = checkpoint.step,
            node = checkpoint.next_node.as_deref().unwrap_or_default(),
            "resuming run"
        );
        let cursor = Cursor {
            node,
            steps: checkpoint.step,
            phase: checkpoint.phase,
            awaiting_input: checkpoint.awaiting_input,
        };
        Ok(self.drive(checkpoint.state, cursor).await)
    }

    async fn drive(&self, mut state: WorkflowState, mut cursor: Cursor) -> RunReport {
        let started = Instant::now();
        let timeout = self.config.timeout();

        // Scoped to this run so a timeout reaches in-flight tasks without
        // cancelling the caller's token
        let run_cancel = self.cancel.child();
        let outcome = {
            let traversal = self.traverse(&mut state, &mut cursor, &run_cancel);
            let bounded = async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, traversal)
                        .await
                        .unwrap_or(Err(RunFailure::Timeout {
                            timeout_ms: limit.as_millis() as u64,
                        })),
                    None => traversal.await,
                }
            };
            with_cancellation(&self.cancel, bounded)
                .await
                .unwrap_or(Err(RunFailure::Cancelled))
        };
        if outcome.is_err() {
            run_cancel.cancel();
        }

        let failure = match outcome {
            Ok(()) => match state.status() {
                Status::Completed => None,
                Status::Failed => Some(RunFailure::Reported {
                    reason: state.failure_reason().unwrap_or("failed").to_string(),
                }),
                status => Some(RunFailure::Incomplete { status }),
            },
            Err(failure) => Some(failure),
        };

        if let Some(failure) = &failure {
            if !state.status().is_terminal() {
                if let Err(e) = state.fail("runner", failure.to_string()) {
                    tracing::warn!(run_id = %state.run_id(), error = %e, "could not record failure");
                }
            }
        }

        cursor.node = None;
        cursor.awaiting_input = false;
        cursor.phase = if failure.is_some() {
            RunPhase::Failed
        } else {
            RunPhase::Completed
        };
        self.save_checkpoint(&state, &cursor);

        let duration_ms = started.elapsed().as_millis() as u64;
        match &failure {
            None => tracing::info!(
                run_id = %state.run_id(),
                steps = cursor.steps,
                duration_ms,
                "run completed"
            ),
            Some(f) => tracing::warn!(
                run_id = %state.run_id(),
                steps = cursor.steps,
                duration_ms,
                reason = %f,
                "run failed"
            ),
        }

        RunReport {
            run_id: state.run_id().to_string(),
            phase: cursor.phase,
            steps: cursor.steps,
            state,
            failure,
            duration_ms,
        }
    }

    /// Walk the graph until no edge matches
    async fn traverse(
        &self,
        state: &mut WorkflowState,
        cursor: &mut Cursor,
        cancel: &CancellationToken,
    ) -> Result<(), RunFailure> {
        while let Some(idx) = cursor.node {
            if cursor.steps >= self.config.max_steps {
                return Err(RunFailure::MaxStepsExceeded {
                    limit: self.config.max_steps,
                });
            }
            cursor.steps += 1;

            let node = self.graph.node(idx);
            match self.execute_with_retry(node, state, cursor, cancel).await? {
                NodeOutcome::Suspend => {
                    tracing::info!(node = node.name(), step = cursor.steps, "run suspended");
                    cursor.phase = RunPhase::Suspended;
                    cursor.awaiting_input = true;
                    cursor.node = Some(self.graph.resume());
                }
                NodeOutcome::Continue => {
                    if cursor.awaiting_input {
                        cursor.phase = RunPhase::Running;
                        cursor.awaiting_input = false;
                    }
                    cursor.node = self.graph.next(idx, state);
                }
            }

            self.save_checkpoint(state, cursor);
        }
        Ok(())
    }

    /// Run one node against a scratch copy, committing only on success
    async fn execute_with_retry(
        &self,
        node: &Node,
        state: &mut WorkflowState,
        cursor: &Cursor,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, RunFailure> {
        let ctx = NodeContext {
            config: &self.config,
            cancel,
            awaiting_input: cursor.awaiting_input,
            step: cursor.steps,
        };

        let mut attempt = 0;
        loop {
            let mut scratch = state.clone();
            let mark = scratch.journal().len() as u64;
            let started = Instant::now();
            let result = node
                .execute(&mut scratch, &ctx)
                .await
                .and_then(|outcome| check_writes(node, &scratch, mark).map(|_| outcome));
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    *state = scratch;
                    state.telemetry_mut().record_execution(node.name(), elapsed_ms);
                    return Ok(outcome);
                }
                Err(err) => {
                    let telemetry = state.telemetry_mut();
                    telemetry.record_execution(node.name(), elapsed_ms);
                    telemetry.record_error(node.name(), err.to_string(), attempt + 1);

                    if err.is_retryable() && self.retry.allows_retry(attempt) {
                        let delay = self.retry.delay_for_attempt(attempt);
                        tracing::warn!(
                            node = node.name(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "node failed, retrying"
                        );
                        telemetry.record_retry();
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(match err {
                        NodeError::SourceClosed => RunFailure::SourceClosed {
                            node: node.name().to_string(),
                        },
                        err => RunFailure::NodeFailed {
                            node: node.name().to_string(),
                            message: err.to_string(),
                            attempts: attempt + 1,
                        },
                    });
                }
            }
        }
    }

    fn save_checkpoint(&self, state: &WorkflowState, cursor: &Cursor) {
        let Some(store) = &self.checkpointer else {
            return;
        };
        let checkpoint = Checkpoint {
            run_id: state.run_id().to_string(),
            step: cursor.steps,
            next_node: cursor.node.map(|idx| self.graph.node(idx).name().to_string()),
            awaiting_input: cursor.awaiting_input,
            phase: cursor.phase,
            state: state.clone(),
            saved_at: Utc::now(),
        };
        if let Err(e) = store.save(&checkpoint) {
            tracing::warn!(run_id = %state.run_id(), step = cursor.steps, error = %e, "failed to save checkpoint");
        }
    }
}

/// Reject changes to fields outside the node's write declaration
fn check_writes(node: &Node, state: &WorkflowState, mark: u64) -> Result<(), NodeError> {
    let writes = &node.capabilities().writes;
    for entry in state.journal_since(mark) {
        if let Some(field) = entry
            .change
            .touched_fields()
            .iter()
            .find(|f| !writes.permits(f))
        {
            return Err(NodeError::UndeclaredWrite {
                node: node.name().to_string(),
                field: field.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{MemoryCheckpointer, SqliteCheckpointer};
    use crate::graph::conversation_graph;
    use crate::node::{
        Action, BackgroundDispatcher, DecisionContext, DecisionError, DecisionProvider,
        IncomingListener, IntelligenceAgent, MessageSource, ParallelExecutor, QueueSource,
        StaticSource, TaskError, TaskHandler, TaskOutput,
    };
    use crate::state::{Field, Message, StateDelta, StateSlice, Task, TaskSpec};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Replays a fixed script of decisions, repeating the last one
    struct Scripted {
        script: Mutex<Vec<Result<Action, DecisionError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<Action, DecisionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DecisionProvider for Scripted {
        async fn decide(&self, _ctx: &DecisionContext<'_>) -> Result<Action, DecisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                match &script[0] {
                    Ok(action) => Ok(action.clone()),
                    Err(DecisionError::Transient(m)) => Err(DecisionError::Transient(m.clone())),
                    Err(DecisionError::Rejected(m)) => Err(DecisionError::Rejected(m.clone())),
                }
            }
        }
    }

    /// Responds once every delegated task has a result, otherwise delegates
    struct Delegator;

    #[async_trait]
    impl DecisionProvider for Delegator {
        async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Action, DecisionError> {
            if ctx.results.is_empty() {
                return Ok(Action::Delegate(vec![
                    TaskSpec::new("echo", json!({"value": "A", "delay_ms": 30})),
                    TaskSpec::new("echo", json!({"value": "B", "delay_ms": 1})),
                    TaskSpec::new("echo", json!({"fail": true})),
                ]));
            }
            Ok(Action::Respond(format!("{} results", ctx.results.len())))
        }
    }

    /// Waits until a second user message arrives
    struct NeedsTwo;

    #[async_trait]
    impl DecisionProvider for NeedsTwo {
        async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Action, DecisionError> {
            let users = ctx.history.iter().filter(|m| m.role == Role::User).count();
            if users >= 2 {
                Ok(Action::Respond("got both".into()))
            } else {
                Ok(Action::Wait)
            }
        }
    }

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        fn kind(&self) -> &str {
            "echo"
        }

        async fn run(&self, _slice: &StateSlice, task: &Task) -> Result<TaskOutput, TaskError> {
            if let Some(ms) = task.payload.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if task.payload.get("fail").is_some() {
                return Err(TaskError::Failed("boom".into()));
            }
            Ok(TaskOutput::new(task.payload["value"].clone()))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn graph_with(
        source: Arc<dyn MessageSource>,
        provider: Arc<dyn DecisionProvider>,
    ) -> Arc<WorkflowGraph> {
        Arc::new(
            conversation_graph(
                IncomingListener::new(source),
                IntelligenceAgent::new(provider),
                ParallelExecutor::new().with_handler(Arc::new(Echo)),
                BackgroundDispatcher::new(),
            )
            .build()
            .unwrap(),
        )
    }

    fn hello() -> WorkflowState {
        WorkflowState::new("run-1").with_messages([Message::user("m1", "hello")])
    }

    #[tokio::test]
    async fn test_respond_completes_run() {
        let provider = Scripted::new(vec![Ok(Action::Respond("hi".into()))]);
        let graph = graph_with(Arc::new(StaticSource::default()), provider.clone());
        let runner = WorkflowRunner::new(graph, config());

        let report = runner.run(hello()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.phase, RunPhase::Completed);
        assert_eq!(report.state.status(), Status::Completed);
        assert_eq!(report.steps, 3);
        assert!(report.failure.is_none());
        assert_eq!(report.reply(), Some("hi"));

        let history = report.state.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "m1");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_non_pending_start() {
        let provider = Scripted::new(vec![Ok(Action::Complete)]);
        let runner = WorkflowRunner::new(
            graph_with(Arc::new(StaticSource::default()), provider),
            config(),
        );
        let mut state = hello();
        state.transition("test", Status::Running).unwrap();

        let err = runner.run(state).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStart(Status::Running)));
    }

    #[tokio::test]
    async fn test_delegation_with_partial_failure() {
        let graph = graph_with(Arc::new(StaticSource::default()), Arc::new(Delegator));
        let runner = WorkflowRunner::new(
            graph,
            EngineConfig {
                failure_threshold: 2,
                ..config()
            },
        );

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(report.phase, RunPhase::Completed);
        let results = report.state.results();
        assert_eq!(results.ids(), vec!["task-1", "task-2", "task-3"]);
        assert_eq!(results.get("task-1").unwrap().value(), Some(&json!("A")));
        assert_eq!(results.get("task-2").unwrap().value(), Some(&json!("B")));
        assert!(!results.get("task-3").unwrap().is_success());

        let partial = report.state.metadata_value("parallel.partial_failure").unwrap();
        assert_eq!(partial["failed"], 1);
        assert_eq!(partial["total"], 3);
        assert_eq!(report.reply(), Some("3 results"));
        assert!(report.state.task_queue().is_empty());
    }

    #[tokio::test]
    async fn test_failure_threshold_fails_run() {
        let graph = graph_with(Arc::new(StaticSource::default()), Arc::new(Delegator));
        let runner = WorkflowRunner::new(graph, config());

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(report.phase, RunPhase::Failed);
        assert_eq!(report.state.status(), Status::Failed);
        assert!(matches!(report.failure, Some(RunFailure::Reported { .. })));
        assert_eq!(report.state.results().len(), 3);
    }

    #[tokio::test]
    async fn test_self_loop_hits_step_cap() {
        let graph = GraphBuilder::new()
            .node(Node::listener(
                "spin",
                IncomingListener::new(Arc::new(StaticSource::default())),
            ))
            .always("spin", "spin")
            .entry("spin")
            .build()
            .unwrap();
        let runner = WorkflowRunner::new(
            Arc::new(graph),
            EngineConfig {
                max_steps: 7,
                ..config()
            },
        );

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(report.steps, 7);
        assert_eq!(report.phase, RunPhase::Failed);
        assert_eq!(report.failure, Some(RunFailure::MaxStepsExceeded { limit: 7 }));
        assert_eq!(report.state.status(), Status::Failed);
        assert_eq!(report.state.failure_reason(), Some("max steps exceeded (7)"));
    }

    #[tokio::test]
    async fn test_end_without_terminal_status_is_incomplete() {
        let graph = GraphBuilder::new()
            .node(Node::listener(
                "only",
                IncomingListener::new(Arc::new(StaticSource::default())),
            ))
            .entry("only")
            .build()
            .unwrap();
        let runner = WorkflowRunner::new(Arc::new(graph), config());

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(
            report.failure,
            Some(RunFailure::Incomplete {
                status: Status::Running
            })
        );
        assert_eq!(report.state.status(), Status::Failed);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let provider = Scripted::new(vec![
            Err(DecisionError::Transient("busy".into())),
            Err(DecisionError::Transient("busy".into())),
            Ok(Action::Respond("finally".into())),
        ]);
        let graph = graph_with(Arc::new(StaticSource::default()), provider.clone());
        let runner =
            WorkflowRunner::new(graph, config()).with_retry_policy(RetryPolicy::immediate(2));

        let report = runner.run(hello()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.state.telemetry().retries, 2);
        assert_eq!(report.state.telemetry().errors.len(), 2);
        assert_eq!(report.state.telemetry().errors[1].attempt, 2);
        // Failed attempts leave no trace in the journal
        let from_intelligence = report
            .state
            .journal()
            .iter()
            .filter(|e| e.origin == "intelligence")
            .count();
        assert_eq!(from_intelligence, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let provider = Scripted::new(vec![Err(DecisionError::Transient("down".into()))]);
        let graph = graph_with(Arc::new(StaticSource::default()), provider.clone());
        let runner =
            WorkflowRunner::new(graph, config()).with_retry_policy(RetryPolicy::immediate(2));

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(report.phase, RunPhase::Failed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        match report.failure {
            Some(RunFailure::NodeFailed { node, attempts, .. }) => {
                assert_eq!(node, "intelligence");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let provider = Scripted::new(vec![Err(DecisionError::Rejected("nonsense".into()))]);
        let graph = graph_with(Arc::new(StaticSource::default()), provider.clone());
        let runner =
            WorkflowRunner::new(graph, config()).with_retry_policy(RetryPolicy::immediate(5));

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            report.failure,
            Some(RunFailure::NodeFailed { attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_suspend_and_resume_on_input() {
        let (sender, source) = QueueSource::channel();
        let graph = graph_with(Arc::new(source), Arc::new(NeedsTwo));
        let runner = WorkflowRunner::new(graph, config());

        let deliver = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(sender.send(Message::user("m2", "here is more")));
        };
        let (report, ()) = tokio::join!(runner.run(hello()), deliver);
        let report = report.unwrap();

        assert!(report.is_success());
        assert_eq!(report.reply(), Some("got both"));
        let ids: Vec<&str> = report.state.history().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "run-1-reply-3"]);
        // listener, intelligence(wait), listener, intelligence(respond), background
        assert_eq!(report.steps, 5);
    }

    #[tokio::test]
    async fn test_closed_source_fails_suspended_run() {
        let (sender, source) = QueueSource::channel();
        drop(sender);
        let graph = graph_with(Arc::new(source), Arc::new(NeedsTwo));
        let runner = WorkflowRunner::new(graph, config());

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(
            report.failure,
            Some(RunFailure::SourceClosed {
                node: "listener".into()
            })
        );
        assert_eq!(report.state.status(), Status::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_fails_run() {
        let (_sender, source) = QueueSource::channel();
        let graph = graph_with(Arc::new(source), Arc::new(NeedsTwo));
        let cancel = CancellationToken::new();
        let runner = WorkflowRunner::new(graph, config()).with_cancellation(cancel.clone());

        let trigger = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        };
        let (report, ()) = tokio::join!(runner.run(hello()), trigger);
        let report = report.unwrap();

        assert_eq!(report.phase, RunPhase::Failed);
        assert_eq!(report.failure, Some(RunFailure::Cancelled));
        assert_eq!(report.state.status(), Status::Failed);
        assert_eq!(report.state.failure_reason(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let (_sender, source) = QueueSource::channel();
        let graph = graph_with(Arc::new(source), Arc::new(NeedsTwo));
        let runner = WorkflowRunner::new(
            graph,
            EngineConfig {
                timeout_ms: Some(40),
                ..config()
            },
        );

        let report = runner.run(hello()).await.unwrap();

        assert_eq!(report.failure, Some(RunFailure::Timeout { timeout_ms: 40 }));
        assert_eq!(report.state.status(), Status::Failed);
    }

    /// Sleeps, then records that it ran to completion
    struct Slow {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskHandler for Slow {
        fn kind(&self) -> &str {
            "slow"
        }

        async fn run(&self, _slice: &StateSlice, _task: &Task) -> Result<TaskOutput, TaskError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(TaskOutput::new(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_timeout_stops_in_flight_tasks() {
        let finished = Arc::new(AtomicBool::new(false));
        let provider = Scripted::new(vec![Ok(Action::Delegate(vec![TaskSpec::new(
            "slow",
            Value::Null,
        )]))]);
        let graph = conversation_graph(
            IncomingListener::new(Arc::new(StaticSource::default())),
            IntelligenceAgent::new(provider),
            ParallelExecutor::new().with_handler(Arc::new(Slow {
                finished: finished.clone(),
            })),
            BackgroundDispatcher::new(),
        )
        .build()
        .unwrap();
        let runner = WorkflowRunner::new(
            Arc::new(graph),
            EngineConfig {
                timeout_ms: Some(30),
                ..config()
            },
        );

        let report = runner.run(hello()).await.unwrap();
        assert_eq!(report.failure, Some(RunFailure::Timeout { timeout_ms: 30 }));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
        // the caller's token stays usable for the next run
        assert!(!runner.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_undeclared_write_detected() {
        let node = Node::listener(
            "listener",
            IncomingListener::new(Arc::new(StaticSource::default())),
        );
        let mut state = hello();
        let mark = state.journal().len() as u64;

        state
            .update("listener", StateDelta::new().message(Message::user("m2", "ok")))
            .unwrap();
        assert!(check_writes(&node, &state, mark).is_ok());

        state
            .update("listener", StateDelta::new().set("sneaky", json!(true)))
            .unwrap();
        let err = check_writes(&node, &state, mark).unwrap_err();
        assert!(matches!(
            err,
            NodeError::UndeclaredWrite { ref field, .. } if *field == Field::metadata("sneaky")
        ));
    }

    #[tokio::test]
    async fn test_checkpoints_after_each_step() {
        let store = Arc::new(MemoryCheckpointer::new());
        let provider = Scripted::new(vec![Ok(Action::Respond("hi".into()))]);
        let graph = graph_with(Arc::new(StaticSource::default()), provider);
        let runner = WorkflowRunner::new(graph, config()).with_checkpointer(store.clone());

        runner.run(hello()).await.unwrap();

        let saved = store.history("run-1");
        // One per step plus the final one
        assert_eq!(saved.len(), 4);
        assert_eq!(saved[0].next_node.as_deref(), Some("intelligence"));
        let last = saved.last().unwrap();
        assert_eq!(last.phase, RunPhase::Completed);
        assert!(last.next_node.is_none());

        let again = runner.resume("run-1").await.unwrap();
        assert_eq!(again.phase, RunPhase::Completed);
        assert_eq!(again.steps, 3);
    }

    #[tokio::test]
    async fn test_resume_suspended_run_from_sqlite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.db");

        // First process: the run suspends and the source closes
        {
            let (sender, source) = QueueSource::channel();
            drop(sender);
            let store = Arc::new(SqliteCheckpointer::open(&path).unwrap());
            let graph = graph_with(Arc::new(source), Arc::new(NeedsTwo));
            let runner = WorkflowRunner::new(graph, config()).with_checkpointer(store);
            let report = runner.run(hello()).await.unwrap();
            assert_eq!(report.phase, RunPhase::Failed);
        }

        // The suspended checkpoint is the one before the failure; rewind to it
        let store = Arc::new(SqliteCheckpointer::open(&path).unwrap());
        let latest = store.load_latest("run-1").unwrap().unwrap();
        assert_eq!(latest.phase, RunPhase::Failed);
        store.delete("run-1").unwrap();

        let mut suspended_state = hello();
        suspended_state.transition("runner", Status::Running).unwrap();
        store
            .save(&Checkpoint {
                run_id: "run-1".into(),
                step: 2,
                next_node: Some("listener".into()),
                awaiting_input: true,
                phase: RunPhase::Suspended,
                state: suspended_state,
                saved_at: Utc::now(),
            })
            .unwrap();

        let source = StaticSource::new(vec![
            Message::user("m1", "hello"),
            Message::user("m2", "more"),
        ]);
        let source = Arc::new(Redelivering(source));
        let runner = WorkflowRunner::new(graph_with(source, Arc::new(NeedsTwo)), config())
            .with_checkpointer(store.clone());

        let report = runner.resume("run-1").await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.reply(), Some("got both"));
        assert_eq!(report.steps, 5);
        assert_eq!(
            store.load_latest("run-1").unwrap().unwrap().phase,
            RunPhase::Completed
        );
    }

    /// Static source whose blocking read returns the batch once
    struct Redelivering(StaticSource);

    #[async_trait]
    impl MessageSource for Redelivering {
        async fn poll(&self) -> Result<Vec<Message>, crate::node::SourceError> {
            self.0.poll().await
        }

        async fn recv(&self) -> Result<Option<Vec<Message>>, crate::node::SourceError> {
            Ok(Some(self.0.poll().await?))
        }
    }

    #[tokio::test]
    async fn test_resume_errors() {
        let provider = Scripted::new(vec![Ok(Action::Complete)]);
        let runner = WorkflowRunner::new(
            graph_with(Arc::new(StaticSource::default()), provider.clone()),
            config(),
        );
        assert!(matches!(
            runner.resume("nope").await.unwrap_err(),
            WorkflowError::NoCheckpointer
        ));

        let runner = runner.with_checkpointer(Arc::new(MemoryCheckpointer::new()));
        assert!(matches!(
            runner.resume("nope").await.unwrap_err(),
            WorkflowError::NoCheckpoint(_)
        ));
    }

    #[test]
    fn test_build_surfaces_validation() {
        let err = WorkflowRunner::build(GraphBuilder::new(), config())
            .err()
            .unwrap();
        assert!(matches!(err, WorkflowError::Validation(ValidationError::Empty)));
    }

    #[test]
    fn test_failure_serializes_with_kind() {
        let value = serde_json::to_value(RunFailure::NodeFailed {
            node: "parallel".into(),
            message: "boom".into(),
            attempts: 3,
        })
        .unwrap();
        assert_eq!(value["kind"], "node_failed");
        assert_eq!(value["attempts"], 3);
        assert_eq!(RunPhase::parse("suspended"), Some(RunPhase::Suspended));
        assert_eq!(RunPhase::parse("bogus"), None);
    }
}
