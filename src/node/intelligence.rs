//! Decision-making node
//!
//! Asks an injected [`DecisionProvider`] what to do next and applies the
//! resulting [`Action`] to the state.

use super::cache::FastPath;
use super::{Capabilities, NodeContext, NodeError, NodeOutcome};
use crate::state::{
    Field, FieldSet, Message, Results, Role, StateDelta, Status, Task, TaskSpec, WorkflowState,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

const DECISION_KEY: &str = "decision";
const FAST_PATH_KEY: &str = "fast_path";

/// What the provider wants the workflow to do
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Reply to the user and complete the workflow
    Respond(String),
    /// Queue work for the parallel executor
    Delegate(Vec<TaskSpec>),
    /// Suspend until more input arrives
    Wait,
    Complete,
    Fail(String),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Respond(_) => "respond",
            Self::Delegate(_) => "delegate",
            Self::Wait => "wait",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
        }
    }
}

/// Read-only view a provider decides on
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub history: &'a [Message],
    pub pending_tasks: &'a [Task],
    pub results: &'a Results,
    pub metadata: &'a BTreeMap<String, Value>,
    pub step: u32,
}

impl<'a> DecisionContext<'a> {
    pub fn from_state(state: &'a WorkflowState, step: u32) -> Self {
        Self {
            history: state.history(),
            pending_tasks: state.task_queue(),
            results: state.results(),
            metadata: state.metadata(),
            step,
        }
    }

    pub fn last_user_message(&self) -> Option<&'a Message> {
        self.history.iter().rev().find(|m| m.role == Role::User)
    }

    /// Whether the latest history entry still awaits an answer
    pub fn awaiting_reply(&self) -> bool {
        self.history.last().is_some_and(|m| m.role == Role::User)
    }
}

#[derive(Debug, Error)]
pub enum DecisionError {
    /// Provider hiccup; the node is retried
    #[error("provider unavailable: {0}")]
    Transient(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),
}

impl From<DecisionError> for NodeError {
    fn from(err: DecisionError) -> Self {
        match err {
            DecisionError::Transient(msg) => NodeError::Transient(msg),
            DecisionError::Rejected(msg) => NodeError::Decision(msg),
        }
    }
}

/// Source of decisions, e.g. a model client or a rule table
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str {
        "provider"
    }

    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Action, DecisionError>;
}

/// Intelligence node
pub struct IntelligenceAgent {
    provider: Arc<dyn DecisionProvider>,
    fast_path: Option<FastPath>,
}

impl IntelligenceAgent {
    pub fn new(provider: Arc<dyn DecisionProvider>) -> Self {
        Self {
            provider,
            fast_path: None,
        }
    }

    pub fn with_fast_path(mut self, fast_path: FastPath) -> Self {
        self.fast_path = Some(fast_path);
        self
    }

    pub fn fast_path(&self) -> Option<&FastPath> {
        self.fast_path.as_ref()
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            FieldSet::new()
                .with(Field::History)
                .with(Field::TaskQueue)
                .with(Field::Results)
                .with(Field::AnyMetadata),
            FieldSet::new()
                .with(Field::History)
                .with(Field::TaskQueue)
                .with(Field::Status)
                .with(Field::metadata(DECISION_KEY))
                .with(Field::metadata(FAST_PATH_KEY)),
        )
    }

    pub(crate) async fn execute(
        &self,
        name: &str,
        state: &mut WorkflowState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        if let Some(fast_path) = &self.fast_path {
            let hit = fast_path
                .lookup(state)
                .map_err(|e| NodeError::fatal(format!("fast path template: {}", e)))?;
            if let Some((source, reply)) = hit {
                tracing::info!(node = name, source = source.as_str(), "answered from fast path");
                let delta = StateDelta::new().set(FAST_PATH_KEY, json!(source.as_str()));
                state.update(name, delta)?;
                return self.apply(name, state, Action::Respond(reply), ctx.step);
            }
        }

        let action = {
            let decision_ctx = DecisionContext::from_state(state, ctx.step);
            self.provider.decide(&decision_ctx).await?
        };
        tracing::info!(
            node = name,
            provider = self.provider.name(),
            action = action.name(),
            "decision made"
        );

        if let (Some(fast_path), Action::Respond(reply)) = (&self.fast_path, &action) {
            if let Some(question) = state.last_message().filter(|m| m.role == Role::User) {
                fast_path.cache().insert(&question.content, reply.clone());
            }
        }

        self.apply(name, state, action, ctx.step)
    }

    fn apply(
        &self,
        name: &str,
        state: &mut WorkflowState,
        action: Action,
        step: u32,
    ) -> Result<NodeOutcome, NodeError> {
        let mut record = json!({ "action": action.name(), "step": step });

        match action {
            Action::Respond(text) => {
                let reply = Message::assistant(
                    format!("{}-reply-{}", state.run_id(), state.history().len() + 1),
                    text,
                );
                state.update(name, StateDelta::new().message(reply).set(DECISION_KEY, record))?;
                state.transition(name, Status::Completed)?;
                Ok(NodeOutcome::Continue)
            }
            Action::Delegate(specs) => {
                if specs.is_empty() && state.task_queue().is_empty() {
                    return Err(NodeError::Decision("delegation without tasks".into()));
                }
                let tasks: Vec<Task> = specs
                    .into_iter()
                    .enumerate()
                    .map(|(i, spec)| Task {
                        id: spec.id.unwrap_or_else(|| state.next_task_id(i)),
                        kind: spec.kind,
                        payload: spec.payload,
                    })
                    .collect();
                record["tasks"] = json!(tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>());
                let delta = StateDelta {
                    tasks,
                    ..Default::default()
                }
                .set(DECISION_KEY, record);
                state.update(name, delta)?;
                Ok(NodeOutcome::Continue)
            }
            Action::Wait => {
                state.update(name, StateDelta::new().set(DECISION_KEY, record))?;
                Ok(NodeOutcome::Suspend)
            }
            Action::Complete => {
                state.update(name, StateDelta::new().set(DECISION_KEY, record))?;
                state.transition(name, Status::Completed)?;
                Ok(NodeOutcome::Continue)
            }
            Action::Fail(reason) => {
                record["reason"] = json!(reason);
                state.update(name, StateDelta::new().set(DECISION_KEY, record))?;
                state.fail(name, reason)?;
                Ok(NodeOutcome::Continue)
            }
        }
    }
}
