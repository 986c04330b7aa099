//! Detached background agents
//!
//! The dispatcher hands every agent the same read-only snapshot and returns
//! without waiting. Agent outcomes never reach the workflow state; results go
//! to an optional side channel and failures are logged.

use super::{Capabilities, NodeContext, NodeError, NodeOutcome};
use crate::checkpoint::CheckpointError;
use crate::state::{Field, FieldSet, StateDelta, WorkflowState};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DISPATCHED_KEY: &str = "background.dispatched";

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Output of a finished background agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackgroundReport {
    pub agent: String,
    pub run_id: String,
    pub output: Value,
}

/// Auxiliary processor run outside the main traversal
#[async_trait]
pub trait BackgroundAgent: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(Some(_))` is forwarded to the side channel
    async fn run(&self, snapshot: Arc<WorkflowState>) -> Result<Option<Value>, BackgroundError>;
}

/// Background dispatch node
#[derive(Default)]
pub struct BackgroundDispatcher {
    agents: Vec<Arc<dyn BackgroundAgent>>,
    reports: Option<mpsc::UnboundedSender<BackgroundReport>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: Arc<dyn BackgroundAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Forward agent outputs to `reports`
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<BackgroundReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            FieldSet::all(),
            FieldSet::new().with(Field::metadata(DISPATCHED_KEY)),
        )
    }

    pub(crate) async fn execute(
        &self,
        name: &str,
        state: &mut WorkflowState,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        if self.agents.is_empty() {
            return Ok(NodeOutcome::Continue);
        }

        let snapshot = Arc::new(state.clone());
        let mut handles = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            handles.push(self.spawn(agent.clone(), snapshot.clone()));
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.retain(|h| !h.is_finished());
            in_flight.extend(handles);
        }

        tracing::info!(node = name, agents = self.agents.len(), "dispatched background agents");
        state.update(
            name,
            StateDelta::new().set(DISPATCHED_KEY, json!(self.agent_names())),
        )?;
        Ok(NodeOutcome::Continue)
    }

    fn spawn(&self, agent: Arc<dyn BackgroundAgent>, snapshot: Arc<WorkflowState>) -> JoinHandle<()> {
        let reports = self.reports.clone();
        let run_id = snapshot.run_id().to_string();
        let agent_name = agent.name().to_string();

        tokio::spawn(async move {
            // Inner task so a panicking agent is observed rather than lost
            let work = tokio::spawn(async move { agent.run(snapshot).await });
            match work.await {
                Ok(Ok(Some(output))) => {
                    tracing::debug!(agent = %agent_name, run_id = %run_id, "background agent finished");
                    if let Some(tx) = reports {
                        let _ = tx.send(BackgroundReport {
                            agent: agent_name,
                            run_id,
                            output,
                        });
                    }
                }
                Ok(Ok(None)) => {
                    tracing::debug!(agent = %agent_name, run_id = %run_id, "background agent finished");
                }
                Ok(Err(e)) => {
                    tracing::warn!(agent = %agent_name, run_id = %run_id, error = %e, "background agent failed");
                }
                Err(e) => {
                    tracing::warn!(agent = %agent_name, run_id = %run_id, error = %e, "background agent panicked");
                }
            }
        })
    }

    /// Dispatched agents not yet known to have finished
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for dispatched agents; true when all finished within `timeout`
    pub async fn drain(&self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let deadline = tokio::time::Instant::now() + timeout;
        let mut all_finished = true;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                all_finished = false;
            }
        }
        all_finished
    }
}
