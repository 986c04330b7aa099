//! Incoming message listener
//!
//! Pulls messages from a [`MessageSource`] into the conversation history.
//! Ingestion is idempotent by message id, so sources with at-least-once
//! delivery never duplicate history entries.

use super::{Capabilities, NodeContext, NodeError, NodeOutcome};
use crate::state::{Field, FieldSet, Message, StateDelta, Task, WorkflowState};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

/// Errors from a message source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Temporarily unreachable; the listener may be retried
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl From<SourceError> for NodeError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(msg) => NodeError::Source(msg),
            SourceError::Other(msg) => NodeError::Fatal(msg),
        }
    }
}

/// Where inbound messages come from
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages available right now; never waits
    async fn poll(&self) -> Result<Vec<Message>, SourceError>;

    /// Wait for the next batch; `Ok(None)` once the source is closed
    async fn recv(&self) -> Result<Option<Vec<Message>>, SourceError>;
}

/// Channel-backed source fed through a [`QueueSender`]
pub struct QueueSource {
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

/// Producer half of a [`QueueSource`]
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl QueueSource {
    pub fn channel() -> (QueueSender, QueueSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueSender { tx }, QueueSource { rx: Mutex::new(rx) })
    }
}

impl QueueSender {
    /// Deliver a message; false once the source has been dropped
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

#[async_trait]
impl MessageSource for QueueSource {
    async fn poll(&self) -> Result<Vec<Message>, SourceError> {
        let mut rx = self.rx.lock().await;
        let mut batch = Vec::new();
        while let Ok(message) = rx.try_recv() {
            batch.push(message);
        }
        Ok(batch)
    }

    async fn recv(&self) -> Result<Option<Vec<Message>>, SourceError> {
        let mut rx = self.rx.lock().await;
        let Some(first) = rx.recv().await else {
            return Ok(None);
        };
        let mut batch = vec![first];
        while let Ok(message) = rx.try_recv() {
            batch.push(message);
        }
        Ok(Some(batch))
    }
}

/// A fixed batch, redelivered on every poll; closed for blocking reads
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    messages: Vec<Message>,
}

impl StaticSource {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl MessageSource for StaticSource {
    async fn poll(&self) -> Result<Vec<Message>, SourceError> {
        Ok(self.messages.clone())
    }

    async fn recv(&self) -> Result<Option<Vec<Message>>, SourceError> {
        Ok(None)
    }
}

/// Listener node
pub struct IncomingListener {
    source: Arc<dyn MessageSource>,
}

impl IncomingListener {
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self { source }
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            FieldSet::new().with(Field::History),
            FieldSet::new().with(Field::History).with(Field::TaskQueue),
        )
    }

    pub(crate) async fn execute(
        &self,
        name: &str,
        state: &mut WorkflowState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let fresh = if ctx.awaiting_input {
            loop {
                let Some(batch) = self.source.recv().await? else {
                    return Err(NodeError::SourceClosed);
                };
                let fresh = dedupe(state, batch);
                if !fresh.is_empty() {
                    break fresh;
                }
                tracing::debug!(node = name, "redelivered batch held no new messages");
            }
        } else {
            let batch = self.source.poll().await?;
            dedupe(state, batch)
        };

        if fresh.is_empty() {
            return Ok(NodeOutcome::Continue);
        }

        let mut delta = StateDelta::new();
        for message in fresh {
            if let Some(spec) = &message.task {
                let id = spec
                    .id
                    .clone()
                    .unwrap_or_else(|| state.next_task_id(delta.tasks.len()));
                delta.tasks.push(Task {
                    id,
                    kind: spec.kind.clone(),
                    payload: spec.payload.clone(),
                });
            }
            delta.history.push(message);
        }

        tracing::info!(
            node = name,
            messages = delta.history.len(),
            tasks = delta.tasks.len(),
            "ingested messages"
        );
        state.update(name, delta)?;
        Ok(NodeOutcome::Continue)
    }
}

/// Drop messages already ingested or repeated within the batch
fn dedupe(state: &WorkflowState, batch: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    batch
        .into_iter()
        .filter(|m| !state.is_ingested(&m.id) && seen.insert(m.id.clone()))
        .collect()
}
