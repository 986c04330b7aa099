//! Processing units of a workflow graph
//!
//! A [`Node`] pairs a name and a capability declaration with one of the
//! [`NodeKind`] variants. The runner calls [`Node::execute`] with exclusive
//! access to the state for the duration of the call.

pub mod background;
pub mod cache;
pub mod intelligence;
pub mod listener;
pub mod parallel;

mod error;
mod metrics;

pub use background::{BackgroundAgent, BackgroundDispatcher, BackgroundError, BackgroundReport};
pub use cache::{FastPath, FastPathSource, ResponseCache};
pub use error::NodeError;
pub use intelligence::{Action, DecisionContext, DecisionError, DecisionProvider, IntelligenceAgent};
pub use listener::{IncomingListener, MessageSource, QueueSender, QueueSource, SourceError, StaticSource};
pub use metrics::{MetricsSnapshot, NodeMetrics};
pub use parallel::{ParallelExecutor, PartialFailure, TaskError, TaskHandler, TaskOutput};

use crate::config::EngineConfig;
use crate::state::{FieldSet, WorkflowState};
use crate::workflow::CancellationToken;
use std::time::Instant;

/// What the runner should do after a node returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Follow the outgoing edges
    Continue,
    /// Park the run until the listener receives input
    Suspend,
}

/// Per-execution context handed to a node
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub config: &'a EngineConfig,
    pub cancel: &'a CancellationToken,
    /// The run is resuming from suspension; listeners block for input
    pub awaiting_input: bool,
    pub step: u32,
}

/// Fields a node may read and write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    pub reads: FieldSet,
    pub writes: FieldSet,
}

impl Capabilities {
    pub fn new(reads: FieldSet, writes: FieldSet) -> Self {
        Self { reads, writes }
    }
}

/// The closed set of node variants
pub enum NodeKind {
    Listener(IncomingListener),
    Intelligence(IntelligenceAgent),
    Parallel(ParallelExecutor),
    Background(BackgroundDispatcher),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Listener(_) => "listener",
            Self::Intelligence(_) => "intelligence",
            Self::Parallel(_) => "parallel",
            Self::Background(_) => "background",
        }
    }

    fn capabilities(&self) -> Capabilities {
        match self {
            Self::Listener(n) => n.capabilities(),
            Self::Intelligence(n) => n.capabilities(),
            Self::Parallel(n) => n.capabilities(),
            Self::Background(n) => n.capabilities(),
        }
    }
}

/// A named, immutable processing unit
pub struct Node {
    name: String,
    kind: NodeKind,
    caps: Capabilities,
    metrics: NodeMetrics,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        let caps = kind.capabilities();
        Self {
            name: name.into(),
            kind,
            caps,
            metrics: NodeMetrics::new(),
        }
    }

    pub fn listener(name: impl Into<String>, listener: IncomingListener) -> Self {
        Self::new(name, NodeKind::Listener(listener))
    }

    pub fn intelligence(name: impl Into<String>, agent: IntelligenceAgent) -> Self {
        Self::new(name, NodeKind::Intelligence(agent))
    }

    pub fn parallel(name: impl Into<String>, executor: ParallelExecutor) -> Self {
        Self::new(name, NodeKind::Parallel(executor))
    }

    pub fn background(name: impl Into<String>, dispatcher: BackgroundDispatcher) -> Self {
        Self::new(name, NodeKind::Background(dispatcher))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Run the node once against the state
    pub async fn execute(
        &self,
        state: &mut WorkflowState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let started = Instant::now();
        tracing::debug!(node = %self.name, kind = self.kind.label(), step = ctx.step, "executing node");

        let result = match &self.kind {
            NodeKind::Listener(n) => n.execute(&self.name, state, ctx).await,
            NodeKind::Intelligence(n) => n.execute(&self.name, state, ctx).await,
            NodeKind::Parallel(n) => n.execute(&self.name, state, ctx).await,
            NodeKind::Background(n) => n.execute(&self.name, state, ctx).await,
        };

        let elapsed = started.elapsed();
        self.metrics.record(elapsed, result.is_ok());
        match &result {
            Ok(outcome) => tracing::debug!(
                node = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                ?outcome,
                "node finished"
            ),
            Err(e) => tracing::warn!(
                node = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "node failed"
            ),
        }
        result
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("caps", &self.caps)
            .finish()
    }
}
