//! Workflow graph: nodes, conditional edges and the validated topology
//!
//! Graphs are assembled with [`GraphBuilder`] and are immutable once built.
//! Outgoing edges are evaluated in declaration order and the first one whose
//! condition holds is taken; a node with no matching edge ends the run.

mod builder;
mod edge;
mod error;

pub use builder::GraphBuilder;
pub use edge::{Edge, EdgeCondition, PredicateFn};
pub use error::ValidationError;

use crate::node::{
    BackgroundDispatcher, IncomingListener, IntelligenceAgent, MetricsSnapshot, Node, NodeKind,
    ParallelExecutor,
};
use crate::state::WorkflowState;
use std::collections::HashMap;
use std::time::Duration;

pub const LISTENER: &str = "listener";
pub const INTELLIGENCE: &str = "intelligence";
pub const PARALLEL: &str = "parallel";
pub const BACKGROUND: &str = "background";

/// Resolved outgoing edge
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) target: usize,
    pub(crate) condition: EdgeCondition,
}

/// A validated, immutable graph
#[derive(Debug)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    routes: Vec<Vec<Route>>,
    entry: usize,
    resume: usize,
}

impl WorkflowGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn resume(&self) -> usize {
        self.resume
    }

    /// Pick the successor of `idx`; `None` means END
    ///
    /// A condition that fails to evaluate is logged and treated as false.
    pub fn next(&self, idx: usize, state: &WorkflowState) -> Option<usize> {
        let from = self.nodes[idx].name();
        for route in &self.routes[idx] {
            match route.condition.evaluate(state) {
                Ok(true) => return Some(route.target),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    from,
                    to = self.nodes[route.target].name(),
                    error = %e,
                    "edge condition failed to evaluate"
                ),
            }
        }
        None
    }

    /// Outgoing edges of a node as (target name, condition)
    pub fn edges_from(&self, idx: usize) -> Vec<(&str, &EdgeCondition)> {
        self.routes[idx]
            .iter()
            .map(|r| (self.nodes[r.target].name(), &r.condition))
            .collect()
    }

    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.nodes
            .iter()
            .map(|n| (n.name().to_string(), n.metrics().snapshot()))
            .collect()
    }

    pub fn reset_metrics(&self) {
        for node in &self.nodes {
            node.metrics().reset();
        }
    }

    /// Wait for background agents dispatched by any node
    pub async fn drain_background(&self, timeout: Duration) -> bool {
        let mut all_finished = true;
        for node in &self.nodes {
            if let NodeKind::Background(dispatcher) = node.kind() {
                all_finished &= dispatcher.drain(timeout).await;
            }
        }
        all_finished
    }
}

/// The conversational topology
///
/// ```text
/// listener -> intelligence
/// intelligence -> parallel     when tasks are pending and the run is live
/// intelligence -> background   otherwise
/// parallel -> intelligence     while the run is live
/// parallel -> background       otherwise
/// background -> END
/// ```
pub fn conversation_graph(
    listener: IncomingListener,
    intelligence: IntelligenceAgent,
    parallel: ParallelExecutor,
    background: BackgroundDispatcher,
) -> GraphBuilder {
    GraphBuilder::new()
        .node(Node::listener(LISTENER, listener))
        .node(Node::intelligence(INTELLIGENCE, intelligence))
        .node(Node::parallel(PARALLEL, parallel))
        .node(Node::background(BACKGROUND, background))
        .always(LISTENER, INTELLIGENCE)
        .when(
            INTELLIGENCE,
            PARALLEL,
            "pending_tasks > 0 and status == 'running'",
        )
        .always(INTELLIGENCE, BACKGROUND)
        .when(PARALLEL, INTELLIGENCE, "status == 'running'")
        .always(PARALLEL, BACKGROUND)
        .entry(LISTENER)
        .resume_at(LISTENER)
}
