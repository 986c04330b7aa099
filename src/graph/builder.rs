//! Graph builder with build-time validation

use super::edge::{Edge, EdgeCondition};
use super::error::ValidationError;
use super::{Route, WorkflowGraph};
use crate::node::{Node, NodeKind};
use crate::template::validate_expression;
use std::collections::HashMap;

/// Collects nodes and edges, then validates them into a [`WorkflowGraph`]
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry: Option<String>,
    resume: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Unconditional edge
    pub fn always(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge(Edge::always(from, to))
    }

    /// Edge guarded by a template expression
    pub fn when(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        self.edge(Edge::when(from, to, expr))
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Node a suspended run re-enters at; defaults to the entry
    pub fn resume_at(mut self, name: impl Into<String>) -> Self {
        self.resume = Some(name.into());
        self
    }

    pub fn build(self) -> Result<WorkflowGraph, ValidationError> {
        if self.nodes.is_empty() {
            return Err(ValidationError::Empty);
        }
        let entry_name = self.entry.ok_or(ValidationError::MissingEntry)?;

        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name().to_string(), i).is_some() {
                return Err(ValidationError::DuplicateNode(node.name().to_string()));
            }
        }

        let entry = *index
            .get(&entry_name)
            .ok_or_else(|| ValidationError::UnknownEntry(entry_name.clone()))?;
        let resume = match &self.resume {
            Some(name) => *index
                .get(name)
                .ok_or_else(|| ValidationError::UnknownResume(name.clone()))?,
            None => entry,
        };

        let mut routes: Vec<Vec<Route>> = (0..self.nodes.len()).map(|_| Vec::new()).collect();
        for edge in self.edges {
            let lookup = |name: &str| {
                index
                    .get(name)
                    .copied()
                    .ok_or_else(|| ValidationError::UnknownEdgeNode {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: name.to_string(),
                    })
            };
            let from = lookup(&edge.from)?;
            let target = lookup(&edge.to)?;

            if let EdgeCondition::Expr(expr) = &edge.condition {
                validate_expression(expr).map_err(|e| ValidationError::InvalidCondition {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    message: e.to_string(),
                })?;
            }

            routes[from].push(Route {
                target,
                condition: edge.condition,
            });
        }

        for node in &self.nodes {
            if let NodeKind::Parallel(executor) = node.kind() {
                executor.validate_handlers()?;
            }
        }

        let reachable = compute_reachable(entry, resume, &routes);
        if let Some(i) = (0..self.nodes.len()).find(|i| !reachable[*i]) {
            return Err(ValidationError::Unreachable(self.nodes[i].name().to_string()));
        }

        Ok(WorkflowGraph {
            nodes: self.nodes,
            index,
            routes,
            entry,
            resume,
        })
    }
}

/// Nodes reachable from the entry, or from the resume node
fn compute_reachable(entry: usize, resume: usize, routes: &[Vec<Route>]) -> Vec<bool> {
    let mut reachable = vec![false; routes.len()];
    let mut stack = vec![entry, resume];

    while let Some(current) = stack.pop() {
        if reachable[current] {
            continue;
        }
        reachable[current] = true;
        stack.extend(
            routes[current]
                .iter()
                .map(|r| r.target)
                .filter(|t| !reachable[*t]),
        );
    }

    reachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{
        BackgroundDispatcher, Capabilities, IncomingListener, ParallelExecutor, StaticSource,
        TaskError, TaskHandler, TaskOutput,
    };
    use crate::state::{Field, FieldSet, StateSlice, Task};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn listener(name: &str) -> Node {
        Node::listener(name, IncomingListener::new(Arc::new(StaticSource::default())))
    }

    fn background(name: &str) -> Node {
        Node::background(name, BackgroundDispatcher::new())
    }

    #[test]
    fn test_build_simple_graph() {
        let graph = GraphBuilder::new()
            .node(listener("listen"))
            .node(background("bg"))
            .always("listen", "bg")
            .entry("listen")
            .build()
            .unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.node(graph.entry()).name(), "listen");
        assert_eq!(graph.resume(), graph.entry());
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(GraphBuilder::new().build().unwrap_err(), ValidationError::Empty);
    }

    #[test]
    fn test_missing_and_unknown_entry() {
        let err = GraphBuilder::new().node(listener("a")).build().unwrap_err();
        assert_eq!(err, ValidationError::MissingEntry);

        let err = GraphBuilder::new()
            .node(listener("a"))
            .entry("b")
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownEntry("b".into()));
    }

    #[test]
    fn test_duplicate_node() {
        let err = GraphBuilder::new()
            .node(listener("a"))
            .node(background("a"))
            .entry("a")
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateNode("a".into()));
    }

    #[test]
    fn test_unknown_edge_target() {
        let err = GraphBuilder::new()
            .node(listener("a"))
            .always("a", "ghost")
            .entry("a")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownEdgeNode { missing, .. } if missing == "ghost"));
    }

    #[test]
    fn test_unreachable_node() {
        let err = GraphBuilder::new()
            .node(listener("a"))
            .node(background("island"))
            .entry("a")
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::Unreachable("island".into()));
    }

    #[test]
    fn test_invalid_expression() {
        let err = GraphBuilder::new()
            .node(listener("a"))
            .node(background("b"))
            .when("a", "b", "pending_tasks >")
            .entry("a")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidCondition { .. }));
    }

    struct Writer(&'static str);

    #[async_trait]
    impl TaskHandler for Writer {
        fn kind(&self) -> &str {
            self.0
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::new(FieldSet::new(), FieldSet::new().with(Field::metadata("summary")))
        }

        async fn run(&self, _slice: &StateSlice, _task: &Task) -> Result<TaskOutput, TaskError> {
            Ok(TaskOutput::default())
        }
    }

    #[test]
    fn test_conflicting_handler_writes() {
        let executor = ParallelExecutor::new()
            .with_handler(Arc::new(Writer("one")))
            .with_handler(Arc::new(Writer("two")));
        let err = GraphBuilder::new()
            .node(Node::parallel("p", executor))
            .entry("p")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::ConflictingWrites { .. }));
    }
}
