//! Edges between nodes and the conditions that select them

use crate::state::WorkflowState;
use crate::template::{TemplateContext, TemplateError, evaluate_condition};
use std::fmt;
use std::sync::Arc;

/// Predicate over the state for code-defined routing
pub type PredicateFn = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// When an edge is taken
#[derive(Clone)]
pub enum EdgeCondition {
    Always,
    /// Template expression over the state view, e.g. `pending_tasks > 0`
    Expr(String),
    Predicate(PredicateFn),
}

impl EdgeCondition {
    pub fn evaluate(&self, state: &WorkflowState) -> Result<bool, TemplateError> {
        match self {
            Self::Always => Ok(true),
            Self::Expr(expr) => evaluate_condition(expr, &TemplateContext::from_state(state)),
            Self::Predicate(f) => Ok(f(state)),
        }
    }
}

impl fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            Self::Predicate(_) => f.write_str("Predicate(<fn>)"),
        }
    }
}

/// A directed edge, evaluated in declaration order per source node
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: EdgeCondition,
}

impl Edge {
    /// Unconditional edge
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        }
    }

    /// Edge taken when the expression is truthy
    pub fn when(from: impl Into<String>, to: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Expr(expr.into()),
        }
    }

    /// Edge taken when the predicate holds
    pub fn predicate<F>(from: impl Into<String>, to: impl Into<String>, f: F) -> Self
    where
        F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Predicate(Arc::new(f)),
        }
    }
}
