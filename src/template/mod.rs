//! Templating for response templates and edge expressions
//!
//! Both run on minijinja against a [`TemplateContext`] built from the
//! workflow state.
//!
//! # Example
//!
//! ```ignore
//! use agent_graph::template::{TemplateContext, TemplateEngine, evaluate_condition};
//!
//! let ctx = TemplateContext::from_state(&state);
//! let reply = TemplateEngine::new().render("Hi! You have {{ pending_tasks }} open tasks.", &ctx)?;
//! let go_parallel = evaluate_condition("pending_tasks > 0", &ctx)?;
//! ```

mod conditionals;
mod context;
mod engine;
mod errors;
mod filters;

pub use conditionals::{evaluate_condition, validate_expression};
pub use context::TemplateContext;
pub use engine::TemplateEngine;
pub use errors::{TemplateError, suggest_correction};
