//! Workflow execution engine
//!
//! This module handles:
//! - Graph traversal with first-match edge selection
//! - Node retries with exponential backoff
//! - Suspension, cancellation, timeouts and the step cap
//! - Checkpointing and resumption
//!
//! # Example
//!
//! ```ignore
//! use agent_graph::agents::default_graph;
//! use agent_graph::config::AppConfig;
//! use agent_graph::state::{Message, WorkflowState};
//! use agent_graph::workflow::WorkflowRunner;
//! use std::sync::Arc;
//!
//! let config = AppConfig::default();
//! let graph = default_graph(&config, source, None)?;
//! let runner = WorkflowRunner::new(Arc::new(graph), config.engine.clone());
//!
//! let state = WorkflowState::new("run-1").with_messages([Message::user("m1", "hello")]);
//! let report = runner.run(state).await?;
//!
//! if report.is_success() {
//!     println!("{}", report.reply().unwrap_or_default());
//! }
//! ```

mod cancel;
mod retry;
mod runner;

pub use cancel::{CancellationToken, with_cancellation};
pub use retry::RetryPolicy;
pub use runner::{RunFailure, RunPhase, RunReport, WorkflowError, WorkflowRunner};
