//! Graph-driven multi-agent workflow engine
//!
//! A [`graph::WorkflowGraph`] wires listener, intelligence, parallel and
//! background nodes together; [`workflow::WorkflowRunner`] drives a
//! [`state::WorkflowState`] through it one step at a time.

pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod graph;
pub mod logging;
pub mod node;
pub mod state;
pub mod template;
pub mod workflow;
