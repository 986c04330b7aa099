//! CLI module for agent-graph
//!
//! This module provides:
//! - Command implementations (run, resume, validate, config, checkpoints)
//! - Output handlers (console, JSON, quiet)
//! - Signal handling for graceful shutdown

pub mod commands;
pub mod output;
pub mod signals;

pub use commands::{checkpoints, resume_run, run_message, show_config, validate};
pub use output::{OutputMode, create_handler};
pub use signals::setup_signal_handlers;
