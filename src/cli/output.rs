//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use agent_graph::workflow::RunReport;
use serde::Serialize;
use serde_json::Value;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            Self::Json
        } else if quiet {
            Self::Quiet
        } else {
            Self::Console
        }
    }
}

/// Events emitted while a run is driven from the CLI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    RunStart { run_id: String, nodes: usize },
    Background { agent: String, output: Value },
    Error { error: String },
    Info { message: String },
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);

    /// Write the final report
    fn report(&self, report: &RunReport);
}

/// Console output handler
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::RunStart { run_id, nodes } => {
                eprintln!("Running '{}' ({} nodes)", run_id, nodes);
            }
            OutputEvent::Background { agent, output } => {
                eprintln!("[{}] {}", agent, output);
            }
            OutputEvent::Error { error } => {
                eprintln!("Error: {}", error);
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
        }
    }

    fn report(&self, report: &RunReport) {
        if let Some(reply) = report.reply() {
            println!("{}", reply);
        }

        let duration = Self::format_duration(report.duration_ms);
        match &report.failure {
            None => eprintln!(
                "✓ Run {} ({} steps in {})",
                report.phase, report.steps, duration
            ),
            Some(failure) => eprintln!(
                "✗ Run {} after {} steps ({}): {}",
                report.phase, report.steps, duration, failure
            ),
        }

        if self.debug {
            for entry in report.state.journal() {
                eprintln!(
                    "[debug] #{} {} {:?}",
                    entry.seq,
                    entry.origin,
                    entry.change.touched_fields()
                );
            }
        }
    }
}

/// JSON output handler
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        match json {
            Ok(s) => println!("{}", s),
            Err(e) => tracing::error!(error = %e, "failed to serialize output"),
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        self.print_json(&event);
    }

    fn report(&self, report: &RunReport) {
        self.print_json(report);
    }
}

/// Prints only the final reply
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: OutputEvent) {}

    fn report(&self, report: &RunReport) {
        if let Some(reply) = report.reply() {
            println!("{}", reply);
        }
    }
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler::new(true)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_mode_from_flags() {
        assert_eq!(OutputMode::from_flags(true, true), OutputMode::Json);
        assert_eq!(OutputMode::from_flags(false, true), OutputMode::Quiet);
        assert_eq!(OutputMode::from_flags(false, false), OutputMode::Console);
    }

    #[test]
    fn test_console_format_duration() {
        assert_eq!(ConsoleHandler::format_duration(500), "500ms");
        assert_eq!(ConsoleHandler::format_duration(1000), "1.0s");
        assert_eq!(ConsoleHandler::format_duration(2500), "2.5s");
    }

    #[test]
    fn test_event_json_shape() {
        let event = OutputEvent::Background {
            agent: "follow_up".into(),
            output: json!({"follow_ups": []}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "background");
        assert_eq!(value["agent"], "follow_up");
    }
}
