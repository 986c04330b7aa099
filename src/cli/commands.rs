//! CLI command implementations

use super::output::{OutputEvent, OutputHandler};
use agent_graph::agents::{default_builder, default_dispatcher, default_graph};
use agent_graph::checkpoint::{Checkpointer, SqliteCheckpointer};
use agent_graph::config::AppConfig;
use agent_graph::graph::EdgeCondition;
use agent_graph::node::{BackgroundReport, MessageSource, QueueSource, StaticSource};
use agent_graph::state::{Message, WorkflowState};
use agent_graph::workflow::{CancellationToken, RunPhase, RunReport, WorkflowRunner};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long finished runs wait for background agents
const BACKGROUND_DRAIN: Duration = Duration::from_secs(5);

/// Open the configured SQLite checkpoint store
fn open_store(config: &AppConfig) -> Result<Arc<dyn Checkpointer>> {
    let path = config
        .checkpoint
        .resolved_path()
        .context("could not determine checkpoint database path")?;
    let store = SqliteCheckpointer::open(&path)
        .with_context(|| format!("opening checkpoint store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn new_run_id() -> String {
    format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S%3f"))
}

/// Runner over the default graph, plus the receiving end of background reports
fn build_runner(
    config: &AppConfig,
    source: Arc<dyn MessageSource>,
    cancel: CancellationToken,
) -> Result<(WorkflowRunner, mpsc::UnboundedReceiver<BackgroundReport>)> {
    let store = if config.checkpoint.enabled {
        Some(open_store(config)?)
    } else {
        None
    };

    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let dispatcher = default_dispatcher(store.clone()).with_reports(reports_tx);
    let graph = default_builder(config, source, dispatcher)
        .build()
        .context("building the conversation graph")?;

    let mut runner =
        WorkflowRunner::new(Arc::new(graph), config.engine.clone()).with_cancellation(cancel);
    if let Some(store) = store {
        runner = runner.with_checkpointer(store);
    }
    Ok((runner, reports_rx))
}

/// Wait for background agents, print their reports and the run report
async fn finish(
    runner: &WorkflowRunner,
    report: RunReport,
    mut reports: mpsc::UnboundedReceiver<BackgroundReport>,
    handler: &dyn OutputHandler,
) -> i32 {
    if !runner.graph().drain_background(BACKGROUND_DRAIN).await {
        tracing::warn!(run_id = %report.run_id, "background agents still running");
    }
    while let Ok(bg) = reports.try_recv() {
        handler.emit(OutputEvent::Background {
            agent: bg.agent,
            output: bg.output,
        });
    }

    handler.report(&report);
    if report.phase == RunPhase::Failed { 1 } else { 0 }
}

/// Run one message through the default conversation graph
pub async fn run_message(
    message: &str,
    config: &AppConfig,
    cancel: CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let source = Arc::new(StaticSource::new(vec![Message::user("m1", message)]));
    let (runner, reports) = build_runner(config, source, cancel)?;

    let run_id = new_run_id();
    handler.emit(OutputEvent::RunStart {
        run_id: run_id.clone(),
        nodes: runner.graph().len(),
    });

    let report = runner.run(WorkflowState::new(run_id)).await?;
    Ok(finish(&runner, report, reports, handler).await)
}

/// Continue a checkpointed run.
///
/// A run suspended for input needs `message`; without one the listener finds
/// its source closed and the run fails.
pub async fn resume_run(
    run_id: &str,
    message: Option<&str>,
    config: &AppConfig,
    cancel: CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let mut config = config.clone();
    config.checkpoint.enabled = true;

    let (sender, source) = QueueSource::channel();
    if let Some(text) = message {
        let id = format!("msg-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S%3f"));
        sender.send(Message::user(id, text));
    }
    // closed once the queued message has been read
    drop(sender);
    let (runner, reports) = build_runner(&config, Arc::new(source), cancel)?;

    let report = runner
        .resume(run_id)
        .await
        .with_context(|| format!("resuming run '{}'", run_id))?;
    Ok(finish(&runner, report, reports, handler).await)
}

fn describe(condition: &EdgeCondition) -> String {
    match condition {
        EdgeCondition::Always => "always".to_string(),
        EdgeCondition::Expr(expr) => format!("when {}", expr),
        EdgeCondition::Predicate(_) => "when <predicate>".to_string(),
    }
}

/// Check the configuration and build the default graph
pub fn validate(config: &AppConfig, handler: &dyn OutputHandler) -> i32 {
    if let Err(errors) = config.validate() {
        handler.emit(OutputEvent::Info {
            message: format!("✗ Configuration has {} error(s):", errors.len()),
        });
        for err in &errors {
            handler.emit(OutputEvent::Info {
                message: format!("  - {}", err),
            });
        }
        return 1;
    }

    match default_graph(config, Arc::new(StaticSource::default()), None) {
        Ok(graph) => {
            handler.emit(OutputEvent::Info {
                message: format!("✓ Graph is valid ({} nodes)", graph.len()),
            });
            for (idx, name) in graph.node_names().into_iter().enumerate() {
                for (target, condition) in graph.edges_from(idx) {
                    handler.emit(OutputEvent::Info {
                        message: format!("  {} -> {} ({})", name, target, describe(condition)),
                    });
                }
            }
            0
        }
        Err(e) => {
            handler.emit(OutputEvent::Error {
                error: format!("Graph validation failed: {}", e),
            });
            1
        }
    }
}

/// Print the effective configuration
pub fn show_config(config: &AppConfig) -> Result<i32> {
    print!("{}", config.to_toml()?);
    Ok(0)
}

/// List stored runs, or print the latest checkpoint of one run
pub fn checkpoints(
    config: &AppConfig,
    run_id: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let store = open_store(config)?;

    if let Some(run_id) = run_id {
        return match store.load_latest(run_id)? {
            Some(checkpoint) => {
                println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                Ok(0)
            }
            None => {
                handler.emit(OutputEvent::Error {
                    error: format!("no checkpoint for run '{}'", run_id),
                });
                Ok(1)
            }
        };
    }

    let runs = store.list_runs()?;
    if runs.is_empty() {
        println!("(no stored runs)");
    }
    for run in runs {
        println!(
            "{}  {:<9}  {:<9}  step {:<3}  {} checkpoint(s)  {}",
            run.run_id,
            run.phase,
            run.status,
            run.last_step,
            run.checkpoints,
            run.saved_at.to_rfc3339()
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::output::QuietHandler;
    use agent_graph::checkpoint::Checkpoint;
    use agent_graph::state::Status;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.engine.retry_delay_ms = 0;
        config.checkpoint.path = Some(dir.path().join("runs.db").display().to_string());
        config
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(validate(&AppConfig::default(), &QuietHandler), 0);
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = AppConfig::default();
        config.engine.max_steps = 0;
        assert_eq!(validate(&config, &QuietHandler), 1);
    }

    #[tokio::test]
    async fn test_run_message_checkpoints() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.checkpoint.enabled = true;

        let code = run_message(
            "how much does it cost?",
            &config,
            CancellationToken::new(),
            &QuietHandler,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let store = open_store(&config).unwrap();
        let runs = store.list_runs().unwrap();
        assert!(runs.iter().any(|r| r.phase == RunPhase::Completed));
        assert!(runs.iter().any(|r| r.run_id.ends_with(":transcript")));
    }

    #[tokio::test]
    async fn test_cancelled_run_exits_nonzero() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let code = run_message("hello", &test_config(&dir), cancel, &QuietHandler)
            .await
            .unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let dir = TempDir::new().unwrap();
        let result = resume_run(
            "missing",
            None,
            &test_config(&dir),
            CancellationToken::new(),
            &QuietHandler,
        )
        .await;
        assert!(result.is_err());
    }

    /// A checkpoint left by a run that suspended waiting for the user
    fn save_suspended(config: &AppConfig, run_id: &str) {
        let mut state = WorkflowState::new(run_id)
            .with_messages([Message::user("m1", "let me check and get back to you")]);
        state.transition("runner", Status::Running).unwrap();
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            step: 2,
            next_node: Some("listener".into()),
            awaiting_input: true,
            phase: RunPhase::Suspended,
            state,
            saved_at: chrono::Utc::now(),
        };
        open_store(config).unwrap().save(&checkpoint).unwrap();
    }

    #[tokio::test]
    async fn test_resume_delivers_message() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        save_suspended(&config, "run-wait");

        let code = resume_run(
            "run-wait",
            Some("ok, what does it cost?"),
            &config,
            CancellationToken::new(),
            &QuietHandler,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let latest = open_store(&config).unwrap().load_latest("run-wait").unwrap().unwrap();
        assert_eq!(latest.phase, RunPhase::Completed);
        let history = latest.state.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, "ok, what does it cost?");
        assert!(history[2].content.contains("$49"));
    }

    #[tokio::test]
    async fn test_resume_without_message_closes_source() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        save_suspended(&config, "run-wait");

        let code = resume_run("run-wait", None, &config, CancellationToken::new(), &QuietHandler)
            .await
            .unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn test_checkpoints_missing_run() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        assert_eq!(checkpoints(&config, Some("nope"), &QuietHandler).unwrap(), 1);
        assert_eq!(checkpoints(&config, None, &QuietHandler).unwrap(), 0);
    }
}
