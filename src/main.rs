mod cli;

use agent_graph::config::AppConfig;
use agent_graph::logging;
use agent_graph::workflow::CancellationToken;
use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::{OutputMode, create_handler};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agent-graph")]
#[command(about = "Multi-agent workflow engine - route conversation state through a graph of agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Extra configuration file, applied after the user and project layers
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one message through the conversation graph
    Run {
        /// The user message
        message: String,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        #[arg(long)]
        max_steps: Option<u32>,

        /// Parallel task workers
        #[arg(long)]
        workers: Option<usize>,

        #[arg(long)]
        retry_limit: Option<u32>,

        /// Failed tasks per batch that fail the run (0 disables)
        #[arg(long)]
        failure_threshold: Option<usize>,

        /// Save a checkpoint after every step
        #[arg(long)]
        checkpoint: bool,
    },

    /// Continue a checkpointed run
    Resume {
        run_id: String,

        /// Reply to deliver to a run suspended for input
        message: Option<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build the default graph and report problems
    Validate,

    /// Print the effective configuration as TOML
    Config,

    /// List stored runs, or show the latest checkpoint of one
    Checkpoints { run_id: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_guard = logging::init_logging(cli.debug, cli.quiet, cli.log_file.as_deref())?;

    let mut config = AppConfig::load(None, cli.config.as_deref())?;

    let exit_code = match cli.command {
        Commands::Run {
            message,
            json,
            max_steps,
            workers,
            retry_limit,
            failure_threshold,
            checkpoint,
        } => {
            if let Some(max_steps) = max_steps {
                config.engine.max_steps = max_steps;
            }
            if let Some(workers) = workers {
                config.engine.max_parallel_workers = workers;
            }
            if let Some(retry_limit) = retry_limit {
                config.engine.retry_limit = retry_limit;
            }
            if let Some(threshold) = failure_threshold {
                config.engine.failure_threshold = threshold;
            }
            if checkpoint {
                config.checkpoint.enabled = true;
            }

            let handler = create_handler(OutputMode::from_flags(json, cli.quiet), cli.debug);
            let cancel = CancellationToken::new();
            tokio::spawn(cli::setup_signal_handlers(cancel.clone()));
            cli::run_message(&message, &config, cancel, &*handler).await?
        }

        Commands::Resume {
            run_id,
            message,
            json,
        } => {
            let handler = create_handler(OutputMode::from_flags(json, cli.quiet), cli.debug);
            let cancel = CancellationToken::new();
            tokio::spawn(cli::setup_signal_handlers(cancel.clone()));
            cli::resume_run(&run_id, message.as_deref(), &config, cancel, &*handler).await?
        }

        Commands::Validate => {
            let handler = create_handler(OutputMode::from_flags(false, cli.quiet), cli.debug);
            cli::validate(&config, &*handler)
        }

        Commands::Config => cli::show_config(&config)?,

        Commands::Checkpoints { run_id } => {
            let handler = create_handler(OutputMode::from_flags(false, cli.quiet), cli.debug);
            cli::checkpoints(&config, run_id.as_deref(), &*handler)?
        }
    };

    if exit_code != 0 {
        // exit() skips destructors; flush the log file first
        drop(log_guard);
        std::process::exit(exit_code);
    }
    Ok(())
}
