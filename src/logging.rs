use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter for the requested verbosity; `RUST_LOG` wins when set
fn env_filter(debug: bool, quiet: bool) -> EnvFilter {
    let level = if debug {
        "agent_graph=debug"
    } else if quiet {
        "agent_graph=error"
    } else {
        "agent_graph=info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize logging based on output mode and debug flag
///
/// The returned guard flushes the log file on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging(
    debug: bool,
    quiet: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr);

    let Some(log_path) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter(debug, quiet))
            .with(fmt_layer)
            .try_init()?;
        return Ok(None);
    };

    let dir = log_path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
    }
    let file_name = log_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log path has no file name: {}", log_path.display()))?;

    let appender = tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(writer)
        .with_target(true)
        .with_line_number(true)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter(debug, quiet))
        .with(fmt_layer)
        .with(file_layer)
        .try_init()?;

    Ok(Some(guard))
}

/// Get default log file path for a run
pub fn default_log_path(run_id: &str) -> anyhow::Result<PathBuf> {
    let log_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("agent-graph")
        .join("logs");

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(log_dir.join(format!("{}-{}.log", run_id, timestamp)))
}
