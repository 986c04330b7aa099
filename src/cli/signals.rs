//! Signal handling for graceful shutdown

use agent_graph::workflow::CancellationToken;

/// Cancel `token` on the first SIGINT or SIGTERM
pub async fn setup_signal_handlers(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv() => {
                eprintln!("\nReceived SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                eprintln!("\nReceived SIGTERM, shutting down...");
            }
        }
        token.cancel();
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            return;
        }
        eprintln!("\nReceived Ctrl+C, shutting down...");
        token.cancel();
    }
}
