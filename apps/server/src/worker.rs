//! Quire - worker entry point
//!
//! Runs the job worker for the configured backend until SIGINT/SIGTERM.
//! Exits non-zero when a runner gives up, so the supervisor restarts it.

use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use quire::{
    config::Config,
    logging,
    workers::{spawn_workers, WorkerState},
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    if config.queue.backend == quire::config::QueueBackend::Memory {
        anyhow::bail!("queue.backend=memory only works with the embedded worker in quire-server");
    }

    let _telemetry_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging/telemetry")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        queue_backend = config.queue.backend.as_str(),
        channel = %config.queue.channel,
        "Starting quire worker"
    );

    let state = WorkerState::new(config)
        .await
        .context("Failed to initialize worker state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runners: FuturesUnordered<_> = spawn_workers(&state, Some(shutdown_rx))
        .into_iter()
        .collect();

    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        _ = shutdown_signal() => {}
        Some(joined) = runners.next() => {
            // A runner only returns on its own when it gave up.
            failure = Some(match joined {
                Ok(Ok(())) => anyhow::anyhow!("worker runner exited unexpectedly"),
                Ok(Err(e)) => anyhow::Error::new(e).context("worker runner failed"),
                Err(e) => anyhow::Error::new(e).context("worker runner panicked"),
            });
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = runners.next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Worker runner stopped with error"),
            Err(e) => tracing::error!(error = %e, "Worker runner task panicked"),
        }
    }

    logging::shutdown_telemetry();

    match failure {
        Some(e) => {
            tracing::error!(error = %e, "Worker exiting after fatal error");
            Err(e)
        }
        None => {
            tracing::info!("Worker shutdown complete");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler; waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, stopping worker...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, stopping worker...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received, stopping worker...");
}
