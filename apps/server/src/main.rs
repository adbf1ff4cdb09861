//! Quire - HTTP server entry point
//!
//! Serves the job API. The worker runs in the `quire-worker` binary unless
//! `workers.embedded` is set.

use anyhow::Context;
use quire::{api::create_router, background, config::Config, logging, state::AppState};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _telemetry_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging/telemetry")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.logging.deployment_environment,
        "Starting quire server"
    );

    let addr = config
        .socket_addr()
        .context("Failed to determine socket address")?;

    tracing::info!(
        queue_backend = config.queue.backend.as_str(),
        embedded_worker = config.workers.embedded,
        listen_addr = %addr,
        "Configuration loaded"
    );

    let state = AppState::new(config.clone())
        .await
        .context("Failed to initialize application state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = if config.workers.embedded {
        background::start_workers(config, state.backends.clone(), shutdown_rx)
            .context("Failed to start embedded worker")?
    } else {
        Vec::new()
    };

    let app = create_router(state);

    tracing::info!("Quire listening on http://{}", addr);
    tracing::info!("Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {addr}"))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop claiming before exit; in-flight attempts finish first.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Embedded worker stopped with error"),
            Err(e) => tracing::error!(error = %e, "Embedded worker task panicked"),
        }
    }

    if let Err(e) = served {
        tracing::error!(error = %e, "Server terminated unexpectedly");
        logging::shutdown_telemetry();
        return Err(e.into());
    }

    tracing::info!("Server shutdown complete");
    logging::shutdown_telemetry();

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
            tracing::info!("SIGINT received, starting graceful shutdown...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, starting graceful shutdown...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
