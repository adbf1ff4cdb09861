//! Background tasks and worker management
//!
//! Runs the worker inside the server process when `workers.embedded` is set.
//! Standalone deployments use the `quire-worker` binary instead.

use crate::{
    state::QueueBackends,
    workers::{spawn_workers, WorkerState},
    Config, Result,
};
use tokio::{sync::watch, task::JoinHandle};

/// Start the embedded worker on the server's own backends
pub fn start_workers(
    config: Config,
    backends: QueueBackends,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<Result<()>>>> {
    tracing::info!("Initializing embedded worker...");

    let worker_state = WorkerState::with_backends(config, backends)?;
    let handles = spawn_workers(&worker_state, Some(shutdown));

    tracing::info!(runners = handles.len(), "Embedded worker started and listening for jobs");
    Ok(handles)
}
