//! Background workers for asynchronous processing
//!
//! The store runner reacts to notifications, sweeps for pending jobs whose
//! signal was lost, and reaps abandoned attempts. With a broker configured, a
//! broker runner consumes deliveries alongside it so jobs that fell back to
//! the store are still processed.

mod base;
mod broker_runner;
mod dispatcher;
mod generate_worker;
mod runner;
mod state;

pub use base::{HandlerRegistry, JobHandler};
pub use broker_runner::BrokerRunner;
pub use dispatcher::{DispatchOutcome, Dispatcher, SkipReason};
pub use generate_worker::{ContentGenerator, GenerateHandler, HttpContentGenerator};
pub use runner::{WorkerRunner, WorkerRunnerConfig};
pub use state::{default_handlers, WorkerState};

use crate::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawn the runners for the configured backend
pub fn spawn_workers(
    state: &WorkerState,
    shutdown: Option<watch::Receiver<bool>>,
) -> Vec<JoinHandle<Result<()>>> {
    let runner_config = WorkerRunnerConfig::from_config(&state.config);
    let mut handles = Vec::with_capacity(2);

    let dispatcher = Dispatcher::new(
        state.backends.store.clone(),
        state.handlers.clone(),
        state.config.queue.retry.clone(),
    );
    let runner = WorkerRunner::new(
        dispatcher,
        state.backends.notifier.clone(),
        runner_config.clone(),
    );
    let shutdown_rx = shutdown.clone();
    handles.push(tokio::spawn(async move { runner.run(shutdown_rx).await }));

    if let Some(broker) = &state.backends.broker {
        let runner = BrokerRunner::new(
            broker.clone(),
            state.handlers.clone(),
            state.config.broker.receive_wait(),
            runner_config,
        );
        handles.push(tokio::spawn(async move { runner.run(shutdown).await }));
    }

    handles
}
