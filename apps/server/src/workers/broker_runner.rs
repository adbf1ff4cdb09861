//! Worker loop for the alternate broker transport

use super::base::HandlerRegistry;
use super::runner::{shutdown_changed, shutdown_requested, Backoff, WorkerRunnerConfig};
use crate::broker::{Broker, FailureDisposition};
use crate::metrics::JOBS_PROCESSED_TOTAL;
use crate::queue::Job;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::Instrument;

/// Tries at recording a completion before the job goes down the failure path
const COMPLETE_ATTEMPTS: u32 = 3;

pub struct BrokerRunner {
    broker: Arc<dyn Broker>,
    handlers: HandlerRegistry,
    receive_wait: Duration,
    config: WorkerRunnerConfig,
}

impl BrokerRunner {
    pub fn new(
        broker: Arc<dyn Broker>,
        handlers: HandlerRegistry,
        receive_wait: Duration,
        config: WorkerRunnerConfig,
    ) -> Self {
        Self {
            broker,
            handlers,
            receive_wait,
            config,
        }
    }

    /// Consume deliveries until shutdown.
    ///
    /// Shutdown is observed between deliveries, so it can take up to
    /// `receive_wait` to take effect. Every `reaper_interval` the runner also
    /// returns deliveries unacknowledged for `stale_after` to the queue.
    pub async fn run(&self, mut shutdown: Option<watch::Receiver<bool>>) -> Result<()> {
        tracing::info!(
            broker = self.broker.name(),
            reaper_interval = ?self.config.reaper_interval,
            stale_after = ?self.config.stale_after,
            "Broker worker starting"
        );
        let mut backoff = Backoff::new(&self.config);
        let mut next_reap = Instant::now();

        loop {
            if shutdown_requested(&shutdown) {
                tracing::info!(broker = self.broker.name(), "Broker worker shutdown requested, stopping...");
                return Ok(());
            }

            if Instant::now() >= next_reap {
                self.reap().await;
                next_reap = Instant::now() + self.config.reaper_interval;
            }

            match self.broker.receive(self.receive_wait).await {
                Ok(Some(job)) => {
                    backoff.reset();
                    let span = tracing::info_span!(
                        "broker_job",
                        job.id = %job.id,
                        job.type = %job.job_type,
                        attempts = job.attempts
                    );
                    self.process(job).instrument(span).await;
                }
                Ok(None) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        broker = self.broker.name(),
                        error = %e,
                        "Failed to receive from broker (retrying in {:?})",
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_changed(&mut shutdown) => {}
                    }
                }
            }
        }
    }

    async fn reap(&self) {
        match self.broker.requeue_stale(self.config.stale_after).await {
            Ok(0) => {}
            Ok(count) => tracing::warn!(count, "Requeued stale broker deliveries"),
            Err(e) => tracing::error!(error = %e, "Reaper failed to requeue stale deliveries"),
        }
    }

    async fn process(&self, job: Job) {
        tracing::info!("Processing broker job");

        match self.handlers.execute(&job).await {
            Ok(result) => self.record_completion(&job, result).await,
            Err(error) => self.record_failure(&job, &error).await,
        }
    }

    async fn record_completion(&self, job: &Job, result: Value) {
        let mut delay = self.config.reconnect_initial;
        let mut last_error = String::new();

        for attempt in 1..=COMPLETE_ATTEMPTS {
            match self.broker.complete(job, result.clone()).await {
                Ok(_) => {
                    JOBS_PROCESSED_TOTAL
                        .with_label_values(&[job.job_type.as_str(), "completed"])
                        .inc();
                    tracing::info!("Job completed");
                    return;
                }
                Err(Error::DeliveryReleased(_)) => {
                    tracing::warn!("Delivery was requeued while running; discarding result");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Failed to record job completion");
                    last_error = e.to_string();
                }
            }
            if attempt < COMPLETE_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.config.reconnect_max);
            }
        }

        tracing::error!(error = %last_error, "Giving up on recording completion; handing job to the retry path");
        self.record_failure(job, &format!("failed to record completion: {last_error}"))
            .await;
    }

    async fn record_failure(&self, job: &Job, error: &str) {
        match self.broker.fail(job, error).await {
            Ok(FailureDisposition::Retry { delay, attempts }) => {
                JOBS_PROCESSED_TOTAL
                    .with_label_values(&[job.job_type.as_str(), "retrying"])
                    .inc();
                tracing::warn!(attempts, error = %error, "Job failed; retry in {:?}", delay);
            }
            Ok(FailureDisposition::DeadLettered { attempts }) => {
                JOBS_PROCESSED_TOTAL
                    .with_label_values(&[job.job_type.as_str(), "failed"])
                    .inc();
                tracing::error!(attempts, error = %error, "Job dead-lettered");
            }
            Err(Error::DeliveryReleased(_)) => {
                tracing::warn!(error = %error, "Delivery was requeued while running; discarding failure")
            }
            // Still held by the broker, so the reaper returns it to the queue
            Err(e) => {
                tracing::error!(error = %e, handler_error = %error, "Failed to record job failure")
            }
        }
    }
}
