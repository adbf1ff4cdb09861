//! Worker loop driving the dispatcher from notifications, sweeps, and the reaper

use super::dispatcher::{DispatchOutcome, Dispatcher};
use crate::metrics::{JOBS_QUEUE_SIZE, JOBS_REAPED_TOTAL, JOBS_SWEEP_RECOVERED_TOTAL};
use crate::queue::{JobStatus, NotificationStream, Notifier};
use crate::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{interval, sleep_until, Duration, Instant, MissedTickBehavior},
};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct WorkerRunnerConfig {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_jitter_ratio: f64,
    pub sweep_interval: Duration,
    pub pending_grace: Duration,
    pub reaper_interval: Duration,
    pub stale_after: Duration,
    pub batch_size: i64,
    pub max_consecutive_store_errors: u32,
}

impl WorkerRunnerConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            reconnect_initial: Duration::from_secs(config.workers.reconnect_initial_seconds),
            reconnect_max: Duration::from_secs(config.workers.reconnect_max_seconds),
            reconnect_jitter_ratio: config.workers.reconnect_jitter_ratio,
            sweep_interval: config.queue.sweep_interval(),
            pending_grace: config.queue.pending_grace(),
            reaper_interval: config.queue.reaper_interval(),
            stale_after: config.queue.stale_after(),
            batch_size: config.queue.sweep_batch_size,
            max_consecutive_store_errors: config.workers.max_consecutive_store_errors,
        }
    }
}

impl Default for WorkerRunnerConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter_ratio: 0.2,
            sweep_interval: Duration::from_secs(30),
            pending_grace: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(900),
            batch_size: 100,
            max_consecutive_store_errors: 10,
        }
    }
}

pub(crate) fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }

    // Deterministic-enough jitter source without adding a new RNG dependency.
    let bytes = *Uuid::new_v4().as_bytes();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    let unit = (u64::from_le_bytes(head) as f64) / (u64::MAX as f64); // [0,1]
    let signed = unit * 2.0 - 1.0; // [-1,1]
    let factor = (1.0 + signed * jitter_ratio).max(0.0);
    base.mul_f64(factor)
}

/// Exponential reconnect delay with jitter
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: &WorkerRunnerConfig) -> Self {
        Self {
            initial: config.reconnect_initial,
            max: config.reconnect_max,
            jitter_ratio: config.reconnect_jitter_ratio,
            current: config.reconnect_initial,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Next wait, doubling the base for the call after
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = jittered_duration(self.current, self.jitter_ratio);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

pub(crate) fn shutdown_requested(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves when the shutdown flag changes; never resolves without a receiver
pub(crate) async fn shutdown_changed(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown.as_mut() {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Sender gone; nobody can ask us to stop any more.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<Result<Uuid>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Counts consecutive storage failures and gives up past the limit
#[derive(Debug)]
struct StoreErrorBudget {
    consecutive: u32,
    max: u32,
}

impl StoreErrorBudget {
    fn new(max: u32) -> Self {
        Self {
            consecutive: 0,
            max: max.max(1),
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    fn failure(&mut self, context: &str, err: Error) -> Result<()> {
        if !err.is_storage() {
            tracing::error!(error = %err, "{}", context);
            return Ok(());
        }

        self.consecutive += 1;
        tracing::error!(
            error = %err,
            consecutive = self.consecutive,
            limit = self.max,
            "{}",
            context
        );
        if self.consecutive >= self.max {
            return Err(Error::Storage(format!(
                "giving up after {} consecutive storage errors: {}",
                self.consecutive, err
            )));
        }
        Ok(())
    }
}

/// Long-running consumer of the job store
pub struct WorkerRunner {
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
    config: WorkerRunnerConfig,
}

impl WorkerRunner {
    pub fn new(
        dispatcher: Dispatcher,
        notifier: Arc<dyn Notifier>,
        config: WorkerRunnerConfig,
    ) -> Self {
        Self {
            dispatcher,
            notifier,
            config,
        }
    }

    /// Run until shutdown is requested.
    ///
    /// Returns `Err` only once the store has failed
    /// `max_consecutive_store_errors` times in a row.
    pub async fn run(&self, mut shutdown: Option<watch::Receiver<bool>>) -> Result<()> {
        tracing::info!(
            handlers = ?self.dispatcher.handlers().job_types(),
            sweep_interval = ?self.config.sweep_interval,
            reaper_interval = ?self.config.reaper_interval,
            "Worker starting"
        );

        let mut budget = StoreErrorBudget::new(self.config.max_consecutive_store_errors);
        let mut backoff = Backoff::new(&self.config);
        let mut stream: Option<NotificationStream> = None;
        let mut reconnect_at = Instant::now();

        // First ticks fire immediately: startup sweep and reap.
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reaper = interval(self.config.reaper_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if shutdown_requested(&shutdown) {
                tracing::info!("Worker shutdown requested, stopping...");
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = shutdown_changed(&mut shutdown) => {}

                _ = sleep_until(reconnect_at), if stream.is_none() => {
                    match self.notifier.listen().await {
                        Ok(listener) => {
                            tracing::info!("Listening for job notifications");
                            backoff.reset();
                            stream = Some(listener);
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::error!(
                                error = %e,
                                "Failed to create job listener (reconnecting in {:?})",
                                delay
                            );
                            reconnect_at = Instant::now() + delay;
                        }
                    }
                }

                // Timers ahead of notifications so a busy channel cannot starve them.
                _ = sweep.tick() => {
                    self.sweep(&shutdown, &mut budget).await?;
                }

                _ = reaper.tick() => {
                    self.reap(&shutdown, &mut budget).await?;
                }

                next = next_notification(&mut stream) => {
                    match next {
                        Some(Ok(id)) => {
                            tracing::debug!(job.id = %id, "Received job notification");
                            self.dispatch(id, &mut budget).await?;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Error receiving job notification");
                        }
                        None => {
                            let delay = backoff.next_delay();
                            tracing::warn!(
                                "Job notification stream ended (db connection lost?), reconnecting in {:?}",
                                delay
                            );
                            stream = None;
                            reconnect_at = Instant::now() + delay;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        id: Uuid,
        budget: &mut StoreErrorBudget,
    ) -> Result<Option<DispatchOutcome>> {
        match self.dispatcher.dispatch(id).await {
            Ok(outcome) => {
                budget.success();
                Ok(Some(outcome))
            }
            Err(e) => {
                budget.failure("Failed to dispatch job", e)?;
                Ok(None)
            }
        }
    }

    /// Poll fallback for jobs whose notification was lost
    async fn sweep(
        &self,
        shutdown: &Option<watch::Receiver<bool>>,
        budget: &mut StoreErrorBudget,
    ) -> Result<()> {
        let store = self.dispatcher.store();
        let ids = match store
            .due_pending(self.config.pending_grace, self.config.batch_size)
            .await
        {
            Ok(ids) => {
                budget.success();
                ids
            }
            Err(e) => return budget.failure("Sweep failed to list pending jobs", e),
        };

        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Sweep found pending jobs");
        }

        for id in ids {
            if shutdown_requested(shutdown) {
                return Ok(());
            }
            if let Some(outcome) = self.dispatch(id, budget).await? {
                if !matches!(outcome, DispatchOutcome::Skipped(_)) {
                    JOBS_SWEEP_RECOVERED_TOTAL.inc();
                }
            }
        }

        match store.count_by_status().await {
            Ok(counts) => {
                for status in [
                    JobStatus::Pending,
                    JobStatus::Processing,
                    JobStatus::Completed,
                    JobStatus::Failed,
                ] {
                    JOBS_QUEUE_SIZE
                        .with_label_values(&[status.as_str()])
                        .set(counts.get(status));
                }
                Ok(())
            }
            Err(e) => budget.failure("Failed to count jobs by status", e),
        }
    }

    /// Return abandoned `processing` rows to `pending` and retry them
    async fn reap(
        &self,
        shutdown: &Option<watch::Receiver<bool>>,
        budget: &mut StoreErrorBudget,
    ) -> Result<()> {
        let ids = match self
            .dispatcher
            .store()
            .requeue_stale(self.config.stale_after, self.config.batch_size)
            .await
        {
            Ok(ids) => {
                budget.success();
                ids
            }
            Err(e) => return budget.failure("Reaper failed to requeue stale jobs", e),
        };

        if ids.is_empty() {
            return Ok(());
        }

        JOBS_REAPED_TOTAL.inc_by(ids.len() as u64);
        tracing::warn!(count = ids.len(), "Requeued stale processing jobs");

        for id in ids {
            if shutdown_requested(shutdown) {
                return Ok(());
            }
            self.dispatch(id, budget).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ratio() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jittered_duration(base, 0.2);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{d:?}");
        }
        assert_eq!(jittered_duration(base, 0.0), base);
    }

    #[test]
    fn backoff_doubles_and_resets() {
        let config = WorkerRunnerConfig {
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(4),
            reconnect_jitter_ratio: 0.0,
            ..WorkerRunnerConfig::default()
        };
        let mut backoff = Backoff::new(&config);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn budget_trips_on_consecutive_storage_errors() {
        let mut budget = StoreErrorBudget::new(2);
        assert!(budget
            .failure("x", Error::Storage("down".into()))
            .is_ok());
        budget.success();
        assert!(budget
            .failure("x", Error::Storage("down".into()))
            .is_ok());
        assert!(budget
            .failure("x", Error::Storage("down".into()))
            .is_err());
    }

    /// Notifier whose stream never runs dry
    struct Flood;

    #[async_trait::async_trait]
    impl Notifier for Flood {
        async fn publish(&self, _job_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn listen(&self) -> Result<NotificationStream> {
            Ok(futures::stream::repeat_with(|| Ok(Uuid::new_v4())).boxed())
        }
    }

    struct Done;

    #[async_trait::async_trait]
    impl crate::workers::JobHandler for Done {
        fn name(&self) -> &str {
            "Done"
        }

        fn job_type(&self) -> crate::queue::JobType {
            crate::queue::JobType::Generate
        }

        async fn handle(&self, _job: &crate::queue::Job) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweep_runs_under_constant_notifications() {
        use crate::queue::{JobStore, JobType, MemoryJobStore, NewJob, RetryPolicy};
        use crate::workers::HandlerRegistry;

        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .create(NewJob::new(JobType::Generate, serde_json::json!({"userId": "U1", "batchId": "B1"})).unwrap())
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            HandlerRegistry::new().with(Arc::new(Done)),
            RetryPolicy::default(),
        );
        let config = WorkerRunnerConfig {
            sweep_interval: Duration::from_millis(20),
            pending_grace: Duration::ZERO,
            ..WorkerRunnerConfig::default()
        };
        let runner = WorkerRunner::new(dispatcher, Arc::new(Flood), config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runner.run(Some(shutdown_rx)).await });

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = store.get(job.id).await.unwrap().unwrap();
                if current.status == JobStatus::Completed {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep starved by notifications");
        assert_eq!(completed.attempts, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn budget_ignores_other_errors() {
        let mut budget = StoreErrorBudget::new(1);
        assert!(budget.failure("x", Error::Notify("closed".into())).is_ok());
        assert_eq!(budget.consecutive, 0);
    }
}
