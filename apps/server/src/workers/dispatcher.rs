//! Single-attempt job dispatch: load, claim, execute, finalize

use super::base::HandlerRegistry;
use crate::metrics::{JOBS_PROCESSED_TOTAL, JOBS_SIGNALS_IGNORED_TOTAL};
use crate::queue::{Job, JobPatch, JobStatus, JobStore, RetryPolicy};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Why a signal did not lead to an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    NotPending(JobStatus),
    NotDue,
    /// Another worker claimed the row first, or it changed while we ran
    ClaimLost,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotFound => "not_found",
            SkipReason::NotPending(_) => "not_pending",
            SkipReason::NotDue => "not_due",
            SkipReason::ClaimLost => "claim_lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    Completed(Job),
    /// Handler failed; the job is `pending` again with a later `run_after`
    Retrying(Job),
    Failed(Job),
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Skipped(_) => "skipped",
            DispatchOutcome::Completed(_) => "completed",
            DispatchOutcome::Retrying(_) => "retrying",
            DispatchOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    handlers: HandlerRegistry,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, handlers: HandlerRegistry, retry: RetryPolicy) -> Self {
        Self {
            store,
            handlers,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Run at most one attempt of job `id`.
    ///
    /// Duplicate, stale, and unknown ids are skipped without touching the
    /// store. Only storage failures surface as `Err`.
    pub async fn dispatch(&self, id: Uuid) -> Result<DispatchOutcome> {
        let span = tracing::info_span!("dispatch", job.id = %id, job.type = tracing::field::Empty);
        self.dispatch_inner(id).instrument(span).await
    }

    async fn dispatch_inner(&self, id: Uuid) -> Result<DispatchOutcome> {
        let Some(job) = self.store.get(id).await? else {
            return Ok(skip(SkipReason::NotFound));
        };
        tracing::Span::current().record("job.type", job.job_type.as_str());

        if job.status != JobStatus::Pending {
            return Ok(skip(SkipReason::NotPending(job.status)));
        }
        if !job.is_due(Utc::now()) {
            return Ok(skip(SkipReason::NotDue));
        }

        let Some(claimed) = self.store.claim(id).await? else {
            return Ok(skip(SkipReason::ClaimLost));
        };

        tracing::info!(attempts = claimed.attempts, "Processing job");

        // Finalize only the attempt this worker claimed.
        let finalize = || JobPatch::expecting(JobStatus::Processing).at_attempt(claimed.attempts);

        let outcome = match self.handlers.execute(&claimed).await {
            Ok(result) => {
                let patch = finalize()
                    .status(JobStatus::Completed)
                    .result(result);
                match self.store.update(id, patch).await? {
                    Some(done) => {
                        tracing::info!(attempts = done.attempts, "Job completed");
                        DispatchOutcome::Completed(done)
                    }
                    None => return Ok(lost_during_finalize()),
                }
            }
            Err(error) => {
                let now = Utc::now();
                let patch = if self.retry.can_retry(claimed.attempts) {
                    finalize()
                        .status(JobStatus::Pending)
                        .run_after(self.retry.next_run_after(claimed.attempts, now))
                        .last_error(error.clone())
                } else {
                    finalize()
                        .status(JobStatus::Failed)
                        .last_error(error.clone())
                };

                match self.store.update(id, patch).await? {
                    Some(job) if job.status == JobStatus::Pending => {
                        tracing::warn!(
                            attempts = job.attempts,
                            run_after = %job.run_after,
                            error = %error,
                            "Job failed; retry scheduled"
                        );
                        DispatchOutcome::Retrying(job)
                    }
                    Some(job) => {
                        tracing::error!(attempts = job.attempts, error = %error, "Job failed");
                        DispatchOutcome::Failed(job)
                    }
                    None => return Ok(lost_during_finalize()),
                }
            }
        };

        JOBS_PROCESSED_TOTAL
            .with_label_values(&[claimed.job_type.as_str(), outcome.as_str()])
            .inc();
        Ok(outcome)
    }
}

fn skip(reason: SkipReason) -> DispatchOutcome {
    JOBS_SIGNALS_IGNORED_TOTAL
        .with_label_values(&[reason.as_str()])
        .inc();
    tracing::debug!(reason = reason.as_str(), "Ignoring job signal");
    DispatchOutcome::Skipped(reason)
}

fn lost_during_finalize() -> DispatchOutcome {
    tracing::warn!("Job changed while running; result discarded");
    skip(SkipReason::ClaimLost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobType, MemoryJobStore, NewJob};
    use crate::workers::JobHandler;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn job_type(&self) -> JobType {
            JobType::Generate
        }

        async fn handle(&self, _job: &Job) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("generator unavailable");
            }
            Ok(json!({"ok": true}))
        }
    }

    async fn setup(fail: bool, retry: RetryPolicy) -> (Arc<MemoryJobStore>, Arc<Counting>, Dispatcher, Job) {
        let store = Arc::new(MemoryJobStore::new());
        let handler = Arc::new(Counting {
            fail,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(
            store.clone(),
            HandlerRegistry::new().with(handler.clone()),
            retry,
        );
        let job = store
            .create(NewJob::new(JobType::Generate, json!({"userId": "U1", "batchId": "B1"})).unwrap())
            .await
            .unwrap();
        (store, handler, dispatcher, job)
    }

    #[tokio::test]
    async fn completes_pending_job() {
        let (store, handler, dispatcher, job) = setup(false, RetryPolicy::default()).await;

        let outcome = dispatcher.dispatch(job.id).await.unwrap();
        let DispatchOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(done.attempts, 1);
        assert_eq!(done.result, Some(json!({"ok": true})));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_signal_is_a_no_op() {
        let (store, handler, dispatcher, job) = setup(false, RetryPolicy::default()).await;
        dispatcher.dispatch(job.id).await.unwrap();
        let before = store.get(job.id).await.unwrap().unwrap();

        let outcome = dispatcher.dispatch(job.id).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped(SkipReason::NotPending(JobStatus::Completed))
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(job.id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_id_is_skipped() {
        let (_store, handler, dispatcher, _job) = setup(false, RetryPolicy::default()).await;
        let outcome = dispatcher.dispatch(Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::NotFound));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_without_retry_is_terminal() {
        let (store, _handler, dispatcher, job) = setup(true, RetryPolicy::default()).await;

        let outcome = dispatcher.dispatch(job.id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));

        let failed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.result.is_none());
        assert!(failed
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("generator unavailable"));
    }

    #[tokio::test]
    async fn failure_with_retry_reschedules() {
        let retry = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let (store, handler, dispatcher, job) = setup(true, retry).await;

        let outcome = dispatcher.dispatch(job.id).await.unwrap();
        let DispatchOutcome::Retrying(pending) = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.attempts, 1);
        assert!(pending.run_after > Utc::now());

        // Not due yet, so a new signal does nothing
        let outcome = dispatcher.dispatch(job.id).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::NotDue));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        store.backdate(job.id, std::time::Duration::from_secs(3600));
        let outcome = dispatcher.dispatch(job.id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Retrying(ref j) if j.attempts == 2));
    }

    #[tokio::test]
    async fn storage_failure_is_an_error() {
        let (store, _handler, dispatcher, job) = setup(false, RetryPolicy::default()).await;
        store.set_unavailable(true);
        assert!(dispatcher.dispatch(job.id).await.unwrap_err().is_storage());
    }

    #[tokio::test]
    async fn payload_survives_processing() {
        let (store, _handler, dispatcher, job) = setup(true, RetryPolicy::default()).await;
        dispatcher.dispatch(job.id).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().payload, job.payload);
    }
}
