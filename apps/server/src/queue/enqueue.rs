//! Producer-facing enqueue path

use super::models::{Job, JobType, NewJob};
use super::notify::Notifier;
use super::store::JobStore;
use crate::broker::Broker;
use crate::metrics::{JOBS_BROKER_FALLBACK_TOTAL, JOBS_ENQUEUED_TOTAL, JOBS_NOTIFY_FAILURES_TOTAL};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Creates jobs and signals the worker.
///
/// With a broker configured, jobs are published there first and only land in
/// the job store when the broker rejects them.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    broker: Option<Arc<dyn Broker>>,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            broker: None,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broker(&self) -> Option<&Arc<dyn Broker>> {
        self.broker.as_ref()
    }

    /// Persist a job and wake the worker. Never waits for processing.
    #[tracing::instrument(skip(self, payload), fields(job.type = %job_type, job.id))]
    pub async fn enqueue(&self, job_type: JobType, payload: Value) -> Result<Job> {
        let new_job = NewJob::new(job_type, payload).map_err(Error::Validation)?;

        if let Some(broker) = &self.broker {
            let job = Job::new_pending(new_job.job_type, new_job.payload.clone());
            match broker.publish(&job).await {
                Ok(()) => {
                    tracing::Span::current().record("job.id", tracing::field::display(job.id));
                    JOBS_ENQUEUED_TOTAL
                        .with_label_values(&[job_type.as_str(), broker.name()])
                        .inc();
                    tracing::debug!(broker = broker.name(), "Job published to broker");
                    return Ok(job);
                }
                Err(e) => {
                    JOBS_BROKER_FALLBACK_TOTAL
                        .with_label_values(&[broker.name()])
                        .inc();
                    tracing::warn!(
                        broker = broker.name(),
                        error = %e,
                        "Broker rejected job; falling back to the job store"
                    );
                }
            }
        }

        self.enqueue_in_store(new_job).await
    }

    /// Enqueue with the job type given as a string tag
    pub async fn enqueue_raw(&self, job_type: &str, payload: Value) -> Result<Job> {
        let job_type: JobType = job_type.parse().map_err(Error::Validation)?;
        self.enqueue(job_type, payload).await
    }

    async fn enqueue_in_store(&self, new_job: NewJob) -> Result<Job> {
        let job_type = new_job.job_type;
        let job = self.store.create(new_job).await?;
        tracing::Span::current().record("job.id", tracing::field::display(job.id));
        JOBS_ENQUEUED_TOTAL
            .with_label_values(&[job_type.as_str(), "store"])
            .inc();

        // The row is durable at this point; a lost signal only delays pickup
        // until the next sweep.
        if let Err(e) = self.notifier.publish(job.id).await {
            JOBS_NOTIFY_FAILURES_TOTAL.inc();
            tracing::warn!(error = %e, "Failed to publish job notification");
        }

        Ok(job)
    }

    /// Look a job up in the store, then in the broker's snapshots
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        if let Some(job) = self.store.get(id).await? {
            return Ok(Some(job));
        }
        match &self.broker {
            Some(broker) => broker.get(id).await,
            None => Ok(None),
        }
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        self.store.list_recent(limit).await
    }
}
