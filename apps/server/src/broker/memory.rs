//! In-process broker with the same retry and dead-letter semantics as Redis

use super::{Broker, BrokerRetry, DeadLetter, FailureDisposition};
use crate::queue::{Job, JobStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<Job>,
    delayed: Vec<Job>,
    /// Received but not yet acknowledged, keyed by job id
    processing: HashMap<Uuid, Job>,
    snapshots: HashMap<Uuid, Job>,
    dead: Vec<DeadLetter>,
}

impl Inner {
    fn promote_due(&mut self) {
        let now = Utc::now();
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].is_due(now) {
                let job = self.delayed.swap_remove(index);
                self.ready.push_back(job);
            } else {
                index += 1;
            }
        }
    }

    /// Drop the held delivery, provided it is the attempt being acknowledged
    fn release(&mut self, job: &Job) -> Result<()> {
        match self.processing.get(&job.id) {
            Some(held) if held.attempts == job.attempts => {
                self.processing.remove(&job.id);
                Ok(())
            }
            _ => Err(Error::DeliveryReleased(job.id)),
        }
    }

    fn next_delayed_in(&self) -> Option<Duration> {
        let now = Utc::now();
        self.delayed
            .iter()
            .map(|job| (job.run_after - now).to_std().unwrap_or(Duration::ZERO))
            .min()
    }
}

#[derive(Debug)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    retry: BrokerRetry,
    unavailable: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerRetry::default())
    }
}

impl MemoryBroker {
    pub fn new(retry: BrokerRetry) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            retry,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Reject every publish, as if the broker were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Jobs waiting for delivery, including scheduled retries
    pub fn queued(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.delayed.len()
    }

    /// Deliveries received and not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.inner.lock().processing.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead.clone()
    }

    fn take_ready(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        inner.promote_due();
        let mut job = inner.ready.pop_front()?;
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.updated_at = Utc::now();
        inner.snapshots.insert(job.id, job.clone());
        inner.processing.insert(job.id, job.clone());
        Some(job)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, job: &Job) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Broker("memory broker unavailable".to_string()));
        }
        {
            let mut inner = self.inner.lock();
            inner.snapshots.insert(job.id, job.clone());
            inner.ready.push_back(job.clone());
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.take_ready() {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut sleep_for = deadline - now;
            let next_delayed = self.inner.lock().next_delayed_in();
            if let Some(next_due) = next_delayed {
                sleep_for = sleep_for.min(next_due);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn complete(&self, job: &Job, result: Value) -> Result<Job> {
        let mut done = job.clone();
        done.status = JobStatus::Completed;
        done.result = Some(result);
        done.updated_at = Utc::now();

        let mut inner = self.inner.lock();
        inner.release(job)?;
        inner.snapshots.insert(done.id, done.clone());
        Ok(done)
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailureDisposition> {
        let now = Utc::now();
        let disposition = self.retry.disposition(job.attempts);
        let mut failed = job.clone();
        failed.last_error = Some(error.to_string());
        failed.updated_at = now;

        let mut inner = self.inner.lock();
        inner.release(job)?;
        match &disposition {
            FailureDisposition::Retry { delay, .. } => {
                failed.status = JobStatus::Pending;
                failed.run_after = now
                    + chrono::Duration::from_std(*delay).unwrap_or_else(|_| chrono::Duration::zero());
                inner.snapshots.insert(failed.id, failed.clone());
                inner.delayed.push(failed);
            }
            FailureDisposition::DeadLettered { .. } => {
                failed.status = JobStatus::Failed;
                inner.snapshots.insert(failed.id, failed.clone());
                inner.dead.push(DeadLetter {
                    job: failed,
                    error: error.to_string(),
                    failed_at: now,
                });
            }
        }
        drop(inner);

        if matches!(disposition, FailureDisposition::Retry { .. }) {
            self.notify.notify_one();
        }
        Ok(disposition)
    }

    async fn requeue_stale(&self, stale_after: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());

        let requeued = {
            let mut inner = self.inner.lock();
            let stale: Vec<Uuid> = inner
                .processing
                .values()
                .filter(|job| job.updated_at < cutoff)
                .map(|job| job.id)
                .collect();
            for id in &stale {
                if let Some(mut job) = inner.processing.remove(id) {
                    job.status = JobStatus::Pending;
                    job.updated_at = Utc::now();
                    inner.snapshots.insert(job.id, job.clone());
                    inner.ready.push_back(job);
                }
            }
            stale.len()
        };

        if requeued > 0 {
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().snapshots.get(&id).cloned())
    }
}
