//! In-process job store for tests and single-process deployments

use super::models::{Job, JobPatch, JobStatus, NewJob, StatusCounts};
use super::store::{chrono_duration, clamp_limit, JobStore, REAPED_ERROR};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable database; every operation fails while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows currently held
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test hook: rewrite a row's timestamps as if time had passed
    pub fn backdate(&self, id: Uuid, by: Duration) {
        let by = chrono_duration(by);
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.run_after = job.run_after - by;
            job.updated_at = job.updated_at - by;
            job.created_at = job.created_at - by;
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("job store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<Job> {
        self.check_available()?;
        let created = Job::new_pending(job.job_type, job.payload);
        self.jobs.write().insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.check_available()?;
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Option<Job>> {
        self.check_available()?;
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(job) if patch.matches(job) => {
                patch.apply(job, Utc::now());
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Job>> {
        self.check_available()?;
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending && job.is_due(now) => {
                job.status = JobStatus::Processing;
                job.attempts += 1;
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        self.check_available()?;
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(clamp_limit(limit) as usize);
        Ok(jobs)
    }

    async fn due_pending(&self, older_than: Duration, limit: i64) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let cutoff = Utc::now() - chrono_duration(older_than);
        let mut due: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.run_after <= cutoff)
            .map(|job| (job.run_after, job.id))
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(clamp_limit(limit) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn requeue_stale(&self, stale_after: Duration, limit: i64) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let now = Utc::now();
        let cutoff = now - chrono_duration(stale_after);
        let mut jobs = self.jobs.write();

        let mut stale: Vec<(chrono::DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing && job.updated_at < cutoff)
            .map(|job| (job.updated_at, job.id))
            .collect();
        stale.sort();
        stale.truncate(clamp_limit(limit) as usize);

        let mut requeued = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Pending;
                job.run_after = now;
                job.last_error = Some(REAPED_ERROR.to_string());
                job.updated_at = now;
                requeued.push(id);
            }
        }
        Ok(requeued)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        self.check_available()?;
        let mut counts = StatusCounts::default();
        for job in self.jobs.read().values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }
}
