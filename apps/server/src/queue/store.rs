//! Job store abstraction
//!
//! The store is the queue-of-record: every job exists as exactly one row and
//! the row alone decides the job's status. Notifications and broker messages
//! only ever point at rows.

use super::models::{Job, JobPatch, NewJob, StatusCounts};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for operator listings
pub const MAX_LIST_LIMIT: i64 = 500;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` row with zero attempts
    async fn create(&self, job: NewJob) -> Result<Job>;

    /// Point lookup by id
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Conditional partial update.
    ///
    /// Applied only while the row is still in `patch.expected_status`; returns
    /// `None` when the row is missing or the precondition failed.
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Option<Job>>;

    /// Atomically move a due `pending` job to `processing` and bump `attempts`.
    ///
    /// Returns `None` if the job is missing, not pending, not yet due, or was
    /// claimed by someone else first.
    async fn claim(&self, id: Uuid) -> Result<Option<Job>>;

    /// Most recent jobs by creation time, newest first
    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>>;

    /// Ids of pending jobs that became due at least `older_than` ago, oldest first
    async fn due_pending(&self, older_than: Duration, limit: i64) -> Result<Vec<Uuid>>;

    /// Put `processing` rows untouched for `stale_after` back to `pending`
    async fn requeue_stale(&self, stale_after: Duration, limit: i64) -> Result<Vec<Uuid>>;

    async fn count_by_status(&self) -> Result<StatusCounts>;
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_LIST_LIMIT)
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub(crate) const REAPED_ERROR: &str = "worker lease expired";
