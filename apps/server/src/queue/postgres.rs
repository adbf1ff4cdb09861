//! PostgreSQL job store backed by the `jobs` table

use super::models::{Job, JobPatch, JobStatus, NewJob, StatusCounts};
use super::store::{chrono_duration, clamp_limit, JobStore, REAPED_ERROR};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, result, last_error, \
                           run_after, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, job: NewJob) -> Result<Job> {
        let now = Utc::now();

        let created = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (id, job_type, payload, status, attempts, run_after, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $4, $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Option<Job>> {
        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = COALESCE($3, status),
                attempts = COALESCE($4, attempts),
                result = COALESCE($5, result),
                last_error = COALESCE($6, last_error),
                run_after = COALESCE($7, run_after),
                updated_at = $8
            WHERE id = $1
              AND status = $2
              AND ($9::int IS NULL OR attempts = $9)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(patch.expected_status.as_str())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.attempts)
        .bind(patch.result)
        .bind(patch.last_error)
        .bind(patch.run_after)
        .bind(Utc::now())
        .bind(patch.expected_attempts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Job>> {
        // Single conditional statement: the affected row count is the lock.
        let claimed = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempts = attempts + 1,
                updated_at = $2
            WHERE id = $1
              AND status = 'pending'
              AND run_after <= $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn due_pending(&self, older_than: Duration, limit: i64) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - chrono_duration(older_than);

        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'pending'
              AND run_after <= $1
            ORDER BY run_after ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn requeue_stale(&self, stale_after: Duration, limit: i64) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let cutoff = now - chrono_duration(stale_after);

        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                run_after = $2,
                last_error = $3,
                updated_at = $2
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE status = 'processing'
                  AND updated_at < $1
                ORDER BY updated_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
              AND status = 'processing'
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(REAPED_ERROR)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match JobStatus::try_from(status) {
                Ok(status) => counts.add(status, count),
                Err(e) => tracing::warn!("Ignoring unexpected job status row: {}", e),
            }
        }

        Ok(counts)
    }
}
