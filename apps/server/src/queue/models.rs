//! Job queue domain models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Conversion from DB string to JobStatus
impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", value)),
        }
    }
}

/// Closed set of job kinds understood by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Content generation for a user's batch
    Generate,
}

impl JobType {
    pub const ALL: &'static [JobType] = &[JobType::Generate];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Generate => "generate",
        }
    }

    /// Check that `payload` satisfies the contract for this job type.
    ///
    /// The payload itself is stored untouched; this only rejects documents the
    /// matching handler could never process.
    pub fn validate_payload(&self, payload: &Value) -> Result<(), String> {
        if !payload.is_object() {
            return Err(format!(
                "payload for '{}' jobs must be a JSON object",
                self.as_str()
            ));
        }

        match self {
            JobType::Generate => {
                let parsed: GeneratePayload = serde_json::from_value(payload.clone())
                    .map_err(|e| format!("invalid generate payload: {}", e))?;
                if parsed.user_id.trim().is_empty() {
                    return Err("generate payload requires a non-empty userId".to_string());
                }
                if parsed.batch_id.trim().is_empty() {
                    return Err("generate payload requires a non-empty batchId".to_string());
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(JobType::Generate),
            other => Err(format!("Unknown job type: {}", other)),
        }
    }
}

impl TryFrom<String> for JobType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Payload contract for `generate` jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePayload {
    pub user_id: String,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(try_from = "String")]
    pub job_type: JobType,
    pub payload: Value,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub attempts: i32,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `pending` job that has not been persisted anywhere yet
    pub fn new_pending(job_type: JobType, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            result: None,
            last_error: None,
            run_after: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_after <= now
    }
}

/// A validated request to create a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: Value,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: Value) -> Result<Self, String> {
        job_type.validate_payload(&payload)?;
        Ok(Self { job_type, payload })
    }
}

/// Partial update of a job row.
///
/// Only the mutable columns are representable here, so `payload`, `job_type`
/// and `created_at` cannot be touched after creation. The update is applied
/// only while the row is still in `expected_status` and, when set, still at
/// `expected_attempts`.
#[derive(Debug, Clone)]
pub struct JobPatch {
    pub expected_status: JobStatus,
    /// Pins the patch to one attempt so a superseded worker cannot finalize
    /// a row that was requeued and claimed again.
    pub expected_attempts: Option<i32>,
    pub status: Option<JobStatus>,
    pub attempts: Option<i32>,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub run_after: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn expecting(expected_status: JobStatus) -> Self {
        Self {
            expected_status,
            expected_attempts: None,
            status: None,
            attempts: None,
            result: None,
            last_error: None,
            run_after: None,
        }
    }

    /// Only apply while the row is still on attempt `attempts`
    pub fn at_attempt(mut self, attempts: i32) -> Self {
        self.expected_attempts = Some(attempts);
        self
    }

    /// Whether the row still satisfies the patch preconditions
    pub fn matches(&self, job: &Job) -> bool {
        job.status == self.expected_status
            && self.expected_attempts.map_or(true, |n| job.attempts == n)
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    /// Apply to an in-memory copy; used by stores that keep rows in process
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &self.last_error {
            job.last_error = Some(error.clone());
        }
        if let Some(run_after) = self.run_after {
            job.run_after = run_after;
        }
        job.updated_at = now;
    }
}

/// Per-status row counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub initial_delay_seconds: i32,
    pub max_delay_seconds: i32,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_seconds: 30,
            max_delay_seconds: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts already ran
    pub fn calculate_delay(&self, attempts: i32) -> i32 {
        let exponent = (attempts - 1).max(0);
        let delay = self.initial_delay_seconds as f64 * self.backoff_multiplier.powi(exponent);
        delay.min(self.max_delay_seconds as f64) as i32
    }

    pub fn can_retry(&self, attempts: i32) -> bool {
        attempts < self.max_attempts
    }

    pub fn next_run_after(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.calculate_delay(attempts) as i64)
    }
}
