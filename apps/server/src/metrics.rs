//! Metrics collection for the job queue
//!
//! Prometheus metrics for the HTTP surface, the enqueue path and the worker.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
};

lazy_static! {
    // HTTP Request Metrics

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quire_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL");

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "quire_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");

    /// In-flight HTTP requests
    pub static ref HTTP_REQUESTS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "quire_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
        &["method", "path"]
    )
    .expect("Failed to register HTTP_REQUESTS_IN_FLIGHT");

    // Enqueue Metrics

    /// Jobs enqueued, by type and the path that accepted them (store or broker name)
    pub static ref JOBS_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quire_jobs_enqueued_total",
        "Total number of jobs enqueued",
        &["job_type", "path"]
    )
    .expect("Failed to register JOBS_ENQUEUED_TOTAL");

    /// Wake-up notifications that could not be published
    pub static ref JOBS_NOTIFY_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "quire_jobs_notify_failures_total",
        "Total number of failed job notifications"
    )
    .expect("Failed to register JOBS_NOTIFY_FAILURES_TOTAL");

    /// Broker publishes that fell back to the job store
    pub static ref JOBS_BROKER_FALLBACK_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quire_jobs_broker_fallback_total",
        "Total number of enqueues that fell back from the broker to the job store",
        &["broker"]
    )
    .expect("Failed to register JOBS_BROKER_FALLBACK_TOTAL");

    // Worker Metrics

    /// Finished attempts by type and outcome
    pub static ref JOBS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quire_jobs_processed_total",
        "Total number of job attempts finished",
        &["job_type", "outcome"]
    )
    .expect("Failed to register JOBS_PROCESSED_TOTAL");

    /// Handler duration
    pub static ref JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "quire_job_duration_seconds",
        "Job execution duration in seconds",
        &["job_type"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    )
    .expect("Failed to register JOB_DURATION_SECONDS");

    /// Signals the dispatcher dropped without running a handler
    pub static ref JOBS_SIGNALS_IGNORED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quire_jobs_signals_ignored_total",
        "Total number of job signals ignored by the dispatcher",
        &["reason"]
    )
    .expect("Failed to register JOBS_SIGNALS_IGNORED_TOTAL");

    /// Pending jobs picked up by the periodic sweep
    pub static ref JOBS_SWEEP_RECOVERED_TOTAL: IntCounter = register_int_counter!(
        "quire_jobs_sweep_recovered_total",
        "Total number of pending jobs dispatched by the sweep"
    )
    .expect("Failed to register JOBS_SWEEP_RECOVERED_TOTAL");

    /// Abandoned `processing` rows returned to `pending`
    pub static ref JOBS_REAPED_TOTAL: IntCounter = register_int_counter!(
        "quire_jobs_reaped_total",
        "Total number of stale processing jobs requeued"
    )
    .expect("Failed to register JOBS_REAPED_TOTAL");

    /// Jobs in the store by status, refreshed by the sweep
    pub static ref JOBS_QUEUE_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "quire_jobs_queue_size",
        "Number of jobs in the store by status",
        &["status"]
    )
    .expect("Failed to register JOBS_QUEUE_SIZE");
}

/// Helper to sanitize path for metrics labels (replace ids, limit cardinality)
pub fn sanitize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [] => "/".to_string(),
        [first] => format!("/{}", first),
        ["jobs", _] => "/jobs/{id}".to_string(),
        [first, ..] => format!("/{}/*", first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/"), "/");
        assert_eq!(sanitize_path("/health"), "/health");
        assert_eq!(sanitize_path("/jobs"), "/jobs");
        assert_eq!(
            sanitize_path("/jobs/0d5b4b7e-8d1c-4a56-9d51-3f1f0a3b9c11"),
            "/jobs/{id}"
        );
        assert_eq!(sanitize_path("/unknown/a/b"), "/unknown/*");
    }
}
