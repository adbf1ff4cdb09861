//! Job submission and status handlers

use crate::queue::{Job, MAX_LIST_LIMIT};
use crate::state::AppState;
use crate::{Error, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
    pub count: usize,
}

/// `POST /jobs`: persist a job and return it without waiting for processing
pub async fn create_job(
    State(state): State<AppState>,
    body: std::result::Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>)> {
    let Json(request) = body.map_err(|e| Error::Validation(e.body_text()))?;
    let job = state
        .enqueuer
        .enqueue_raw(&request.job_type, request.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// `GET /jobs/:id`
pub async fn get_job(
    State(state): State<AppState>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Job>> {
    let Path(id) = id.map_err(|e| Error::Validation(e.body_text()))?;
    state
        .enqueuer
        .get(id)
        .await?
        .map(Json)
        .ok_or(Error::JobNotFound(id))
}

/// `GET /jobs?limit=N`: most recent jobs, newest first
pub async fn list_jobs(
    State(state): State<AppState>,
    params: std::result::Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<JobList>> {
    let Query(params) = params.map_err(|e| Error::Validation(e.body_text()))?;
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(Error::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LIST_LIMIT
        )));
    }

    let jobs = state.enqueuer.list_recent(limit).await?;
    Ok(Json(JobList {
        count: jobs.len(),
        jobs,
    }))
}
