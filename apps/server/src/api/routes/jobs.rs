//! Producer and status-polling routes

use crate::api::handlers::jobs;
use crate::state::AppState;
use axum::{routing::get, Router};

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/jobs/:id", get(jobs::get_job))
}
