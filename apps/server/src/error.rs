//! Error types for the job queue

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Broker error: {0}")]
    Broker(String),

    /// The broker no longer holds this delivery; it was requeued or acknowledged elsewhere
    #[error("Delivery no longer held: {0}")]
    DeliveryReleased(uuid::Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error comes from the job store itself.
    ///
    /// The worker treats these as fatal for the attempt in progress and counts
    /// them towards its shutdown threshold.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Migration(_) | Error::Storage(_)
        )
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Broker(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::JobNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Database(_)
            | Error::Migration(_)
            | Error::Storage(_)
            | Error::Notify(_)
            | Error::Broker(_)
            | Error::DeliveryReleased(_)
            | Error::Config(_)
            | Error::Internal(_)
            | Error::Other(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "status": status.as_u16(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
