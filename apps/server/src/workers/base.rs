//! Job handler trait and registry

use crate::metrics::JOB_DURATION_SECONDS;
use crate::queue::{Job, JobType};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Executes jobs of one type.
///
/// Handlers must be safe to run more than once for the same job: delivery is
/// at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &str;

    fn job_type(&self) -> JobType;

    /// Run the job and return its result document
    async fn handle(&self, job: &Job) -> anyhow::Result<Value>;
}

/// Maps each job type to its handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Run the handler for `job`, turning a missing handler, an error, or a
    /// panic into a failure message.
    pub async fn execute(&self, job: &Job) -> Result<Value, String> {
        let handler = self
            .get(job.job_type)
            .ok_or_else(|| format!("no handler registered for job type {}", job.job_type))?;

        let timer = JOB_DURATION_SECONDS
            .with_label_values(&[job.job_type.as_str()])
            .start_timer();

        let outcome = AssertUnwindSafe(handler.handle(job)).catch_unwind().await;
        timer.observe_duration();

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
