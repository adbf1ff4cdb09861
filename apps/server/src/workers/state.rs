//! Lightweight state for worker processes

use super::base::HandlerRegistry;
use super::generate_worker::{GenerateHandler, HttpContentGenerator};
use crate::state::{AppStateOptions, QueueBackends};
use crate::{Config, Result};
use std::sync::Arc;

/// Everything the worker loops need; no HTTP router or enqueue surface
#[derive(Clone)]
pub struct WorkerState {
    pub config: Arc<Config>,
    pub backends: QueueBackends,
    pub handlers: HandlerRegistry,
}

impl WorkerState {
    pub async fn new(config: Config) -> Result<Self> {
        let options = AppStateOptions::from_config(&config);
        let backends = QueueBackends::connect(&config, &options).await?;
        Self::with_backends(config, backends)
    }

    /// Reuse backends that already exist, e.g. the server's when embedded
    pub fn with_backends(config: Config, backends: QueueBackends) -> Result<Self> {
        let handlers = default_handlers(&config)?;
        Ok(Self {
            config: Arc::new(config),
            backends,
            handlers,
        })
    }
}

/// Handlers for every job type, wired to their external services
pub fn default_handlers(config: &Config) -> Result<HandlerRegistry> {
    let generator = HttpContentGenerator::new(&config.generator)?;
    Ok(HandlerRegistry::new().with(Arc::new(GenerateHandler::new(Arc::new(generator)))))
}
