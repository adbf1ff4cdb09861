//! Shared application state

use crate::broker::{self, Broker};
use crate::queue::{
    Enqueuer, JobStore, MemoryJobStore, MemoryNotifier, Notifier, PgNotifier, PostgresJobStore,
};
use crate::{db, Config, Result};
use sqlx::PgPool;
use std::sync::Arc;

/// Which job store backs the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobStoreKind {
    /// `jobs` table plus LISTEN/NOTIFY
    #[default]
    Postgres,
    /// Process-local store and notifier; nothing survives a restart
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppStateOptions {
    pub run_migrations: bool,
    pub job_store: JobStoreKind,
}

impl AppStateOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            run_migrations: config.database.run_migrations,
            job_store: JobStoreKind::Postgres,
        }
    }
}

/// Store, notifier, and optional broker shared by producers and the worker
#[derive(Clone)]
pub struct QueueBackends {
    pub store: Arc<dyn JobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub broker: Option<Arc<dyn Broker>>,
    pub db_pool: Option<PgPool>,
}

impl QueueBackends {
    pub async fn connect(config: &Config, options: &AppStateOptions) -> Result<Self> {
        let broker = broker::from_config(config)?;

        match options.job_store {
            JobStoreKind::Memory => Ok(Self::in_memory(broker)),
            JobStoreKind::Postgres => {
                let pool = db::create_pool(&config.database).await?;
                if options.run_migrations {
                    db::run_migrations(&pool).await?;
                }

                Ok(Self {
                    store: Arc::new(PostgresJobStore::new(pool.clone())),
                    notifier: Arc::new(PgNotifier::new(pool.clone(), config.queue.channel.clone())),
                    broker,
                    db_pool: Some(pool),
                })
            }
        }
    }

    pub fn in_memory(broker: Option<Arc<dyn Broker>>) -> Self {
        Self {
            store: Arc::new(MemoryJobStore::new()),
            notifier: Arc::new(MemoryNotifier::new()),
            broker,
            db_pool: None,
        }
    }

    pub fn enqueuer(&self) -> Enqueuer {
        let enqueuer = Enqueuer::new(self.store.clone(), self.notifier.clone());
        match &self.broker {
            Some(broker) => enqueuer.with_broker(broker.clone()),
            None => enqueuer,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backends: QueueBackends,
    pub enqueuer: Enqueuer,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let options = AppStateOptions::from_config(&config);
        Self::new_with_options(config, options).await
    }

    pub async fn new_with_options(config: Config, options: AppStateOptions) -> Result<Self> {
        let backends = QueueBackends::connect(&config, &options).await?;
        tracing::info!(
            backend = config.queue.backend.as_str(),
            store = ?options.job_store,
            "Queue backends ready"
        );
        Ok(Self::from_backends(config, backends))
    }

    pub fn from_backends(config: Config, backends: QueueBackends) -> Self {
        let enqueuer = backends.enqueuer();
        Self {
            config: Arc::new(config),
            backends,
            enqueuer,
        }
    }
}
