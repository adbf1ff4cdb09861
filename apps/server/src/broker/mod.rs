//! Alternate broker transport
//!
//! When `queue.backend` selects a broker, jobs travel through an external
//! queue instead of the job store + LISTEN/NOTIFY pairing. The broker keeps its
//! own job snapshots and owns retry scheduling (bounded attempts with
//! exponential backoff) and dead-lettering.
//!
//! A received job stays held by the broker until `complete` or `fail`
//! acknowledges it, so a worker that dies mid-job does not lose it.

mod memory;
mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use crate::config::{Config, QueueBackend};
use crate::queue::Job;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Build the broker selected by `queue.backend`; `None` for the job store path
pub fn from_config(config: &Config) -> Result<Option<Arc<dyn Broker>>> {
    let broker: Arc<dyn Broker> = match config.queue.backend {
        QueueBackend::Postgres => return Ok(None),
        QueueBackend::Redis => Arc::new(RedisBroker::from_config(&config.broker)?),
        QueueBackend::Memory => Arc::new(MemoryBroker::new(BrokerRetry::from_config(
            &config.broker,
        ))),
    };
    tracing::info!(broker = broker.name(), "Using alternate broker");
    Ok(Some(broker))
}

/// What happened to a delivery whose handler failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Scheduled again after `delay`
    Retry { delay: Duration, attempts: i32 },
    /// Attempts exhausted; parked in the dead-letter list
    DeadLettered { attempts: i32 },
}

/// Entry in the dead-letter list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand a freshly created `pending` job to the broker
    async fn publish(&self, job: &Job) -> Result<()>;

    /// Wait up to `wait` for the next due job.
    ///
    /// The returned job is already marked `processing` with `attempts`
    /// incremented for this delivery.
    async fn receive(&self, wait: Duration) -> Result<Option<Job>>;

    /// Record a successful delivery.
    ///
    /// Fails with [`Error::DeliveryReleased`](crate::Error::DeliveryReleased)
    /// when the delivery was already requeued by [`Broker::requeue_stale`].
    async fn complete(&self, job: &Job, result: Value) -> Result<Job>;

    /// Record a failed delivery and let the broker decide between retry and dead-letter
    async fn fail(&self, job: &Job, error: &str) -> Result<FailureDisposition>;

    /// Return deliveries received more than `stale_after` ago and never
    /// acknowledged to the ready queue. Returns how many were requeued.
    async fn requeue_stale(&self, stale_after: Duration) -> Result<usize>;

    /// Latest snapshot of a job that went through the broker
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BrokerRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BrokerRetry {
    pub fn from_config(config: &crate::config::BrokerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Backoff after the given number of attempts (1-based)
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = (attempts - 1).clamp(0, 30) as u32;
        self.base_delay
            .checked_mul(2u32.saturating_pow(exponent))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn disposition(&self, attempts: i32) -> FailureDisposition {
        if attempts >= self.max_attempts as i32 {
            FailureDisposition::DeadLettered { attempts }
        } else {
            FailureDisposition::Retry {
                delay: self.delay_for(attempts),
                attempts,
            }
        }
    }
}
