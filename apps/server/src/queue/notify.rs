//! Wake-up notifications for the worker
//!
//! Notifications carry nothing but a job id and are never durable. Losing one
//! only costs latency until the next sweep; receiving one twice, or for a job
//! that already finished, is harmless because the worker re-reads the row.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Stream of job ids; ends when the underlying subscription is lost
pub type NotificationStream = BoxStream<'static, Result<Uuid>>;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fire-and-forget publish of a job id
    async fn publish(&self, job_id: Uuid) -> Result<()>;

    /// Subscribe to published job ids
    async fn listen(&self) -> Result<NotificationStream>;
}

/// LISTEN/NOTIFY on a fixed channel
#[derive(Clone, Debug)]
pub struct PgNotifier {
    pool: PgPool,
    channel: String,
}

impl PgNotifier {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn publish(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Notify(e.to_string()))?;
        Ok(())
    }

    async fn listen(&self) -> Result<NotificationStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        tracing::debug!(channel = %self.channel, "Listening for job notifications");

        let stream = listener.into_stream().filter_map(|notification| async move {
            match notification {
                Ok(notification) => match Uuid::parse_str(notification.payload()) {
                    Ok(id) => Some(Ok(id)),
                    Err(_) => {
                        tracing::warn!(
                            payload = notification.payload(),
                            "Ignoring notification that is not a job id"
                        );
                        None
                    }
                },
                Err(e) => Some(Err(Error::Database(e))),
            }
        });

        Ok(stream.boxed())
    }
}

/// Broadcast channel fan-out inside one process
#[derive(Debug)]
pub struct MemoryNotifier {
    sender: broadcast::Sender<Uuid>,
    failing: AtomicBool,
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every publish fail, as if the transport were down
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn publish(&self, job_id: Uuid) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Notify("notification transport unavailable".to_string()));
        }
        // No listeners is not an error; the signal is simply lost.
        let _ = self.sender.send(job_id);
        Ok(())
    }

    async fn listen(&self) -> Result<NotificationStream> {
        let receiver = self.sender.subscribe();

        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(id) => return Some((Ok(id), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Notification listener lagged; hints dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
