//! Redis-backed broker
//!
//! Layout under the configured key prefix:
//! - `{prefix}:ready`      list of job documents waiting for delivery (LPUSH / BLMOVE)
//! - `{prefix}:processing` list of delivered documents not yet acknowledged
//! - `{prefix}:leases`     sorted set of processing documents scored by receive time in unix millis
//! - `{prefix}:delayed`    sorted set of retries scored by due time in unix millis
//! - `{prefix}:jobs`       hash of job id -> latest job snapshot
//! - `{prefix}:dead`       list of dead-lettered deliveries
//!
//! A delivery moves from `ready` to `processing` atomically and is only
//! removed from there when it is settled, together with its snapshot write.
//! Settling a document that is no longer in `processing` is a no-op, which
//! keeps a worker whose delivery was requeued from overwriting its successor.

use super::{Broker, BrokerRetry, DeadLetter, FailureDisposition};
use crate::queue::{Job, JobStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Max delayed retries moved to the ready list per receive call
const PROMOTE_BATCH: usize = 100;

/// BLMOVE treats 0 as "block forever"
const MIN_BLOCK_SECONDS: f64 = 0.1;

/// KEYS: delayed, ready. ARGV: now millis, batch size.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, item in ipairs(due) do
  redis.call('ZREM', KEYS[1], item)
  redis.call('LPUSH', KEYS[2], item)
end
return #due
";

/// KEYS: processing, leases, jobs, target. ARGV: held document, job id,
/// snapshot, mode, score, entry. Returns 0 when the document is no longer held.
const SETTLE_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[2], ARGV[3])
if ARGV[4] == 'zadd' then
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[6])
elseif ARGV[4] == 'lpush' then
  redis.call('LPUSH', KEYS[4], ARGV[6])
end
return 1
";

/// KEYS: processing, leases. ARGV: now millis, cutoff millis.
/// Entries without a lease get one now so they expire a full period later.
const FIND_STALE_SCRIPT: &str = r"
local stale = {}
for _, item in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  local leased = redis.call('ZSCORE', KEYS[2], item)
  if not leased then
    redis.call('ZADD', KEYS[2], ARGV[1], item)
  elseif tonumber(leased) < tonumber(ARGV[2]) then
    table.insert(stale, item)
  end
end
return stale
";

#[derive(Debug, Clone)]
struct Keys {
    ready: String,
    processing: String,
    leases: String,
    delayed: String,
    jobs: String,
    dead: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}:ready"),
            processing: format!("{prefix}:processing"),
            leases: format!("{prefix}:leases"),
            delayed: format!("{prefix}:delayed"),
            jobs: format!("{prefix}:jobs"),
            dead: format!("{prefix}:dead"),
        }
    }
}

struct Scripts {
    promote: redis::Script,
    settle: redis::Script,
    find_stale: redis::Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            promote: redis::Script::new(PROMOTE_SCRIPT),
            settle: redis::Script::new(SETTLE_SCRIPT),
            find_stale: redis::Script::new(FIND_STALE_SCRIPT),
        }
    }
}

/// What a settle does besides removing the held document and writing the snapshot
enum Then<'a> {
    Nothing,
    Schedule { at_ms: i64, entry: &'a str },
    Push { list: &'a str, entry: &'a str },
}

pub struct RedisBroker {
    client: redis::Client,
    keys: Keys,
    retry: BrokerRetry,
    scripts: Scripts,
    /// Shared connection for non-blocking commands
    commands: Mutex<Option<MultiplexedConnection>>,
    /// Dedicated connection for BLMOVE so it never stalls other commands
    blocking: Mutex<Option<MultiplexedConnection>>,
    /// Raw documents held in the processing list for deliveries of this process
    held: parking_lot::Mutex<HashMap<(Uuid, i32), String>>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("keys", &self.keys)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RedisBroker {
    /// Create a broker; connections are opened lazily on first use
    pub fn new(redis_url: &str, key_prefix: &str, retry: BrokerRetry) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            keys: Keys::new(key_prefix),
            retry,
            scripts: Scripts::new(),
            commands: Mutex::new(None),
            blocking: Mutex::new(None),
            held: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &crate::config::BrokerConfig) -> Result<Self> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| Error::Config("broker.redis_url is not set".to_string()))?;
        Self::new(url, &config.key_prefix, BrokerRetry::from_config(config))
    }

    async fn connection(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
    ) -> Result<MultiplexedConnection> {
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop a cached connection after a failure so the next call reconnects
    async fn discard(&self, slot: &Mutex<Option<MultiplexedConnection>>, err: &redis::RedisError) {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            *slot.lock().await = None;
        }
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.connection(&self.commands).await?;
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.discard(&self.commands, &e).await;
                Err(e.into())
            }
        }
    }

    async fn run_pipeline(&self, pipe: &redis::Pipeline) -> Result<()> {
        let mut conn = self.connection(&self.commands).await?;
        match pipe.query_async::<_, ()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.discard(&self.commands, &e).await;
                Err(e.into())
            }
        }
    }

    async fn run_script<T: redis::FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T> {
        let mut conn = self.connection(&self.commands).await?;
        match invocation.invoke_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.discard(&self.commands, &e).await;
                Err(e.into())
            }
        }
    }

    async fn promote_due(&self) -> Result<usize> {
        let mut invocation = self.scripts.promote.prepare_invoke();
        invocation
            .key(&self.keys.delayed)
            .key(&self.keys.ready)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH);
        self.run_script(&invocation).await
    }

    /// Move the oldest ready document into the processing list
    async fn take_ready(&self, wait: Duration) -> Result<Option<String>> {
        let mut conn = self.connection(&self.blocking).await?;
        let seconds = wait.as_secs_f64().max(MIN_BLOCK_SECONDS);
        let moved: redis::RedisResult<Option<String>> = redis::cmd("BLMOVE")
            .arg(&self.keys.ready)
            .arg(&self.keys.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(seconds)
            .query_async(&mut conn)
            .await;

        match moved {
            Ok(raw) => Ok(raw),
            Err(e) => {
                self.discard(&self.blocking, &e).await;
                Err(e.into())
            }
        }
    }

    /// Remove `held` from the processing list and write `snapshot` in one step.
    ///
    /// Returns false when `held` was no longer in the processing list.
    async fn settle(&self, held: &str, snapshot: &Job, then: Then<'_>) -> Result<bool> {
        let document = encode(snapshot)?;
        let mut invocation = self.scripts.settle.prepare_invoke();
        invocation
            .key(&self.keys.processing)
            .key(&self.keys.leases)
            .key(&self.keys.jobs);
        match then {
            Then::Nothing => {
                invocation
                    .key(&self.keys.dead)
                    .arg(held)
                    .arg(snapshot.id.to_string())
                    .arg(&document)
                    .arg("none")
                    .arg(0)
                    .arg("");
            }
            Then::Schedule { at_ms, entry } => {
                invocation
                    .key(&self.keys.delayed)
                    .arg(held)
                    .arg(snapshot.id.to_string())
                    .arg(&document)
                    .arg("zadd")
                    .arg(at_ms)
                    .arg(entry);
            }
            Then::Push { list, entry } => {
                invocation
                    .key(list)
                    .arg(held)
                    .arg(snapshot.id.to_string())
                    .arg(&document)
                    .arg("lpush")
                    .arg(0)
                    .arg(entry);
            }
        }
        let settled: i64 = self.run_script(&invocation).await?;
        Ok(settled == 1)
    }

    /// Park a document that cannot be decoded
    async fn dead_letter_raw(&self, raw: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(raw)
            .ignore()
            .cmd("ZREM")
            .arg(&self.keys.leases)
            .arg(raw)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.keys.dead)
            .arg(raw)
            .ignore();
        self.run_pipeline(&pipe).await
    }

    fn held_document(&self, job: &Job) -> Result<String> {
        self.held
            .lock()
            .get(&(job.id, job.attempts))
            .cloned()
            .ok_or(Error::DeliveryReleased(job.id))
    }

    /// Settle a delivery of this process and forget it
    async fn acknowledge(&self, job: &Job, snapshot: &Job, then: Then<'_>) -> Result<()> {
        let held = self.held_document(job)?;
        let settled = self.settle(&held, snapshot, then).await?;
        self.held.lock().remove(&(job.id, job.attempts));
        if settled {
            Ok(())
        } else {
            Err(Error::DeliveryReleased(job.id))
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Broker(format!("failed to encode job: {e}")))
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[tracing::instrument(skip(self, job), fields(job.id = %job.id, job.type = %job.job_type), err)]
    async fn publish(&self, job: &Job) -> Result<()> {
        let document = encode(job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&self.keys.jobs)
            .arg(job.id.to_string())
            .arg(&document)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.keys.ready)
            .arg(&document)
            .ignore();
        self.run_pipeline(&pipe).await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Job>> {
        let promoted = self.promote_due().await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted due retries to the ready list");
        }

        let Some(raw) = self.take_ready(wait).await? else {
            return Ok(None);
        };

        let mut job: Job = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Dead-lettering undecodable broker message");
                self.dead_letter_raw(&raw).await?;
                return Ok(None);
            }
        };

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.updated_at = Utc::now();

        // If this fails the document stays in the processing list for the reaper
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(&self.keys.leases)
            .arg(job.updated_at.timestamp_millis())
            .arg(&raw)
            .ignore()
            .cmd("HSET")
            .arg(&self.keys.jobs)
            .arg(job.id.to_string())
            .arg(encode(&job)?)
            .ignore();
        self.run_pipeline(&pipe).await?;

        self.held.lock().insert((job.id, job.attempts), raw);
        Ok(Some(job))
    }

    async fn complete(&self, job: &Job, result: Value) -> Result<Job> {
        let mut done = job.clone();
        done.status = JobStatus::Completed;
        done.result = Some(result);
        done.updated_at = Utc::now();
        self.acknowledge(job, &done, Then::Nothing).await?;
        Ok(done)
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailureDisposition> {
        let now = Utc::now();
        let disposition = self.retry.disposition(job.attempts);
        let mut failed = job.clone();
        failed.last_error = Some(error.to_string());
        failed.updated_at = now;

        match &disposition {
            FailureDisposition::Retry { delay, .. } => {
                failed.status = JobStatus::Pending;
                failed.run_after = now
                    + chrono::Duration::from_std(*delay).unwrap_or_else(|_| chrono::Duration::zero());
                let document = encode(&failed)?;
                let then = Then::Schedule {
                    at_ms: failed.run_after.timestamp_millis(),
                    entry: &document,
                };
                self.acknowledge(job, &failed, then).await?;
            }
            FailureDisposition::DeadLettered { .. } => {
                failed.status = JobStatus::Failed;
                let dead = encode(&DeadLetter {
                    job: failed.clone(),
                    error: error.to_string(),
                    failed_at: now,
                })?;
                let then = Then::Push {
                    list: &self.keys.dead,
                    entry: &dead,
                };
                self.acknowledge(job, &failed, then).await?;
            }
        }
        Ok(disposition)
    }

    async fn requeue_stale(&self, stale_after: Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let mut invocation = self.scripts.find_stale.prepare_invoke();
        invocation
            .key(&self.keys.processing)
            .key(&self.keys.leases)
            .arg(now.timestamp_millis())
            .arg(cutoff.timestamp_millis());
        let stale: Vec<String> = self.run_script(&invocation).await?;

        let mut requeued = 0;
        for raw in stale {
            let delivered: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(error = %e, "Dead-lettering undecodable broker message");
                    self.dead_letter_raw(&raw).await?;
                    continue;
                }
            };

            // The snapshot carries the attempt count of the lost delivery
            let mut job = match self.get(delivered.id).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => delivered,
                Err(e) => {
                    tracing::warn!(job.id = %delivered.id, error = %e, "Unreadable snapshot; requeueing the delivered document");
                    delivered
                }
            };
            job.status = JobStatus::Pending;
            job.updated_at = Utc::now();

            let document = encode(&job)?;
            let then = Then::Push {
                list: &self.keys.ready,
                entry: &document,
            };
            if self.settle(&raw, &job, then).await? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let raw: Option<String> = self
            .run(redis::cmd("HGET").arg(&self.keys.jobs).arg(id.to_string()))
            .await?;

        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| Error::Broker(format!("failed to decode job snapshot: {e}")))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_prefix() {
        let keys = Keys::new("quire:jobs");
        assert_eq!(keys.ready, "quire:jobs:ready");
        assert_eq!(keys.processing, "quire:jobs:processing");
        assert_eq!(keys.leases, "quire:jobs:leases");
        assert_eq!(keys.delayed, "quire:jobs:delayed");
        assert_eq!(keys.jobs, "quire:jobs:jobs");
        assert_eq!(keys.dead, "quire:jobs:dead");
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RedisBroker::new("not a url", "quire", BrokerRetry::default()).is_err());
    }

    /// Broker against `TEST_REDIS_URL` under a fresh key prefix
    fn live_broker() -> Option<RedisBroker> {
        let Ok(url) = std::env::var("TEST_REDIS_URL") else {
            eprintln!("TEST_REDIS_URL not set; skipping redis test");
            return None;
        };
        let prefix = format!("quire-test:{}", Uuid::new_v4().simple());
        let retry = BrokerRetry {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        Some(RedisBroker::new(&url, &prefix, retry).unwrap())
    }

    fn job() -> Job {
        Job::new_pending(
            crate::queue::JobType::Generate,
            serde_json::json!({"userId": "U1", "batchId": "B1"}),
        )
    }

    #[tokio::test]
    async fn stale_delivery_is_requeued_and_loses_its_hold() {
        let Some(broker) = live_broker() else { return };
        let job = job();
        broker.publish(&job).await.unwrap();

        let first = broker.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        assert_eq!(broker.requeue_stale(Duration::from_secs(60)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.requeue_stale(Duration::from_millis(10)).await.unwrap(), 1);
        let snapshot = broker.get(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.attempts, 1);

        let second = broker.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        assert!(matches!(
            broker.complete(&first, serde_json::json!({"late": true})).await,
            Err(Error::DeliveryReleased(id)) if id == job.id
        ));
        broker.complete(&second, serde_json::json!({"ok": true})).await.unwrap();

        let snapshot = broker.get(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(broker.requeue_stale(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_scheduled_then_redelivered() {
        let Some(broker) = live_broker() else { return };
        let job = job();
        broker.publish(&job).await.unwrap();

        let first = broker.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        let disposition = broker.fail(&first, "boom").await.unwrap();
        assert!(matches!(disposition, FailureDisposition::Retry { attempts: 1, .. }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = broker.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(second.id, job.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn missing_url_is_a_config_error() {
        let config = crate::config::BrokerConfig::default();
        assert!(matches!(
            RedisBroker::from_config(&config),
            Err(Error::Config(_))
        ));
    }
}
