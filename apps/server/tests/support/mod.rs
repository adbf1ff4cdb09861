pub mod shared;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use futures::FutureExt as _;
use quire::{
    api::create_router,
    broker::{Broker, BrokerRetry, MemoryBroker},
    config::QueueBackend,
    queue::{
        GeneratePayload, Job, JobStatus, JobStore, JobType, MemoryJobStore, MemoryNotifier,
        Notifier,
    },
    state::{AppStateOptions, JobStoreKind, QueueBackends},
    workers::{
        BrokerRunner, ContentGenerator, Dispatcher, GenerateHandler, HandlerRegistry, JobHandler,
        WorkerRunner, WorkerRunnerConfig,
    },
    AppState,
};
use serde_json::{json, Value};
use sqlx::Connection as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tower::ServiceExt as _;
use uuid::Uuid;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn generate_payload() -> Value {
    json!({ "userId": "U1", "batchId": "B1", "prompt": "three haiku about queues" })
}

/// Generator that answers immediately without leaving the process
pub struct StubGenerator;

#[async_trait]
impl ContentGenerator for StubGenerator {
    async fn generate(&self, _job_id: Uuid, payload: &GeneratePayload) -> anyhow::Result<Value> {
        Ok(json!({ "text": format!("content for {}", payload.user_id) }))
    }
}

/// Handler that always fails
pub struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    fn name(&self) -> &str {
        "FailingHandler"
    }

    fn job_type(&self) -> JobType {
        JobType::Generate
    }

    async fn handle(&self, _job: &Job) -> anyhow::Result<Value> {
        anyhow::bail!("generator exploded")
    }
}

/// Handler that fails its first `failures` calls, then succeeds
pub struct FlakyHandler {
    failures: u32,
    pub calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn name(&self) -> &str {
        "FlakyHandler"
    }

    fn job_type(&self) -> JobType {
        JobType::Generate
    }

    async fn handle(&self, _job: &Job) -> anyhow::Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("transient failure {call}");
        }
        Ok(json!({ "ok": true, "call": call }))
    }
}

/// Handler that parks every call until the test releases it
#[derive(Default)]
pub struct GatedHandler {
    release: Notify,
    pub started: AtomicU32,
    pub finished: AtomicU32,
}

impl GatedHandler {
    /// Let one parked (or the next) call finish
    pub fn release(&self) {
        self.release.notify_one();
    }

    pub async fn wait_started(&self, calls: u32) -> anyhow::Result<()> {
        wait_until(|| self.started.load(Ordering::SeqCst) >= calls).await
    }

    pub async fn wait_finished(&self, calls: u32) -> anyhow::Result<()> {
        wait_until(|| self.finished.load(Ordering::SeqCst) >= calls).await
    }
}

#[async_trait]
impl JobHandler for GatedHandler {
    fn name(&self) -> &str {
        "GatedHandler"
    }

    fn job_type(&self) -> JobType {
        JobType::Generate
    }

    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": true, "attempt": job.attempts }))
    }
}

async fn wait_until(condition: impl Fn() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("condition not reached in time")
}

pub fn stub_handlers() -> HandlerRegistry {
    HandlerRegistry::new().with(Arc::new(GenerateHandler::new(Arc::new(StubGenerator))))
}

pub fn handlers_with(handler: Arc<dyn JobHandler>) -> HandlerRegistry {
    HandlerRegistry::new().with(handler)
}

/// Runner timings for tests: only notifications wake the worker unless a
/// test shortens the sweep.
pub fn runner_config() -> WorkerRunnerConfig {
    WorkerRunnerConfig {
        reconnect_initial: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        reconnect_jitter_ratio: 0.0,
        sweep_interval: Duration::from_secs(3600),
        pending_grace: Duration::ZERO,
        reaper_interval: Duration::from_secs(3600),
        stale_after: Duration::from_secs(900),
        batch_size: 100,
        max_consecutive_store_errors: 3,
    }
}

pub fn sweeping_runner_config() -> WorkerRunnerConfig {
    WorkerRunnerConfig {
        sweep_interval: Duration::from_millis(50),
        ..runner_config()
    }
}

pub fn fast_broker_retry() -> BrokerRetry {
    BrokerRetry {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

/// Running worker loops plus the switch that stops them
pub struct TestWorker {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<quire::Result<()>>>,
}

impl TestWorker {
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_finished())
    }

    /// Request shutdown and wait for every loop to return
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            tokio::time::timeout(WAIT_TIMEOUT, handle)
                .await
                .context("worker did not stop in time")?
                .context("worker task panicked")??;
        }
        Ok(())
    }

    /// Wait for the loops to exit on their own
    pub async fn join(self) -> anyhow::Result<Vec<quire::Result<()>>> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let result = tokio::time::timeout(WAIT_TIMEOUT, handle)
                .await
                .context("worker did not exit in time")?
                .context("worker task panicked")?;
            results.push(result);
        }
        Ok(results)
    }
}

/// Start a store runner over `backends`
pub fn spawn_store_worker(
    backends: &QueueBackends,
    handlers: HandlerRegistry,
    config: WorkerRunnerConfig,
) -> TestWorker {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let dispatcher = Dispatcher::new(
        backends.store.clone(),
        handlers,
        quire::queue::RetryPolicy::default(),
    );
    let runner = WorkerRunner::new(dispatcher, backends.notifier.clone(), config);
    let handle = tokio::spawn(async move { runner.run(Some(shutdown_rx)).await });
    TestWorker {
        shutdown,
        handles: vec![handle],
    }
}

/// Poll `enqueuer.get` until the job reaches `status`
pub async fn wait_for_status(state: &AppState, id: Uuid, status: JobStatus) -> anyhow::Result<Job> {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let job = state.enqueuer.get(id).await?;
        match job {
            Some(job) if job.status == status => return Ok(job),
            other => {
                if tokio::time::Instant::now() >= deadline {
                    anyhow::bail!("job {id} never reached {status}; last seen {other:?}");
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn to_json_body(value: &Value) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(actual, expected, "unexpected status for {context}");
}

async fn send(
    router: &Router,
    method: Method,
    path_and_query: &str,
    body: Option<Bytes>,
) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
    let request = Request::builder()
        .method(method)
        .uri(path_and_query)
        .header("host", "example.org")
        .header("accept", "application/json")
        .header("content-type", "application/json")
        .body(match body {
            Some(bytes) => Body::from(bytes),
            None => Body::empty(),
        })
        .context("build request")?;

    let response = router
        .clone()
        .oneshot(request)
        .await
        .context("dispatch request")?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .context("read response body")?;

    Ok((status, headers, body))
}

/// Router and state over in-process backends
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryJobStore>,
    pub notifier: Arc<MemoryNotifier>,
    pub broker: Option<Arc<MemoryBroker>>,
}

impl TestApp {
    pub async fn new() -> anyhow::Result<Self> {
        Self::build(None).await
    }

    /// Enqueue through a memory broker, falling back to the store
    pub async fn with_memory_broker() -> anyhow::Result<Self> {
        Self::build(Some(Arc::new(MemoryBroker::new(fast_broker_retry())))).await
    }

    async fn build(broker: Option<Arc<MemoryBroker>>) -> anyhow::Result<Self> {
        let shared = shared::shared().await?;
        let mut config = shared.base_config.clone();
        if broker.is_some() {
            config.queue.backend = QueueBackend::Memory;
        }

        let store = Arc::new(MemoryJobStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let backends = QueueBackends {
            store: store.clone(),
            notifier: notifier.clone(),
            broker: broker.clone().map(|b| b as Arc<dyn Broker>),
            db_pool: None,
        };

        let state = AppState::from_backends(config, backends);
        let router = create_router(state.clone());

        Ok(Self {
            router,
            state,
            store,
            notifier,
            broker,
        })
    }

    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        send(&self.router, method, path_and_query, body).await
    }

    /// `POST /jobs` and return the created job
    pub async fn submit(&self, job_type: &str, payload: Value) -> anyhow::Result<Job> {
        let body = json!({ "type": job_type, "payload": payload });
        let (status, _headers, body) = self
            .request(Method::POST, "/jobs", Some(to_json_body(&body)?))
            .await?;
        assert_status(status, StatusCode::CREATED, "POST /jobs");
        Ok(serde_json::from_slice(&body)?)
    }

    /// Start a store runner and wait until it is subscribed
    pub async fn spawn_worker(
        &self,
        handlers: HandlerRegistry,
        config: WorkerRunnerConfig,
    ) -> anyhow::Result<TestWorker> {
        let worker = spawn_store_worker(&self.state.backends, handlers, config);
        self.wait_until_listening().await?;
        Ok(worker)
    }

    /// Start a broker runner; no store runner alongside it
    pub fn spawn_broker_worker(&self, handlers: HandlerRegistry) -> anyhow::Result<TestWorker> {
        let broker = self
            .state
            .backends
            .broker
            .clone()
            .context("app has no broker")?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = BrokerRunner::new(broker, handlers, Duration::from_millis(50), runner_config());
        let handle = tokio::spawn(async move { runner.run(Some(shutdown_rx)).await });
        Ok(TestWorker {
            shutdown,
            handles: vec![handle],
        })
    }

    pub async fn wait_until_listening(&self) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.notifier.subscriber_count() == 0 {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("worker never subscribed to notifications");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    pub async fn publish_signal(&self, id: Uuid) -> anyhow::Result<()> {
        self.notifier.publish(id).await?;
        Ok(())
    }
}

/// Router and state over Postgres in a throwaway schema
pub struct PgTestApp {
    pub router: Router,
    pub state: AppState,
    pub channel: String,
    schema: String,
    admin_database_url: String,
}

impl PgTestApp {
    async fn new(database_url: &str) -> anyhow::Result<Self> {
        let shared = shared::shared().await?;
        let mut config = shared.base_config.clone();

        let suffix = Uuid::new_v4().simple().to_string();
        let schema = format!("test_{}", suffix);
        let mut admin_conn = sqlx::PgConnection::connect(database_url)
            .await
            .context("connect admin db for schema create")?;
        sqlx::query(&format!(r#"CREATE SCHEMA "{}""#, schema))
            .execute(&mut admin_conn)
            .await
            .context("create test schema")?;

        // Own channel per test so parallel tests do not wake each other.
        let channel = format!("jobs_{}", suffix);
        config.database.url = with_search_path(database_url, &schema);
        config.queue.channel = channel.clone();

        let state = AppState::new_with_options(
            config,
            AppStateOptions {
                run_migrations: true,
                job_store: JobStoreKind::Postgres,
            },
        )
        .await
        .context("initialize AppState")?;

        let router = create_router(state.clone());

        Ok(Self {
            router,
            state,
            channel,
            schema,
            admin_database_url: database_url.to_string(),
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.state.backends.store
    }

    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        send(&self.router, method, path_and_query, body).await
    }

    /// Wait until some session is listening on this test's channel
    pub async fn wait_until_listening(&self) -> anyhow::Result<()> {
        let pool = self
            .state
            .backends
            .db_pool
            .as_ref()
            .context("postgres app without a pool")?;
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let listening: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM pg_stat_activity WHERE query ILIKE 'LISTEN%' AND query LIKE '%' || $1 || '%'",
            )
            .bind(&self.channel)
            .fetch_one(pool)
            .await?;
            if listening > 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("worker never listened on {}", self.channel);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn cleanup(self) -> anyhow::Result<()> {
        if let Some(pool) = &self.state.backends.db_pool {
            pool.close().await;
        }

        let mut admin_conn = sqlx::PgConnection::connect(&self.admin_database_url)
            .await
            .context("connect admin db for schema drop")?;
        sqlx::query(&format!(r#"DROP SCHEMA "{}" CASCADE"#, self.schema))
            .execute(&mut admin_conn)
            .await
            .context("drop test schema")?;

        Ok(())
    }
}

/// Run `f` against a fresh Postgres schema; skipped when no test database is configured
pub async fn with_pg_app<F>(f: F) -> anyhow::Result<()>
where
    F: for<'a> FnOnce(
        &'a PgTestApp,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + 'a>,
    >,
{
    let shared = shared::shared().await?;
    let Some(database_url) = shared.database_url.clone() else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
        return Ok(());
    };

    let app = PgTestApp::new(&database_url).await?;

    let result = std::panic::AssertUnwindSafe(f(&app)).catch_unwind().await;
    let cleanup_result = app.cleanup().await;

    if let Err(e) = cleanup_result {
        eprintln!("test schema cleanup failed: {e:?}");
    }

    match result {
        Ok(r) => r,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn with_search_path(database_url: &str, schema: &str) -> String {
    let separator = if database_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}options=-c%20search_path%3D{}",
        database_url, separator, schema
    )
}
