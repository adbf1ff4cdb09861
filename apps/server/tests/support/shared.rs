use std::sync::Arc;
use quire::Config;
use tokio::sync::OnceCell;

static SHARED: OnceCell<Arc<SharedTestResources>> = OnceCell::const_new();

pub struct SharedTestResources {
    pub base_config: Config,
    /// Postgres for the store-backed tests; `None` skips them
    pub database_url: Option<String>,
}

pub async fn shared() -> anyhow::Result<Arc<SharedTestResources>> {
    SHARED
        .get_or_try_init(|| async {
            init_tracing();

            // Defaults only: a developer's config file must not change test timing.
            let mut config = Config::default();
            config.workers.embedded = false;
            config.database.run_migrations = true;
            config.database.pool_min_size = 0;
            config.database.pool_max_size = 2;

            let database_url = std::env::var("TEST_DATABASE_URL").ok().or_else(|| {
                Config::load()
                    .ok()
                    .and_then(|loaded| loaded.database.test_database_url)
            });

            Ok(Arc::new(SharedTestResources {
                base_config: config,
                database_url,
            }))
        })
        .await
        .cloned()
}

fn init_tracing() {
    use std::sync::OnceLock;
    use tracing_subscriber::prelude::*;
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "quire=info,sqlx=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}
