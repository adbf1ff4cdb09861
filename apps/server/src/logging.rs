//! Logging and OpenTelemetry setup for the queue binaries
//!
//! Console output is JSON or human-readable, optionally mirrored to a rotating
//! file. `RUST_LOG` overrides the configured level. When enabled, spans are
//! exported over OTLP so a job can be followed from enqueue to completion.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, TracerProvider},
    Resource,
};
use std::fs;
use std::time::Duration;
use tracing_appender::{non_blocking::WorkerGuard, rolling::Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Crates whose logs follow `logging.level`
const OWN_TARGETS: &[&str] = &["quire", "quire_server", "quire_worker"];

/// Keeps the file writer and tracer provider alive; shuts telemetry down on drop
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize logging from configuration.
///
/// An OpenTelemetry exporter that fails to start is reported and skipped;
/// logging itself still comes up.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<TelemetryGuard> {
    let mut otel_init_error: Option<String> = None;
    let tracer_provider = if config.opentelemetry_enabled {
        match init_tracer_provider(config) {
            Ok(provider) => Some(provider),
            Err(e) => {
                otel_init_error = Some(e.to_string());
                None
            }
        }
    } else {
        None
    };

    let env_filter = build_env_filter(config);

    let file_guard = match &tracer_provider {
        Some(provider) => {
            let otel_layer = tracing_opentelemetry::layer()
                .with_tracer(provider.tracer(config.service_name.clone()))
                .with_tracked_inactivity(true);
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(otel_layer);
            init_output_layers(subscriber, config)?
        }
        None => init_output_layers(tracing_subscriber::registry().with(env_filter), config)?,
    };

    if let Some(provider) = tracer_provider {
        global::set_tracer_provider(provider);
    }

    if let Some(err) = otel_init_error {
        tracing::warn!(
            error = %err,
            "Failed to initialize OpenTelemetry tracer provider, continuing without OpenTelemetry"
        );
    }

    tracing::info!(
        otel_enabled = config.opentelemetry_enabled,
        service_name = %config.service_name,
        environment = %config.deployment_environment,
        json = config.json,
        "Logging initialized"
    );

    Ok(TelemetryGuard {
        _file_guard: file_guard,
    })
}

fn build_resource_attributes(config: &LoggingConfig) -> Resource {
    let service_version = config
        .service_version
        .clone()
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", service_version),
        KeyValue::new(
            "deployment.environment",
            config.deployment_environment.clone(),
        ),
    ])
}

fn init_tracer_provider(config: &LoggingConfig) -> anyhow::Result<TracerProvider> {
    use opentelemetry_sdk::trace::Config;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&config.otlp_endpoint)
        .with_timeout(Duration::from_secs(config.otlp_timeout_seconds))
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to create OTLP exporter: {}", e))?;

    let trace_config = Config::default()
        .with_sampler(sampler(config.trace_sample_ratio))
        .with_resource(build_resource_attributes(config));

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(trace_config)
        .build())
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
    }
}

fn default_directives(level: &str) -> String {
    let mut directives: Vec<String> = OWN_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect();
    // sqlx logs every statement at info
    directives.extend(
        ["tower_http=info", "sqlx=warn", "redis=warn", "reqwest=warn"]
            .iter()
            .map(|d| d.to_string()),
    );
    directives.join(",")
}

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)))
}

/// Attach console (and optionally file) output to `subscriber` and install it
fn init_output_layers<S>(
    subscriber: S,
    config: &LoggingConfig,
) -> anyhow::Result<Option<WorkerGuard>>
where
    S: SubscriberExt
        + for<'a> tracing_subscriber::registry::LookupSpan<'a>
        + tracing::Subscriber
        + Send
        + Sync
        + 'static,
{
    let (file_writer, file_guard) = if config.file_enabled {
        let (writer, guard) = create_file_appender(config)?;
        (Some(writer), Some(guard))
    } else {
        (None, None)
    };

    if config.json {
        let console = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stdout);
        let file = file_writer.map(|writer| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(writer)
        });
        subscriber.with(console).with(file).try_init()?;
    } else {
        let console = fmt::layer().with_target(true).with_writer(std::io::stdout);
        let file = file_writer.map(|writer| {
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
        });
        subscriber.with(console).with(file).try_init()?;
    }

    Ok(file_guard)
}

fn rotation(name: &str) -> Rotation {
    match name {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

fn create_file_appender(
    config: &LoggingConfig,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.file_directory)?;

    let appender = tracing_appender::rolling::RollingFileAppender::new(
        rotation(&config.file_rotation),
        &config.file_directory,
        format!("{}.log", config.file_prefix),
    );

    Ok(tracing_appender::non_blocking(appender))
}

/// Flush and stop the global tracer provider
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// Console-only logging driven by `RUST_LOG`, for the operator CLI.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_simple_logging(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives(default_level))),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        shutdown_telemetry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_cover_own_crates() {
        let directives = default_directives("debug");
        assert!(directives.contains("quire=debug"));
        assert!(directives.contains("quire_worker=debug"));
        assert!(directives.contains("sqlx=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn unknown_rotation_falls_back_to_daily() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn sampler_ratio_bounds() {
        assert!(matches!(sampler(1.0), Sampler::AlwaysOn));
        assert!(matches!(sampler(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler(0.5), Sampler::ParentBased(_)));
    }
}
