use std::env;

use opentelemetry::{
    global,
    propagation::TextMapCompositePropagator,
    trace::TraceError,
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace::Tracer, Resource};
use tracing_core::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer, Registry,
};

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to install otlp trace pipeline: {0}")]
    Trace(#[from] TraceError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: String,
    /// Export spans over otlp. Logs are always written to stdout.
    pub export: bool,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            export: true,
            log_format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Reads `SERVICE_NAME`, `OTEL_EXPORTER_OTLP_ENDPOINT`,
    /// `OTEL_SDK_DISABLED` and `LOG_FORMAT`, falling back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        TelemetryConfig {
            service_name: lookup("SERVICE_NAME").unwrap_or(defaults.service_name),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or(defaults.otlp_endpoint),
            export: !lookup("OTEL_SDK_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
        }
    }
}

/// Flushes and shuts down span export when dropped.
#[must_use = "dropping the guard shuts down span export"]
#[derive(Debug)]
pub struct TelemetryGuard {
    exporting: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.exporting {
            teardown();
        }
    }
}

/// Sets up tracing and logging with the configuration found in the
/// environment, see [`TelemetryConfig::from_env`]. By default, spans are
/// exported to `http://localhost:4317`.
///
/// This should generally be the first statement of any server binary's main
/// function. It has to run inside a tokio runtime, spans are exported from a
/// background task.
pub fn setup() -> Result<TelemetryGuard, SetupError> {
    setup_with(TelemetryConfig::from_env())
}

pub fn setup_with(config: TelemetryConfig) -> Result<TelemetryGuard, SetupError> {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
    ]));

    let tracer = if config.export {
        Some(init_tracer(&config)?)
    } else {
        None
    };

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };

    Registry::default()
        .with(fmt_layer)
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        }))
        .try_init()?;

    tracing::info!(
        service.name = %config.service_name,
        export = config.export,
        "starting server"
    );
    Ok(TelemetryGuard {
        exporting: config.export,
    })
}

fn init_tracer(config: &TelemetryConfig) -> Result<Tracer, TraceError> {
    let resource = Resource::new(vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        config.service_name.clone(),
    )]);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.otlp_endpoint.clone()),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
}

/// Flushes pending spans and shuts the tracer provider down.
pub fn teardown() {
    global::shutdown_tracer_provider();
}
