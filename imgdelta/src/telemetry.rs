//! Process-wide tracing and metrics setup for `imgdeltad`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::MeterProvider as SdkMeterProvider;
use opentelemetry_sdk::trace::{self, Sampler, Tracer};
use prometheus::{Encoder, TextEncoder};
use tracing::warn;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

fn service_resource() -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", "imgdelta"),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ])
}

/// Install the global subscriber, exporting spans over OTLP when a tracer is given.
pub fn init_subscriber(tracer: Option<Tracer>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(tracer.map(OpenTelemetryLayer::new))
        .init();
}

/// OTLP tracer, if a collector endpoint is configured.
pub fn otlp_tracer() -> anyhow::Result<Option<Tracer>> {
    let Ok(endpoint) = std::env::var(OTLP_ENDPOINT_VAR) else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace::config().with_sampler(Sampler::AlwaysOn).with_resource(service_resource()))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;
    Ok(Some(tracer))
}

/// Meters backed by a Prometheus registry scraped on `/metrics`.
pub struct Metrics {
    registry: prometheus::Registry,
    provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter().with_registry(registry.clone()).build()?;
        let provider = SdkMeterProvider::builder()
            .with_resource(service_resource())
            .with_reader(exporter)
            .build();
        Ok(Self { registry, provider })
    }

    pub fn meter(&self) -> Meter {
        self.provider.meter("imgdelta")
    }

    pub fn registry(&self) -> prometheus::Registry {
        self.registry.clone()
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.provider.shutdown() {
            warn!("Failed to shut down meter provider: {}", e);
        }
    }
}

/// Render the registry in the Prometheus text format.
pub async fn render(registry: prometheus::Registry) -> Response {
    let mut body = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut body) {
        warn!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response();
    }
    match String::from_utf8(body) {
        Ok(text) => text.into_response(),
        Err(e) => {
            warn!("Metrics are not valid UTF-8: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}
