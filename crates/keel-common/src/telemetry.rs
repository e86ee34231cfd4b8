use std::collections::HashMap;

use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Reported as `service.name` (e.g. "keel-server").
    pub service_name: String,
    /// OTLP/HTTP base URL; the exporter appends `/v1/traces`.
    pub otlp_endpoint: Option<String>,
    /// Bearer token sent with every export request.
    pub otlp_token: Option<String>,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: Option<String>,
}

/// Keeps the tracer provider alive; flushes pending spans on drop.
#[must_use = "dropping the guard shuts down span export"]
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl TelemetryGuard {
    pub fn otlp_enabled(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {err}");
            }
        }
    }
}

/// Install the global subscriber: env filter, fmt output, and an OTLP layer
/// when an endpoint is configured. Exporter build failures fall back to
/// fmt-only logging.
pub fn init_tracing(cfg: &TelemetryConfig) -> TelemetryGuard {
    let default_filter = cfg.default_filter.as_deref().unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer();

    let provider = cfg
        .otlp_endpoint
        .as_deref()
        .filter(|e| !e.is_empty())
        .and_then(|endpoint| build_provider(&cfg.service_name, endpoint, cfg.otlp_token.as_deref()));

    match &provider {
        Some(provider) => {
            let otel_layer = tracing_opentelemetry::layer()
                .with_tracer(provider.tracer(cfg.service_name.clone()));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otel_layer)
                .init();
            tracing::info!(service = %cfg.service_name, "OTLP tracing enabled");
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
        }
    }

    TelemetryGuard { provider }
}

fn build_provider(service_name: &str, endpoint: &str, token: Option<&str>) -> Option<TracerProvider> {
    let mut headers = HashMap::new();
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(headers)
        .build()
    {
        Ok(e) => e,
        Err(err) => {
            // the subscriber is not installed yet
            eprintln!("failed to create OTLP exporter: {err}, falling back to stdout only");
            return None;
        }
    };

    Some(
        TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(Resource::new([KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]))
            .build(),
    )
}
