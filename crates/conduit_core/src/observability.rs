//! Tracing subscriber setup and OpenTelemetry counters.
//!
//! Counter helpers compile to no-ops unless the `metrics` feature is enabled,
//! so the dispatcher and gateway can call them unconditionally.

#[cfg(feature = "metrics")]
use opentelemetry::{KeyValue, global};
#[cfg(feature = "metrics")]
use opentelemetry_otlp::{MetricExporter as OtlpExporter, WithExportConfig};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};
#[cfg(feature = "metrics")]
use opentelemetry_stdout::MetricExporter as StdoutExporter;
#[cfg(feature = "metrics")]
use std::time::Duration;

use conduit_error::ConfigError;
use tracing::{info, instrument};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "metrics")]
const METER_NAME: &str = "conduit";

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Install a global tracing subscriber filtered by `RUST_LOG` (default `info`).
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    };
    result.map_err(|e| ConfigError::new(format!("Failed to install tracing subscriber: {}", e)))
}

/// Initialize OpenTelemetry metrics with OTLP or stdout export.
///
/// `OTEL_EXPORTER=otlp` sends to `OTEL_EXPORTER_OTLP_ENDPOINT`
/// (default `http://localhost:4318`); anything else uses stdout.
///
/// When the `metrics` feature is disabled this returns `Ok(())` immediately.
#[instrument(skip_all, fields(service_name))]
pub fn init_metrics(service_name: &'static str, export_interval_secs: u64) -> Result<(), ConfigError> {
    #[cfg(not(feature = "metrics"))]
    {
        let _ = export_interval_secs;
        info!(service_name, "Metrics feature disabled, skipping metrics initialization");
        Ok(())
    }

    #[cfg(feature = "metrics")]
    {
        let resource = Resource::builder_empty()
            .with_attributes([KeyValue::new("service.name", service_name)])
            .build();
        let interval = Duration::from_secs(export_interval_secs);

        let exporter_type = std::env::var("OTEL_EXPORTER").unwrap_or_else(|_| "stdout".to_string());
        info!(exporter_type = %exporter_type, export_interval_secs, "Initializing metrics");

        let meter_provider = match exporter_type.as_str() {
            "otlp" => {
                let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:4318".to_string());
                let exporter = OtlpExporter::builder()
                    .with_http()
                    .with_endpoint(&endpoint)
                    .with_timeout(Duration::from_secs(10))
                    .build()
                    .map_err(|e| ConfigError::new(format!("Failed to create OTLP exporter: {}", e)))?;
                let reader = PeriodicReader::builder(exporter).with_interval(interval).build();
                SdkMeterProvider::builder()
                    .with_resource(resource)
                    .with_reader(reader)
                    .build()
            }
            _ => {
                let reader = PeriodicReader::builder(StdoutExporter::default())
                    .with_interval(interval)
                    .build();
                SdkMeterProvider::builder()
                    .with_resource(resource)
                    .with_reader(reader)
                    .build()
            }
        };

        global::set_meter_provider(meter_provider);
        info!(service_name, "Meter provider registered globally");
        Ok(())
    }
}

/// Count one completed REST attempt.
pub fn record_rest_response(route: &str, status: u16) {
    #[cfg(feature = "metrics")]
    global::meter(METER_NAME)
        .u64_counter("conduit.rest.responses")
        .build()
        .add(
            1,
            &[
                KeyValue::new("route", route.to_string()),
                KeyValue::new("status", i64::from(status)),
            ],
        );
    #[cfg(not(feature = "metrics"))]
    let _ = (route, status);
}

/// Count one 429 response.
pub fn record_rate_limited(route: &str, scope: &str) {
    #[cfg(feature = "metrics")]
    global::meter(METER_NAME)
        .u64_counter("conduit.rest.rate_limited")
        .build()
        .add(
            1,
            &[
                KeyValue::new("route", route.to_string()),
                KeyValue::new("scope", scope.to_string()),
            ],
        );
    #[cfg(not(feature = "metrics"))]
    let _ = (route, scope);
}

/// Count one gateway lifecycle transition (connected, resumed, reconnecting...).
pub fn record_gateway_lifecycle(shard: u32, event: &str) {
    #[cfg(feature = "metrics")]
    global::meter(METER_NAME)
        .u64_counter("conduit.gateway.lifecycle")
        .build()
        .add(
            1,
            &[
                KeyValue::new("shard", i64::from(shard)),
                KeyValue::new("event", event.to_string()),
            ],
        );
    #[cfg(not(feature = "metrics"))]
    let _ = (shard, event);
}

/// Count one dispatched gateway event.
pub fn record_gateway_event(shard: u32, name: &str) {
    #[cfg(feature = "metrics")]
    global::meter(METER_NAME)
        .u64_counter("conduit.gateway.events")
        .build()
        .add(
            1,
            &[
                KeyValue::new("shard", i64::from(shard)),
                KeyValue::new("event", name.to_string()),
            ],
        );
    #[cfg(not(feature = "metrics"))]
    let _ = (shard, name);
}
