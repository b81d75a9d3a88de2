use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "courier";

/// Target of the structured message lifecycle events written to the event log.
pub const MESSAGE_TARGET: &str = "message";

/// Installs the global subscriber.
///
/// Without `otel_endpoint`, text logs go to a daily rolling `root/log_file`
/// and `message` events go as JSON lines to `root/event_file`. With an
/// endpoint, logs, spans and metrics are exported over OTLP and a plain
/// printer keeps logging to stdout.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    otel_endpoint: Option<&str>,
) -> Result<Telemetry> {
    match otel_endpoint {
        Some(endpoint) => Telemetry::init_otlp(log_level, endpoint),
        None => Telemetry::init_files(log_level, &root.join(log_file), &root.join(event_file)),
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("could not build the OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("could not build the OTLP span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("could not build the OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// The installed pipelines. Keep it alive for the life of the process and
/// call [`Telemetry::shutdown`] before exiting so batches are flushed.
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    fn init_otlp(log_level: &str, endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;
        let meter_provider = init_metrics(endpoint)?;

        // the exporters' own transport must not feed back into the bridge
        let otel_filter = ["hyper=off", "tonic=off", "h2=off", "tower=off"]
            .into_iter()
            .try_fold(EnvFilter::new(log_level), |filter, directive| {
                directive.parse().map(|d| filter.add_directive(d))
            })?;
        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);
        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("could not install the tracing subscriber: {e}"))?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Self {
            logger_provider: Some(logger_provider),
            tracer_provider: Some(tracer_provider),
            meter_provider: Some(meter_provider),
        })
    }

    fn init_files(log_level: &str, log_file: &Path, event_file: &Path) -> Result<Self> {
        let txt_layer = fmt::layer()
            .with_writer(rolling(log_file)?)
            .with_ansi(false)
            .with_filter(EnvFilter::new(log_level));

        let json_layer = fmt::layer()
            .json()
            .with_writer(rolling(event_file)?)
            .with_target(true)
            .with_filter(EnvFilter::new(format!("{MESSAGE_TARGET}=info")));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .map_err(|e| anyhow!("could not install the tracing subscriber: {e}"))?;

        Ok(Self {
            logger_provider: None,
            tracer_provider: None,
            meter_provider: None,
        })
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                warn!("could not shut down the tracer provider: {e}");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                warn!("could not shut down the meter provider: {e}");
            }
        }
        if let Some(provider) = self.logger_provider {
            // logged to stderr: the bridge is going away with the provider
            if let Err(e) = provider.shutdown() {
                eprintln!("could not shut down the logger provider: {e}");
            }
        }
    }
}

fn rolling(file: &Path) -> Result<RollingFileAppender> {
    let dir = file
        .parent()
        .ok_or_else(|| anyhow!("log file {} has no parent directory", file.display()))?;
    let name = file
        .file_name()
        .ok_or_else(|| anyhow!("log file {} has no file name", file.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, name))
}

/// Router counters and histograms. Backed by the global meter, which records
/// into a no-op provider unless the OTLP pipeline is installed.
#[derive(Clone)]
pub struct BrokerMetrics {
    pub messages_claimed: Counter<u64>,
    pub messages_finished: Counter<u64>,
    pub messages_failed: Counter<u64>,
    pub message_latency_ms: Histogram<f64>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            messages_claimed: meter
                .u64_counter("messages_claimed")
                .with_description("Messages claimed for processing")
                .build(),
            messages_finished: meter.u64_counter("messages_finished").build(),
            messages_failed: meter.u64_counter("messages_failed").build(),
            message_latency_ms: meter
                .f64_histogram("message_latency_ms")
                .with_description("Time from claim to final state")
                .with_unit("ms")
                .build(),
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_needs_a_file_name() {
        assert!(rolling(Path::new("/")).is_err());
    }

    #[test]
    fn rolling_creates_the_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("logs").join("courier.log");
        rolling(&file).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn metrics_record_without_a_pipeline() {
        let metrics = BrokerMetrics::new();
        metrics.messages_claimed.add(1, &[]);
        metrics.message_latency_ms.record(1.5, &[]);
    }
}
