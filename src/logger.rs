use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context as _, Result};
use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider};
use opentelemetry::trace::{TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "diagram-bridge";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct LogConfig {
    pub log_level: LogLevel,
    /// Text log and JSON job reports are written here when set.
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP endpoint for logs, traces and metrics.
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>, otel_endpoint: Option<String>) -> Self {
        Self {
            log_level,
            log_dir,
            otel_endpoint,
        }
    }
}

/// Keeps the installed telemetry alive; call [`TelemetryGuard::shutdown`] on exit.
pub enum TelemetryGuard {
    Otel(Box<Telemetry>),
    Files(FileTelemetry),
    Stderr,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otel(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Installs the global subscriber. Nothing is ever written to stdout, which
/// belongs to the stdio transport.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    let level = config.log_level.as_ref();
    if let Some(endpoint) = &config.otel_endpoint {
        Ok(TelemetryGuard::Otel(Box::new(Telemetry::init(level, endpoint)?)))
    } else if let Some(dir) = &config.log_dir {
        Ok(TelemetryGuard::Files(FileTelemetry::init_files(level, dir.clone())?))
    } else {
        let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        Registry::default()
            .with(EnvFilter::new(level))
            .with(fmt_layer)
            .try_init()
            .context("tracing subscriber already installed")?;
        Ok(TelemetryGuard::Stderr)
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(end_point: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// OTLP export of logs, traces and metrics.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;
        let meter_provider = init_metrics(endpoint)?;

        let otel_logs_layer = {
            let filter = EnvFilter::new(log_level)
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter)
        };

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level).add_directive("opentelemetry=debug".parse()?));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .context("tracing subscriber already installed")?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            error!("tracer shutdown: {e}");
        }
        if let Err(e) = self.meter_provider.shutdown() {
            error!("meter shutdown: {e}");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            error!("logger shutdown: {e}");
        }
    }
}

/// Rolling text log plus a JSON report line per job, both under `log_dir`.
pub struct FileTelemetry {
    pub log_dir: PathBuf,
}

impl FileTelemetry {
    pub fn init_files(log_level: &str, log_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("could not create log dir {}", log_dir.display()))?;

        let txt_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "diagram-bridge.log");
        let txt_layer = fmt::Layer::default()
            .with_writer(txt_appender)
            .with_ansi(false)
            .with_filter(EnvFilter::new(log_level));

        // only events with target="job"
        let json_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "jobs.json");
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("job=info"));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .context("tracing subscriber already installed")?;

        Ok(FileTelemetry { log_dir })
    }
}

/// Counters and latency histogram for layout jobs, recorded through the global meter.
pub struct JobMetrics {
    pub jobs_started: Counter<u64>,
    pub jobs_succeeded: Counter<u64>,
    pub jobs_failed: Counter<u64>,
    pub job_latency_ms: Histogram<f64>,
}

static JOB_METRICS: Lazy<JobMetrics> = Lazy::new(|| JobMetrics::new(&global::meter(SERVICE_NAME)));

impl JobMetrics {
    pub fn new(meter: &Meter) -> Self {
        JobMetrics {
            jobs_started: meter
                .u64_counter("layout_jobs_started")
                .with_description("Total layout jobs started")
                .build(),
            jobs_succeeded: meter.u64_counter("layout_jobs_succeeded").build(),
            jobs_failed: meter.u64_counter("layout_jobs_failed").build(),
            job_latency_ms: meter
                .f64_histogram("layout_job_latency_ms")
                .with_description("Latency per layout job in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Instruments created from the global meter provider on first use.
    pub fn global() -> &'static JobMetrics {
        &JOB_METRICS
    }

    pub fn from_provider(provider: &SdkMeterProvider) -> Self {
        Self::new(&provider.meter(SERVICE_NAME))
    }

    /// Runs `job` inside a span, then records its latency and outcome and
    /// emits one JSON report line (target `job`).
    pub async fn instrument_job<Fut, T, E>(&self, name: &str, protocol: &str, job: Fut) -> Result<T, E>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attrs = [KeyValue::new("protocol", protocol.to_string())];
        self.jobs_started.add(1, &attrs);
        let start = Instant::now();
        let span = global::tracer(SERVICE_NAME).start(name.to_string());
        let cx = Context::current_with_span(span);

        let result = opentelemetry::trace::FutureExt::with_context(job, cx).await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.job_latency_ms.record(elapsed, &attrs);
        match &result {
            Ok(_) => {
                self.jobs_succeeded.add(1, &attrs);
                info!("job `{}` succeeded in {:.1} ms", name, elapsed);
            }
            Err(err) => {
                self.jobs_failed.add(1, &attrs);
                error!(error = %err, "job `{}` failed in {:.1} ms", name, elapsed);
            }
        }

        tracing::event!(
            target: "job",
            tracing::Level::INFO,
            job = name,
            protocol,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        result
    }
}
