// Telemetry module for structured logging, metrics and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "trigger-store-scheduler";

/// Initialize structured logging with JSON formatting and trace context
///
/// Sets up the tracing subscriber with:
/// - JSON formatting, current span and span list on every entry
/// - Log level from `RUST_LOG`, falling back to `log_level`
/// - An OpenTelemetry layer when `tracing_endpoint` is given
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_names(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// OTLP span exporter with the service name as resource attribute
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the scheduler's metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "triggers_acquired_total",
        "Triggers moved from WAITING to ACQUIRED by this instance"
    );
    describe_counter!(
        "triggers_fired_total",
        "Triggers moved to EXECUTING and dispatched to a worker"
    );
    describe_counter!("trigger_misfires_total", "Triggers detected as misfired");
    describe_counter!(
        "lock_acquire_retries_total",
        "Lock row UPDATE attempts that did not obtain the lock"
    );
    describe_counter!(
        "lock_acquire_failures_total",
        "Lock acquisitions that failed after the INSERT fallback"
    );
    describe_counter!("job_executions_total", "Job executions by outcome");
    describe_histogram!("job_duration_seconds", "Job run time in seconds");
    describe_gauge!("worker_slots_available", "Free slots in the worker pool");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_triggers_acquired(count: usize) {
    counter!("triggers_acquired_total").increment(count as u64);
}

#[inline]
pub fn record_trigger_fired(trigger_group: &str) {
    counter!("triggers_fired_total", "group" => trigger_group.to_string()).increment(1);
}

#[inline]
pub fn record_misfire(instruction: &str) {
    counter!("trigger_misfires_total", "instruction" => instruction.to_string()).increment(1);
}

#[inline]
pub fn record_lock_retry(lock_name: &str) {
    counter!("lock_acquire_retries_total", "lock" => lock_name.to_string()).increment(1);
}

#[inline]
pub fn record_lock_failure(lock_name: &str) {
    counter!("lock_acquire_failures_total", "lock" => lock_name.to_string()).increment(1);
}

/// Record a finished job run; `outcome` is one of `success`, `failed`,
/// `vetoed` or `panicked`.
#[inline]
pub fn record_job_execution(job_type: &str, outcome: &str, run_time: Option<Duration>) {
    counter!(
        "job_executions_total",
        "job_type" => job_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    if let Some(run_time) = run_time {
        histogram!("job_duration_seconds", "job_type" => job_type.to_string())
            .record(run_time.as_secs_f64());
    }
}

#[inline]
pub fn update_worker_slots(available: usize) {
    gauge!("worker_slots_available").set(available as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        // The global subscriber can only be installed once per process
        let _ = init_logging("info", None);
        assert!(init_logging("debug", None).is_err());
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_triggers_acquired(3);
        record_trigger_fired("DEFAULT");
        record_misfire("fire_now");
        record_lock_retry("TRIGGER_ACCESS");
        record_lock_failure("TRIGGER_ACCESS");
        record_job_execution("noop", "success", Some(Duration::from_millis(15)));
        record_job_execution("noop", "vetoed", None);
        update_worker_slots(4);
    }
}
