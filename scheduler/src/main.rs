// Scheduler binary entry point

use common::bootstrap::{default_registry, run_scheduler};
use common::config::Settings;
use common::telemetry;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Err(e) = telemetry::init_metrics(settings.observability.metrics_port) {
        error!(error = %e, "Metrics exporter unavailable, continuing without it");
    }

    info!("Starting trigger store scheduler");

    let result = run_scheduler(settings, default_registry()).await;
    if let Err(e) = &result {
        error!(error = %e, "Scheduler exited with error");
    }

    telemetry::shutdown_tracer();
    result
}
