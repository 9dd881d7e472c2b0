// Bootstrap utilities for binary initialization
// Builds the store and coordinator from settings and runs them until Ctrl-C

use crate::clock::{Clock, SystemClock};
use crate::config::{Settings, StoreBackendKind};
use crate::db::DbPool;
use crate::job::{JobRegistry, NoOpJob, NOOP_JOB_TYPE};
use crate::scheduler::{Scheduler, SchedulerEngine};
use crate::store::{JobStore, MemoryBackend, PostgresBackend, StoreBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

/// Registry with the built-in job types
pub fn default_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(NOOP_JOB_TYPE, || Arc::new(NoOpJob));
    registry
}

/// Initialize database pool
///
/// # Errors
/// Returns error if database pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Connect the Postgres-backed job store, applying migrations first when
/// configured to.
///
/// # Errors
/// Returns error if the pool cannot connect or migrations fail
#[tracing::instrument(skip(settings))]
pub async fn init_postgres_store(
    settings: &Settings,
    instance_id: &str,
) -> Result<JobStore<PostgresBackend>> {
    let db_pool = init_database_pool(settings).await?;
    let backend = PostgresBackend::new(db_pool, settings.scheduler.instance_name.clone());

    if settings.job_store.run_migrations {
        backend
            .run_migrations()
            .await
            .context("Failed to apply scheduler migrations")?;
    }

    Ok(JobStore::new(
        Arc::new(backend),
        settings.job_store_config(instance_id),
        Arc::new(SystemClock) as Arc<dyn Clock>,
    ))
}

/// In-process job store; state is lost on exit
pub fn init_memory_store(settings: &Settings, instance_id: &str) -> JobStore<MemoryBackend> {
    info!("Using in-memory job store");
    JobStore::new(
        Arc::new(MemoryBackend::new()),
        settings.job_store_config(instance_id),
        Arc::new(SystemClock) as Arc<dyn Clock>,
    )
}

/// Validate settings, build the configured store and run the coordinator
/// until Ctrl-C.
///
/// # Errors
/// Returns error on invalid settings, store initialization failure or a
/// failed start
pub async fn run_scheduler(settings: Settings, registry: JobRegistry) -> Result<()> {
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let instance_id = settings.resolve_instance_id();
    info!(
        instance_name = %settings.scheduler.instance_name,
        instance_id = %instance_id,
        backend = ?settings.job_store.backend,
        clustered = settings.job_store.clustered,
        "Configuration loaded"
    );

    match settings.job_store.backend {
        StoreBackendKind::Postgres => {
            let store = init_postgres_store(&settings, &instance_id).await?;
            run_engine(SchedulerEngine::new(settings.engine_config(), store, registry)).await
        }
        StoreBackendKind::Memory => {
            let store = init_memory_store(&settings, &instance_id);
            run_engine(SchedulerEngine::new(settings.engine_config(), store, registry)).await
        }
    }
}

async fn run_engine<B: StoreBackend>(engine: SchedulerEngine<B>) -> Result<()> {
    let engine = Arc::new(engine);
    let engine_for_shutdown = Arc::clone(&engine);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C, shutting down");
        } else {
            info!("Received Ctrl+C signal, initiating graceful shutdown");
        }
        if let Err(e) = engine_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    engine.start().await.context("Scheduler failed")?;
    info!("Scheduler stopped");
    Ok(())
}
