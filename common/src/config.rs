// Configuration management with layered configuration (file, env)

use crate::lock::{LockConfig, MIN_LOCK_UPDATE_ATTEMPTS};
use crate::scheduler::EngineConfig;
use crate::store::JobStoreConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Instance id value that asks for a generated id
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub job_store: JobStoreSettings,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub instance_name: String,
    /// `AUTO` generates a unique id at startup
    pub instance_id: String,
    pub idle_wait_ms: u64,
    pub batch_max_size: usize,
    pub batch_time_window_ms: u64,
    pub db_failure_retry_interval_ms: u64,
    pub store_failure_give_up_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreSettings {
    pub backend: StoreBackendKind,
    pub clustered: bool,
    pub misfire_threshold_ms: u64,
    pub cluster_checkin_interval_ms: u64,
    pub max_misfires_to_handle_at_a_time: usize,
    pub lock_retry_count: u32,
    pub lock_retry_delay_ms: u64,
    pub trigger_access_lock: String,
    pub state_access_lock: String,
    /// Apply bundled migrations on startup (postgres only)
    #[serde(default)]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub thread_count: usize,
    pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("SCHED")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.job_store.backend == StoreBackendKind::Postgres {
            if self.database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }
        if self.job_store.clustered && self.job_store.backend == StoreBackendKind::Memory {
            return Err("Clustering requires the postgres job store backend".to_string());
        }

        if self.scheduler.instance_name.is_empty() {
            return Err("Scheduler instance_name cannot be empty".to_string());
        }
        if self.scheduler.instance_id.is_empty() {
            return Err("Scheduler instance_id cannot be empty".to_string());
        }
        if self.scheduler.batch_max_size == 0 {
            return Err("Scheduler batch_max_size must be greater than 0".to_string());
        }
        if self.scheduler.idle_wait_ms == 0 {
            return Err("Scheduler idle_wait_ms must be greater than 0".to_string());
        }

        if self.job_store.misfire_threshold_ms == 0 {
            return Err("Job store misfire_threshold_ms must be greater than 0".to_string());
        }
        if self.job_store.cluster_checkin_interval_ms == 0 {
            return Err("Job store cluster_checkin_interval_ms must be greater than 0".to_string());
        }
        if self.job_store.trigger_access_lock.is_empty()
            || self.job_store.state_access_lock.is_empty()
        {
            return Err("Lock names cannot be empty".to_string());
        }

        if self.worker.thread_count == 0 {
            return Err("Worker thread_count must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Configured instance id, or a generated one for `AUTO`.
    pub fn resolve_instance_id(&self) -> String {
        if self.scheduler.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
            format!("{}-{}", host, Uuid::new_v4().simple())
        } else {
            self.scheduler.instance_id.clone()
        }
    }

    /// Store settings for an instance id resolved by the caller.
    pub fn job_store_config(&self, instance_id: impl Into<String>) -> JobStoreConfig {
        JobStoreConfig {
            instance_name: self.scheduler.instance_name.clone(),
            instance_id: instance_id.into(),
            clustered: self.job_store.clustered,
            misfire_threshold: millis(self.job_store.misfire_threshold_ms),
            cluster_checkin_interval: millis(self.job_store.cluster_checkin_interval_ms),
            max_misfires_to_handle_at_a_time: self.job_store.max_misfires_to_handle_at_a_time,
            lock: LockConfig {
                retry_count: self.job_store.lock_retry_count.max(MIN_LOCK_UPDATE_ATTEMPTS),
                retry_delay: Duration::from_millis(self.job_store.lock_retry_delay_ms),
                trigger_access_lock: self.job_store.trigger_access_lock.clone(),
                state_access_lock: self.job_store.state_access_lock.clone(),
            },
        }
    }
}

impl Settings {
    /// Coordinator settings for the firing loop and worker pool.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            scheduler_name: self.scheduler.instance_name.clone(),
            idle_wait: Duration::from_millis(self.scheduler.idle_wait_ms),
            batch_max_size: self.scheduler.batch_max_size,
            batch_time_window: millis(self.scheduler.batch_time_window_ms),
            db_failure_retry_interval: Duration::from_millis(self.scheduler.db_failure_retry_interval_ms),
            store_failure_give_up_threshold: self.scheduler.store_failure_give_up_threshold,
            thread_count: self.worker.thread_count,
            shutdown_timeout: Duration::from_secs(self.worker.shutdown_timeout_seconds),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/scheduler".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            scheduler: SchedulerConfig {
                instance_name: "TriggerStoreScheduler".to_string(),
                instance_id: "NON_CLUSTERED".to_string(),
                idle_wait_ms: 30_000,
                batch_max_size: 1,
                batch_time_window_ms: 0,
                db_failure_retry_interval_ms: 15_000,
                store_failure_give_up_threshold: 10,
            },
            job_store: JobStoreSettings {
                backend: StoreBackendKind::Postgres,
                clustered: false,
                misfire_threshold_ms: 60_000,
                cluster_checkin_interval_ms: 7_500,
                max_misfires_to_handle_at_a_time: 20,
                lock_retry_count: 2,
                lock_retry_delay_ms: 1_000,
                trigger_access_lock: "TRIGGER_ACCESS".to_string(),
                state_access_lock: "STATE_ACCESS".to_string(),
                run_migrations: false,
            },
            worker: WorkerConfig {
                thread_count: 10,
                shutdown_timeout_seconds: 30,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
