// Job contract: the unit of work a trigger fires

use crate::context::JobExecutionContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A unit of work.
///
/// Implementations must be reentrant unless the job detail disallows
/// concurrent execution; the scheduler may run several firings of the same
/// job at once.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError>;
}

/// Failure reported by a job, with instructions for the scheduler
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobExecutionError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    refire_immediately: bool,
    unschedule_firing_trigger: bool,
    unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            refire_immediately: false,
            unschedule_firing_trigger: false,
            unschedule_all_triggers: false,
        }
    }

    /// Wrap an underlying error, keeping it as the source.
    pub fn from_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            source: Some(Box::new(source)),
            ..Self::new(message)
        }
    }

    pub fn with_refire_immediately(mut self, refire: bool) -> Self {
        self.refire_immediately = refire;
        self
    }

    pub fn with_unschedule_firing_trigger(mut self, unschedule: bool) -> Self {
        self.unschedule_firing_trigger = unschedule;
        self
    }

    pub fn with_unschedule_all_triggers(mut self, unschedule: bool) -> Self {
        self.unschedule_all_triggers = unschedule;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn refire_immediately(&self) -> bool {
        self.refire_immediately
    }

    pub fn unschedule_firing_trigger(&self) -> bool {
        self.unschedule_firing_trigger
    }

    pub fn unschedule_all_triggers(&self) -> bool {
        self.unschedule_all_triggers
    }
}

type JobFactory = Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>;

/// Maps a job detail's `job_type` to the code that runs it
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory producing a fresh instance per firing.
    pub fn register<F>(&mut self, job_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Job> + Send + Sync + 'static,
    {
        self.factories.insert(job_type.into(), Arc::new(factory));
        self
    }

    /// Register one shared instance used for every firing.
    pub fn register_instance(&mut self, job_type: impl Into<String>, job: Arc<dyn Job>) -> &mut Self {
        self.register(job_type, move || Arc::clone(&job))
    }

    pub fn instantiate(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.factories.get(job_type).map(|factory| factory())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Job type name of [`NoOpJob`]
pub const NOOP_JOB_TYPE: &str = "noop";

/// Does nothing. Useful for exercising triggers and listeners.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpJob;

#[async_trait]
impl Job for NoOpJob {
    async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        Ok(())
    }
}
