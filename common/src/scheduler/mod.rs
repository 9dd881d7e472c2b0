// Firing coordinator: control loop, worker pool and background maintenance

mod background;
pub mod engine;
mod shell;
pub mod worker_pool;

pub use engine::{EngineConfig, ExecutingJob, Scheduler, SchedulerEngine};
pub use worker_pool::WorkerPool;
