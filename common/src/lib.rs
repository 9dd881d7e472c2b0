// Trigger store scheduler: persistent job store, cluster locking and the firing coordinator

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod context;
pub mod data_map;
pub mod db;
pub mod errors;
pub mod job;
pub mod keys;
pub mod listeners;
pub mod lock;
pub mod management;
pub mod matchers;
pub mod models;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod telemetry;
