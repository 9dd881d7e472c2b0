// Cluster lock semaphore backed by a row in the shared store
//
// A lock is a `(sched_name, lock_name)` row. Updating the row inside a
// transaction takes the store's row lock; the lock is held until that
// transaction commits or rolls back. There is no explicit release.

use crate::errors::{DatabaseError, LockError};
use crate::telemetry;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Default number of UPDATE attempts before falling back to INSERT
pub const DEFAULT_LOCK_RETRY_COUNT: u32 = 2;

/// A failed UPDATE is always retried at least once before the INSERT fallback
pub const MIN_LOCK_UPDATE_ATTEMPTS: u32 = 2;

/// Default pause after an UPDATE that raised a storage error
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// The two critical sections a scheduler cluster serializes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    /// Trigger, job and fired-record mutations
    TriggerAccess,
    /// Scheduler-instance heartbeat rows
    StateAccess,
}

/// Lock-row statements a transaction must support.
///
/// `update_lock_row` returns the affected row count; zero means the row
/// does not exist yet.
#[async_trait]
pub trait LockRowAccess: Send {
    async fn update_lock_row(
        &mut self,
        sched_name: &str,
        lock_name: &str,
    ) -> Result<u64, DatabaseError>;

    async fn insert_lock_row(&mut self, sched_name: &str, lock_name: &str)
        -> Result<(), DatabaseError>;
}

/// Lock semaphore configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub trigger_access_lock: String,
    pub state_access_lock: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_LOCK_RETRY_COUNT,
            retry_delay: DEFAULT_LOCK_RETRY_DELAY,
            trigger_access_lock: "TRIGGER_ACCESS".to_string(),
            state_access_lock: "STATE_ACCESS".to_string(),
        }
    }
}

/// Row-update lock semaphore for one scheduler cluster
#[derive(Debug, Clone)]
pub struct LockSemaphore {
    sched_name: String,
    config: LockConfig,
}

impl LockSemaphore {
    pub fn new(sched_name: impl Into<String>, config: LockConfig) -> Self {
        Self {
            sched_name: sched_name.into(),
            config: LockConfig {
                retry_count: config.retry_count.max(MIN_LOCK_UPDATE_ATTEMPTS),
                ..config
            },
        }
    }

    pub fn sched_name(&self) -> &str {
        &self.sched_name
    }

    /// Configured row name for a lock
    pub fn lock_name(&self, lock: LockName) -> &str {
        match lock {
            LockName::TriggerAccess => &self.config.trigger_access_lock,
            LockName::StateAccess => &self.config.state_access_lock,
        }
    }

    /// Obtain a lock inside the caller's transaction.
    ///
    /// Tries the UPDATE path up to `retry_count` times. A zero-row UPDATE is
    /// retried at once; an UPDATE error waits `retry_delay` first. When every
    /// UPDATE attempt is used up the lock row is INSERTed. Returns `Ok(true)`
    /// once the row is held.
    ///
    /// # Errors
    /// `LockError::Exhausted` when the INSERT fallback fails too. The caller
    /// should roll back and retry the whole operation.
    #[instrument(skip(self, conn), fields(sched_name = %self.sched_name, lock_name = %self.lock_name(lock)))]
    pub async fn obtain_lock<C>(&self, conn: &mut C, lock: LockName) -> Result<bool, LockError>
    where
        C: LockRowAccess + ?Sized,
    {
        let lock_name = self.lock_name(lock);
        let mut last_error: Option<DatabaseError> = None;

        for attempt in 1..=self.config.retry_count {
            match conn.update_lock_row(&self.sched_name, lock_name).await {
                Ok(rows) if rows >= 1 => {
                    debug!(attempt, "Lock acquired by row update");
                    return Ok(true);
                }
                Ok(_) => {
                    debug!(attempt, "Lock row missing, retrying update");
                    telemetry::record_lock_retry(lock_name);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Lock row update failed");
                    telemetry::record_lock_retry(lock_name);
                    last_error = Some(e);
                    if attempt < self.config.retry_count && !self.config.retry_delay.is_zero() {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        match conn.insert_lock_row(&self.sched_name, lock_name).await {
            Ok(()) => {
                debug!("Lock acquired by inserting lock row");
                Ok(true)
            }
            Err(e) => {
                let reason = match last_error {
                    Some(update_err) => format!("{}; last update error: {}", e, update_err),
                    None => e.to_string(),
                };
                warn!(reason = %reason, "Failed to obtain lock");
                telemetry::record_lock_failure(lock_name);
                Err(LockError::Exhausted {
                    lock_name: lock_name.to_string(),
                    attempts: self.config.retry_count + 1,
                    reason,
                })
            }
        }
    }
}
