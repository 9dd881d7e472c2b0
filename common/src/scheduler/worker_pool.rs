// Bounded pool of job execution slots

use crate::telemetry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Runs job shells on the tokio runtime, at most `size` at a time.
///
/// The coordinator waits for a free slot before acquiring triggers, so it
/// never holds more acquired triggers than it can execute.
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Block until at least one slot is free and report how many are.
    /// Returns 0 once the pool has been closed.
    pub async fn wait_for_available(&self) -> usize {
        match self.semaphore.acquire().await {
            Ok(permit) => {
                drop(permit);
                self.available().max(1)
            }
            Err(_) => 0,
        }
    }

    /// Run `task` in a slot, waiting for one if all are busy.
    /// Returns `false` if the pool was closed and the task dropped.
    pub async fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Worker pool closed, dropping job");
                return false;
            }
        };

        let mut tasks = self.tasks.lock().await;
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "Job task ended abnormally");
            }
        }
        tasks.spawn(async move {
            let _permit = permit;
            task.await;
        });
        drop(tasks);

        telemetry::update_worker_slots(self.available());
        true
    }

    /// Stop handing out slots and wait up to `timeout` for running tasks.
    /// Tasks still running afterwards are aborted. Returns whether all
    /// tasks finished on their own.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.semaphore.close();
        let drained = self.drain(timeout).await;
        if !drained {
            let mut tasks = self.tasks.lock().await;
            warn!(remaining = tasks.len(), "Aborting jobs still running at shutdown");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        drained
    }

    /// Wait up to `timeout` for every running task to finish.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut tasks = self.tasks.lock().await;
        let joined = tokio::time::timeout(timeout, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    warn!(error = %e, "Job task ended abnormally");
                }
            }
        })
        .await;
        debug!(drained = joined.is_ok(), "Worker pool drain finished");
        joined.is_ok()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_slots_are_bounded() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        assert!(pool.spawn(async move {
            let _ = release_rx.await;
        }).await);
        assert_eq!(pool.available(), 1);

        release_tx.send(()).unwrap();
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_size_is_floored() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.wait_for_available().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_tasks() {
        let pool = WorkerPool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert!(!pool.shutdown(Duration::from_millis(20)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(pool.wait_for_available().await, 0);
        assert!(!pool.spawn(async {}).await);
    }
}
