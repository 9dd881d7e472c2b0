// Periodic store maintenance running beside the coordinator loop

use crate::store::{JobStore, StoreBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause between back-to-back misfire batches
const MISFIRE_BATCH_PAUSE: Duration = Duration::from_millis(50);

fn to_std(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::from_millis(1))
}

/// Scan for misfired triggers once per misfire threshold, or right away
/// while a scan reports more work.
pub(crate) fn spawn_misfire_handler<B: StoreBackend>(
    store: Arc<JobStore<B>>,
    retry_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let threshold = to_std(store.misfire_threshold());
        info!(threshold_ms = threshold.as_millis() as u64, "Misfire handler started");

        loop {
            let wait = match store.recover_misfired_triggers().await {
                Ok(recovery) => {
                    if recovery.processed > 0 {
                        info!(
                            processed = recovery.processed,
                            has_more = recovery.has_more,
                            "Handled misfired triggers"
                        );
                    }
                    if recovery.has_more {
                        MISFIRE_BATCH_PAUSE
                    } else {
                        threshold
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Misfire scan failed");
                    retry_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Misfire handler stopped");
    })
}

/// Check in with the cluster and recover failed peers every check-in
/// interval. The first check-in already happened at scheduler start.
pub(crate) fn spawn_cluster_manager<B: StoreBackend>(
    store: Arc<JobStore<B>>,
    retry_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = to_std(store.cluster_checkin_interval());
        info!(
            instance_id = %store.instance_id(),
            interval_ms = interval.as_millis() as u64,
            "Cluster manager started"
        );

        let mut wait = interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.recv() => break,
            }

            wait = match store.check_in_and_recover().await {
                Ok(true) => {
                    info!("Recovered work from failed cluster instances");
                    interval
                }
                Ok(false) => {
                    debug!("Cluster check-in complete");
                    interval
                }
                Err(e) => {
                    warn!(error = %e, "Cluster check-in failed");
                    retry_interval.min(interval)
                }
            };
        }

        info!("Cluster manager stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{JobDetail, MisfireInstruction, Schedule, Trigger, TriggerState};
    use crate::store::{JobStoreConfig, MemoryBackend};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_negative_durations_are_floored() {
        assert_eq!(to_std(chrono::Duration::milliseconds(-5)), Duration::from_millis(1));
        assert_eq!(to_std(chrono::Duration::seconds(2)), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_misfire_handler_applies_skip_to_next_and_stops() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = Arc::new(JobStore::new(
            Arc::new(MemoryBackend::new()),
            JobStoreConfig::default(),
            Arc::new(clock.clone()),
        ));

        let job = JobDetail::builder("noop").with_identity("j", "g").build();
        let trigger = Trigger::builder()
            .with_identity("t", "g")
            .for_job(job.key.clone())
            .with_schedule(Schedule::Interval {
                interval_ms: 3_600_000,
                repeat_count: None,
            })
            .with_misfire_instruction(MisfireInstruction::SkipToNext)
            .start_at(start)
            .build()
            .unwrap();
        store.store_job_and_trigger(&job, &trigger).await.unwrap();

        clock.advance(chrono::Duration::minutes(90));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_misfire_handler(Arc::clone(&store), Duration::from_millis(10), shutdown_rx);

        let mut moved = false;
        for _ in 0..100 {
            let stored = store.retrieve_trigger(trigger.key()).await.unwrap().unwrap();
            if stored.next_fire_time() == Some(start + chrono::Duration::hours(2)) {
                assert_eq!(stored.state(), TriggerState::Waiting);
                moved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(moved);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
