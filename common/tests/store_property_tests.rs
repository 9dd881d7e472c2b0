// Property-based tests for the job store firing protocol

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::clock::ManualClock;
use common::lock::LockConfig;
use common::models::{JobDetail, Trigger, TriggerFiredResult, TriggerState};
use common::store::{JobStore, JobStoreConfig, MemoryBackend};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn store(backend: &Arc<MemoryBackend>, clock: &ManualClock, instance_id: &str) -> JobStore<MemoryBackend> {
    JobStore::new(
        Arc::clone(backend),
        JobStoreConfig {
            instance_id: instance_id.to_string(),
            lock: LockConfig {
                retry_delay: std::time::Duration::ZERO,
                ..LockConfig::default()
            },
            ..JobStoreConfig::default()
        },
        Arc::new(clock.clone()),
    )
}

fn trigger(name: &str, job: &JobDetail, at: DateTime<Utc>, priority: i32) -> Trigger {
    Trigger::builder()
        .with_identity(name, "triggers")
        .for_job(job.key.clone())
        .with_priority(priority)
        .start_at(at)
        .build()
        .unwrap()
}

fn fired_count(results: &[TriggerFiredResult]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r, TriggerFiredResult::Fired(_)))
        .count()
}

/// **Property: Concurrency exclusion**
///
/// *For any* number of due triggers pointing at a job that disallows
/// concurrent execution, one acquire-and-fire pass yields at most one
/// bundle, and while it runs every sibling trigger is `BLOCKED`.
#[test]
fn property_non_concurrent_job_fires_at_most_once_per_batch() {
    proptest!(ProptestConfig::with_cases(32), |(
        trigger_count in 2usize..6,
        batch in 1usize..8,
        offsets in prop::collection::vec(0i64..5, 6)
    )| {
        let rt = runtime();
        rt.block_on(async {
            let clock = ManualClock::new(start());
            let store = store(&Arc::new(MemoryBackend::new()), &clock, "node-1");

            let job = JobDetail::builder("noop")
                .with_identity("exclusive", "jobs")
                .disallow_concurrent_execution(true)
                .build();
            store.store_job(&job, false).await.unwrap();
            for i in 0..trigger_count {
                let at = start() - Duration::seconds(offsets[i]);
                store
                    .store_trigger(&trigger(&format!("t{i}"), &job, at, 5), false)
                    .await
                    .unwrap();
            }

            let acquired = store
                .acquire_next_triggers(start(), batch, Duration::seconds(10))
                .await
                .unwrap();
            prop_assert!(acquired.len() <= 1);

            let results = store.triggers_fired(&acquired).await.unwrap();
            prop_assert!(fired_count(&results) <= 1);

            if fired_count(&results) == 1 {
                let triggers = store.triggers_for_job(&job.key).await.unwrap();
                let executing = triggers
                    .iter()
                    .filter(|t| t.state() == TriggerState::Executing)
                    .count();
                let blocked = triggers
                    .iter()
                    .filter(|t| t.state() == TriggerState::Blocked)
                    .count();
                prop_assert_eq!(executing, 1);
                prop_assert_eq!(blocked, trigger_count - 1);
            }
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// **Property: At-most-once firing across a cluster**
///
/// *For any* set of due triggers and two scheduler instances sharing one
/// store, racing acquisitions never hand the same trigger to both.
#[test]
fn property_trigger_acquired_by_one_instance_only() {
    proptest!(ProptestConfig::with_cases(24), |(
        trigger_count in 1usize..12,
        batch in 1usize..6,
        priorities in prop::collection::vec(1i32..10, 12)
    )| {
        let rt = runtime();
        rt.block_on(async {
            let backend = Arc::new(MemoryBackend::new());
            let clock = ManualClock::new(start());
            let node_a = Arc::new(store(&backend, &clock, "node-a"));
            let node_b = Arc::new(store(&backend, &clock, "node-b"));

            let job = JobDetail::builder("noop").with_identity("shared", "jobs").build();
            node_a.store_job(&job, false).await.unwrap();
            for i in 0..trigger_count {
                node_a
                    .store_trigger(&trigger(&format!("t{i}"), &job, start(), priorities[i]), false)
                    .await
                    .unwrap();
            }

            let mut handles = Vec::new();
            for node in [Arc::clone(&node_a), Arc::clone(&node_b)] {
                handles.push(tokio::spawn(async move {
                    let mut keys = Vec::new();
                    for _ in 0..trigger_count {
                        let acquired = node
                            .acquire_next_triggers(start(), batch, Duration::zero())
                            .await
                            .unwrap();
                        if acquired.is_empty() {
                            break;
                        }
                        let results = node.triggers_fired(&acquired).await.unwrap();
                        for result in results {
                            if let TriggerFiredResult::Fired(bundle) = result {
                                keys.push(bundle.trigger.key().clone());
                            }
                        }
                    }
                    keys
                }));
            }

            let mut seen = HashSet::new();
            let mut total = 0;
            for handle in handles {
                for key in handle.await.unwrap() {
                    total += 1;
                    prop_assert!(seen.insert(key));
                }
            }
            prop_assert_eq!(total, trigger_count);
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// **Property: Failed commits leave no trace**
///
/// *For any* trigger set, an acquisition whose commit fails leaves every
/// trigger `WAITING` with no fired records, and a retry acquires the same
/// triggers.
#[test]
fn property_failed_acquisition_rolls_back() {
    proptest!(ProptestConfig::with_cases(32), |(
        trigger_count in 1usize..8,
        batch in 1usize..8
    )| {
        let rt = runtime();
        rt.block_on(async {
            let backend = Arc::new(MemoryBackend::new());
            let clock = ManualClock::new(start());
            let store = store(&backend, &clock, "node-1");

            let job = JobDetail::builder("noop").with_identity("j", "jobs").build();
            store.store_job(&job, false).await.unwrap();
            for i in 0..trigger_count {
                store
                    .store_trigger(&trigger(&format!("t{i}"), &job, start(), 5), false)
                    .await
                    .unwrap();
            }

            backend.fail_next_commit();
            prop_assert!(store
                .acquire_next_triggers(start(), batch, Duration::zero())
                .await
                .is_err());

            for t in store.triggers_for_job(&job.key).await.unwrap() {
                prop_assert_eq!(t.state(), TriggerState::Waiting);
            }

            let acquired = store
                .acquire_next_triggers(start(), batch, Duration::zero())
                .await
                .unwrap();
            prop_assert_eq!(acquired.len(), batch.min(trigger_count));
            Ok::<(), TestCaseError>(())
        })?;
    });
}
