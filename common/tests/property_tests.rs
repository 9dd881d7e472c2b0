// Property-based tests for keys, matchers, data maps and the lock semaphore

use async_trait::async_trait;
use common::data_map::DataMap;
use common::errors::{DatabaseError, LockError};
use common::keys::JobKey;
use common::lock::{LockConfig, LockName, LockRowAccess, LockSemaphore};
use common::matchers::Matcher;
use proptest::prelude::*;
use std::time::Duration;

fn key_part() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,12}"
}

fn job_matcher() -> impl Strategy<Value = Matcher<JobKey>> {
    let leaf = prop_oneof![
        Just(Matcher::everything()),
        key_part().prop_map(Matcher::name_equals),
        key_part().prop_map(Matcher::name_starts_with),
        key_part().prop_map(Matcher::name_ends_with),
        key_part().prop_map(Matcher::name_contains),
        key_part().prop_map(Matcher::group_equals),
        key_part().prop_map(Matcher::group_starts_with),
        key_part().prop_map(Matcher::group_contains),
        Just(Matcher::any_group()),
    ];
    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Matcher::and(a, b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Matcher::or(a, b)),
            inner.prop_map(Matcher::not),
        ]
    })
}

/// **Property: Matcher conjunction**
///
/// *For any* two matchers and any key, `AND(a, b)` matches exactly when
/// both operands match; `OR` and `NOT` follow boolean logic likewise.
#[test]
fn property_matcher_boolean_algebra() {
    proptest!(|(
        a in job_matcher(),
        b in job_matcher(),
        name in key_part(),
        group in key_part()
    )| {
        let key = JobKey::new(name, group);
        let and = Matcher::and(a.clone(), b.clone());
        let or = Matcher::or(a.clone(), b.clone());
        let not = Matcher::not(a.clone());

        prop_assert_eq!(and.is_match(&key), a.is_match(&key) && b.is_match(&key));
        prop_assert_eq!(or.is_match(&key), a.is_match(&key) || b.is_match(&key));
        prop_assert_eq!(not.is_match(&key), !a.is_match(&key));
    });
}

/// **Property: Composite matchers need both operands**
///
/// *For any* matcher, building a conjunction or disjunction with a missing
/// operand fails, on either side.
#[test]
fn property_composite_matcher_rejects_missing_operand() {
    proptest!(|(a in job_matcher())| {
        prop_assert!(Matcher::try_and(Some(a.clone()), None).is_err());
        prop_assert!(Matcher::try_and(None, Some(a.clone())).is_err());
        prop_assert!(Matcher::try_or(None, Some(a.clone())).is_err());
        prop_assert!(Matcher::try_and(Some(a.clone()), Some(a)).is_ok());
    });
}

/// **Property: Data map dirty tracking**
///
/// *For any* set of entries, a map that has been marked clean reads clean,
/// and any further `put` makes it dirty again. Keys are case-insensitive.
#[test]
fn property_data_map_dirty_flag() {
    proptest!(|(
        entries in prop::collection::vec((key_part(), any::<i64>()), 0..10),
        extra_key in key_part(),
        extra_value in any::<i32>()
    )| {
        let mut map = DataMap::new();
        for (k, v) in &entries {
            map.put(k.clone(), *v);
        }
        map.clear_dirty();
        prop_assert!(!map.is_dirty());

        map.put(extra_key.clone(), extra_value);
        prop_assert!(map.is_dirty());
        prop_assert_eq!(map.get_int(&extra_key.to_uppercase()), Some(extra_value));
    });
}

/// **Property: Merged data precedence**
///
/// *For any* job map and trigger map, overlaying the trigger map onto the
/// job map keeps every trigger value and only the job values whose keys
/// the trigger map does not define.
#[test]
fn property_trigger_data_overrides_job_data() {
    proptest!(|(
        job_entries in prop::collection::btree_map("[a-z]{1,4}", any::<i32>(), 0..8),
        trigger_entries in prop::collection::btree_map("[a-z]{1,4}", any::<i32>(), 0..8)
    )| {
        let mut job = DataMap::new();
        for (k, v) in &job_entries {
            job.put(k.clone(), *v);
        }
        let mut trigger = DataMap::new();
        for (k, v) in &trigger_entries {
            trigger.put(k.clone(), *v);
        }

        let mut merged = DataMap::new();
        merged.put_all(&job);
        merged.put_all(&trigger);

        for (k, v) in &trigger_entries {
            prop_assert_eq!(merged.get_int(k), Some(*v));
        }
        for (k, v) in &job_entries {
            if !trigger_entries.contains_key(k) {
                prop_assert_eq!(merged.get_int(k), Some(*v));
            }
        }
    });
}

/// Lock row driven by a script of UPDATE outcomes
struct ScriptedLockRow {
    /// `Some(rows)` for an UPDATE touching `rows`, `None` for an error
    updates: Vec<Option<u64>>,
    insert_ok: bool,
    update_calls: usize,
    insert_calls: usize,
}

#[async_trait]
impl LockRowAccess for ScriptedLockRow {
    async fn update_lock_row(&mut self, _sched: &str, _lock: &str) -> Result<u64, DatabaseError> {
        let outcome = self.updates.get(self.update_calls).copied().flatten();
        self.update_calls += 1;
        outcome.ok_or_else(|| DatabaseError::QueryFailed("row locked".to_string()))
    }

    async fn insert_lock_row(&mut self, _sched: &str, _lock: &str) -> Result<(), DatabaseError> {
        self.insert_calls += 1;
        if self.insert_ok {
            Ok(())
        } else {
            Err(DatabaseError::QueryFailed("duplicate key".to_string()))
        }
    }
}

/// **Property: Lock acquisition**
///
/// *For any* configured retry bound and any sequence of UPDATE outcomes,
/// the lock is taken by the first successful UPDATE without an INSERT; the
/// UPDATE is tried at least twice before the INSERT decides, and a failed
/// INSERT is a lock error.
#[test]
fn property_lock_update_then_insert_fallback() {
    proptest!(|(
        retry_count in 0u32..5,
        updates in prop::collection::vec(prop::option::of(0u64..2), 0..6),
        insert_ok in any::<bool>()
    )| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let semaphore = LockSemaphore::new(
            "sched",
            LockConfig {
                retry_count,
                retry_delay: Duration::ZERO,
                ..LockConfig::default()
            },
        );
        let mut row = ScriptedLockRow {
            updates: updates.clone(),
            insert_ok,
            update_calls: 0,
            insert_calls: 0,
        };

        let result = runtime.block_on(semaphore.obtain_lock(&mut row, LockName::TriggerAccess));

        let attempts = retry_count.max(2) as usize;
        let first_success = updates
            .iter()
            .take(attempts)
            .position(|outcome| matches!(outcome, Some(rows) if *rows >= 1));

        match first_success {
            Some(index) => {
                prop_assert!(matches!(result, Ok(true)));
                prop_assert_eq!(row.update_calls, index + 1);
                prop_assert_eq!(row.insert_calls, 0);
            }
            None => {
                prop_assert!(row.update_calls >= 2);
                prop_assert_eq!(row.update_calls, attempts);
                prop_assert_eq!(row.insert_calls, 1);
                if insert_ok {
                    prop_assert!(matches!(result, Ok(true)));
                } else {
                    let exhausted = matches!(result, Err(LockError::Exhausted { .. }));
                    prop_assert!(exhausted);
                }
            }
        }
    });
}
