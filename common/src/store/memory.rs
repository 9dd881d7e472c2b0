// In-process store backend
//
// Records live in one shared arena behind an async mutex. A transaction
// holds the mutex for its whole lifetime, edits a private copy and swaps it
// in on commit, so an aborted transaction leaves nothing behind. Several
// `JobStore`s sharing one backend behave like cluster nodes sharing a
// database.

use super::backend::{StoreBackend, StoreTransaction};
use crate::data_map::DataMap;
use crate::errors::{DatabaseError, StoreError};
use crate::keys::{JobKey, TriggerKey};
use crate::lock::LockRowAccess;
use crate::models::{
    FiredTriggerRecord, JobDetail, MisfireInstruction, SchedulerStateRecord, Trigger, TriggerState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    jobs: BTreeMap<JobKey, JobDetail>,
    triggers: BTreeMap<TriggerKey, Trigger>,
    paused_groups: BTreeSet<String>,
    fired: BTreeMap<String, FiredTriggerRecord>,
    scheduler_states: BTreeMap<String, SchedulerStateRecord>,
    locks: BTreeSet<(String, String)>,
}

/// Shared in-memory backend
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with a transaction error, rolling it back.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTransaction {
            guard,
            working,
            fail_next_commit: Arc::clone(&self.fail_next_commit),
        })
    }
}

/// Transaction over a [`MemoryBackend`]
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_next_commit: Arc<AtomicBool>,
}

/// Acquisition order: next fire time ascending, priority descending, key.
fn acquisition_order(a: &Trigger, b: &Trigger) -> Ordering {
    a.next_fire_time
        .cmp(&b.next_fire_time)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.key.cmp(&b.key))
}

fn state_matches(state: TriggerState, from: &[TriggerState]) -> bool {
    from.is_empty() || from.contains(&state)
}

impl MemoryTransaction {
    fn set_states<'a>(
        triggers: impl Iterator<Item = &'a mut Trigger>,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> u64 {
        let mut changed = 0;
        for trigger in triggers {
            if state_matches(trigger.state, from) {
                trigger.state = new_state;
                changed += 1;
            }
        }
        changed
    }

    fn waiting_sorted(&self, keep: impl Fn(&Trigger) -> bool, limit: usize) -> Vec<Trigger> {
        let mut due: Vec<Trigger> = self
            .working
            .triggers
            .values()
            .filter(|t| t.state == TriggerState::Waiting && keep(t))
            .cloned()
            .collect();
        due.sort_by(acquisition_order);
        due.truncate(limit);
        due
    }
}

#[async_trait]
impl LockRowAccess for MemoryTransaction {
    async fn update_lock_row(
        &mut self,
        sched_name: &str,
        lock_name: &str,
    ) -> Result<u64, DatabaseError> {
        let key = (sched_name.to_string(), lock_name.to_string());
        Ok(u64::from(self.working.locks.contains(&key)))
    }

    async fn insert_lock_row(
        &mut self,
        sched_name: &str,
        lock_name: &str,
    ) -> Result<(), DatabaseError> {
        let key = (sched_name.to_string(), lock_name.to_string());
        if self.working.locks.insert(key) {
            Ok(())
        } else {
            Err(DatabaseError::DuplicateKey(format!(
                "lock row ({}, {}) already exists",
                sched_name, lock_name
            )))
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn select_job(&mut self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        Ok(self.working.jobs.get(key).cloned())
    }

    async fn upsert_job(&mut self, job: &JobDetail) -> Result<(), StoreError> {
        let mut stored = job.clone();
        stored.data_map.clear_dirty();
        self.working.jobs.insert(job.key.clone(), stored);
        Ok(())
    }

    async fn update_job_data(&mut self, key: &JobKey, data: &DataMap) -> Result<(), StoreError> {
        if let Some(job) = self.working.jobs.get_mut(key) {
            job.data_map = data.clone();
            job.data_map.clear_dirty();
        }
        Ok(())
    }

    async fn delete_job(&mut self, key: &JobKey) -> Result<bool, StoreError> {
        Ok(self.working.jobs.remove(key).is_some())
    }

    async fn select_job_keys(&mut self) -> Result<Vec<JobKey>, StoreError> {
        Ok(self.working.jobs.keys().cloned().collect())
    }

    async fn select_trigger(&mut self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        Ok(self.working.triggers.get(key).cloned())
    }

    async fn upsert_trigger(&mut self, trigger: &Trigger) -> Result<(), StoreError> {
        let mut stored = trigger.clone();
        stored.data_map.clear_dirty();
        self.working.triggers.insert(trigger.key.clone(), stored);
        Ok(())
    }

    async fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool, StoreError> {
        Ok(self.working.triggers.remove(key).is_some())
    }

    async fn select_trigger_keys(&mut self) -> Result<Vec<TriggerKey>, StoreError> {
        Ok(self.working.triggers.keys().cloned().collect())
    }

    async fn select_triggers_for_job(&mut self, job: &JobKey) -> Result<Vec<Trigger>, StoreError> {
        Ok(self
            .working
            .triggers
            .values()
            .filter(|t| &t.job_key == job)
            .cloned()
            .collect())
    }

    async fn select_trigger_keys_in_state(
        &mut self,
        state: TriggerState,
    ) -> Result<Vec<TriggerKey>, StoreError> {
        Ok(self
            .working
            .triggers
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.key.clone())
            .collect())
    }

    async fn update_trigger_state_from(
        &mut self,
        key: &TriggerKey,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        Ok(Self::set_states(
            self.working.triggers.get_mut(key).into_iter(),
            new_state,
            from,
        ))
    }

    async fn update_job_trigger_states_from(
        &mut self,
        job: &JobKey,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        Ok(Self::set_states(
            self.working
                .triggers
                .values_mut()
                .filter(|t| &t.job_key == job),
            new_state,
            from,
        ))
    }

    async fn update_all_trigger_states_from(
        &mut self,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        Ok(Self::set_states(
            self.working.triggers.values_mut(),
            new_state,
            from,
        ))
    }

    async fn select_due_triggers(
        &mut self,
        no_later_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError> {
        Ok(self.waiting_sorted(
            |t| matches!(t.next_fire_time, Some(next) if next <= no_later_than),
            limit,
        ))
    }

    async fn select_misfired_triggers(
        &mut self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError> {
        Ok(self.waiting_sorted(
            |t| {
                t.misfire_instruction == MisfireInstruction::SkipToNext
                    && matches!(t.next_fire_time, Some(next) if next < before)
            },
            limit,
        ))
    }

    async fn insert_paused_group(&mut self, group: &str) -> Result<(), StoreError> {
        self.working.paused_groups.insert(group.to_string());
        Ok(())
    }

    async fn delete_paused_group(&mut self, group: &str) -> Result<bool, StoreError> {
        Ok(self.working.paused_groups.remove(group))
    }

    async fn select_paused_groups(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(self.working.paused_groups.iter().cloned().collect())
    }

    async fn upsert_fired(&mut self, record: &FiredTriggerRecord) -> Result<(), StoreError> {
        self.working
            .fired
            .insert(record.entry_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_fired(&mut self, entry_id: &str) -> Result<bool, StoreError> {
        Ok(self.working.fired.remove(entry_id).is_some())
    }

    async fn select_fired_for_job(
        &mut self,
        job: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>, StoreError> {
        Ok(self
            .working
            .fired
            .values()
            .filter(|r| &r.job_key == job)
            .cloned()
            .collect())
    }

    async fn select_fired_for_instance(
        &mut self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>, StoreError> {
        Ok(self
            .working
            .fired
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn select_fired_instance_ids(&mut self) -> Result<Vec<String>, StoreError> {
        let ids: BTreeSet<String> = self
            .working
            .fired
            .values()
            .map(|r| r.instance_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn delete_fired_for_instance(&mut self, instance_id: &str) -> Result<u64, StoreError> {
        let before = self.working.fired.len();
        self.working.fired.retain(|_, r| r.instance_id != instance_id);
        Ok((before - self.working.fired.len()) as u64)
    }

    async fn select_scheduler_states(&mut self) -> Result<Vec<SchedulerStateRecord>, StoreError> {
        Ok(self.working.scheduler_states.values().cloned().collect())
    }

    async fn upsert_scheduler_state(
        &mut self,
        record: &SchedulerStateRecord,
    ) -> Result<(), StoreError> {
        self.working
            .scheduler_states
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_scheduler_state(&mut self, instance_id: &str) -> Result<bool, StoreError> {
        Ok(self.working.scheduler_states.remove(instance_id).is_some())
    }

    async fn clear_all(&mut self) -> Result<(), StoreError> {
        self.working.jobs.clear();
        self.working.triggers.clear();
        self.working.paused_groups.clear();
        self.working.fired.clear();
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if self.fail_next_commit.swap(false, AtomicOrdering::SeqCst) {
            return Err(StoreError::Database(DatabaseError::TransactionFailed(
                "injected commit failure".to_string(),
            )));
        }
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schedule;
    use chrono::Duration;

    fn trigger(name: &str, offset_secs: i64, priority: i32) -> Trigger {
        Trigger::builder()
            .with_identity(name, "g")
            .for_job(JobKey::new("j", "g"))
            .with_schedule(Schedule::Once)
            .with_priority(priority)
            .start_at(Utc::now() + Duration::seconds(offset_secs))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let backend = MemoryBackend::new();
        {
            let mut tx = backend.begin().await.unwrap();
            tx.upsert_job(&JobDetail::builder("noop").build()).await.unwrap();
            tx.rollback().await.unwrap();
        }
        let mut tx = backend.begin().await.unwrap();
        assert!(tx.select_job_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_commit_failure_rolls_back() {
        let backend = MemoryBackend::new();
        backend.fail_next_commit();
        let mut tx = backend.begin().await.unwrap();
        tx.upsert_job(&JobDetail::builder("noop").build()).await.unwrap();
        assert!(tx.commit().await.is_err());

        let mut tx = backend.begin().await.unwrap();
        assert!(tx.select_job_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_triggers_ordered_by_time_then_priority() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let low = trigger("low", 10, 1);
        let mut high = trigger("high", 10, 9);
        high.next_fire_time = low.next_fire_time;
        let early = trigger("early", 5, 1);
        let late = trigger("late", 3600, 10);
        for t in [&low, &high, &early, &late] {
            tx.upsert_trigger(t).await.unwrap();
        }

        let due = tx
            .select_due_triggers(Utc::now() + Duration::seconds(60), 10)
            .await
            .unwrap();
        let names: Vec<&str> = due.iter().map(|t| t.key().name()).collect();
        assert_eq!(names, vec!["early", "high", "low"]);
    }

    #[tokio::test]
    async fn test_lock_row_bootstrap() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        assert_eq!(tx.update_lock_row("s", "TRIGGER_ACCESS").await.unwrap(), 0);
        tx.insert_lock_row("s", "TRIGGER_ACCESS").await.unwrap();
        assert!(tx.insert_lock_row("s", "TRIGGER_ACCESS").await.is_err());
        assert_eq!(tx.update_lock_row("s", "TRIGGER_ACCESS").await.unwrap(), 1);
    }
}
