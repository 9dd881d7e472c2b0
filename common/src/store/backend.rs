// Transactional row interface the job store algorithm runs against

use crate::errors::StoreError;
use crate::keys::{JobKey, TriggerKey};
use crate::lock::LockRowAccess;
use crate::models::{FiredTriggerRecord, JobDetail, SchedulerStateRecord, Trigger, TriggerState};
use crate::data_map::DataMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A storage engine that can open transactions
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    type Tx: StoreTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// Row-level operations inside one transaction.
///
/// Every write is visible to later reads in the same transaction and to
/// other transactions only after [`commit`](StoreTransaction::commit).
/// Dropping a transaction without committing rolls it back.
///
/// State updates taking a `from` slice only touch rows currently in one of
/// those states; an empty slice matches any state. They return the number of
/// rows changed.
#[async_trait]
pub trait StoreTransaction: LockRowAccess + Send + Sized {
    // jobs
    async fn select_job(&mut self, key: &JobKey) -> Result<Option<JobDetail>, StoreError>;
    async fn upsert_job(&mut self, job: &JobDetail) -> Result<(), StoreError>;
    async fn update_job_data(&mut self, key: &JobKey, data: &DataMap) -> Result<(), StoreError>;
    async fn delete_job(&mut self, key: &JobKey) -> Result<bool, StoreError>;
    async fn select_job_keys(&mut self) -> Result<Vec<JobKey>, StoreError>;

    // triggers
    async fn select_trigger(&mut self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError>;
    async fn upsert_trigger(&mut self, trigger: &Trigger) -> Result<(), StoreError>;
    async fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool, StoreError>;
    async fn select_trigger_keys(&mut self) -> Result<Vec<TriggerKey>, StoreError>;
    async fn select_triggers_for_job(&mut self, job: &JobKey) -> Result<Vec<Trigger>, StoreError>;
    async fn select_trigger_keys_in_state(
        &mut self,
        state: TriggerState,
    ) -> Result<Vec<TriggerKey>, StoreError>;

    async fn update_trigger_state_from(
        &mut self,
        key: &TriggerKey,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError>;

    async fn update_job_trigger_states_from(
        &mut self,
        job: &JobKey,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError>;

    async fn update_all_trigger_states_from(
        &mut self,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError>;

    /// `WAITING` triggers due no later than `no_later_than`, ordered by
    /// next fire time ascending, priority descending, then key.
    async fn select_due_triggers(
        &mut self,
        no_later_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// `WAITING` triggers using `SkipToNext` whose next fire time is before
    /// `before`, in the same order as [`select_due_triggers`](Self::select_due_triggers).
    async fn select_misfired_triggers(
        &mut self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError>;

    // paused trigger groups
    async fn insert_paused_group(&mut self, group: &str) -> Result<(), StoreError>;
    async fn delete_paused_group(&mut self, group: &str) -> Result<bool, StoreError>;
    async fn select_paused_groups(&mut self) -> Result<Vec<String>, StoreError>;

    // fired trigger records
    async fn upsert_fired(&mut self, record: &FiredTriggerRecord) -> Result<(), StoreError>;
    async fn delete_fired(&mut self, entry_id: &str) -> Result<bool, StoreError>;
    async fn select_fired_for_job(
        &mut self,
        job: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>, StoreError>;
    async fn select_fired_for_instance(
        &mut self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>, StoreError>;
    async fn select_fired_instance_ids(&mut self) -> Result<Vec<String>, StoreError>;
    async fn delete_fired_for_instance(&mut self, instance_id: &str) -> Result<u64, StoreError>;

    // scheduler heartbeat rows
    async fn select_scheduler_states(&mut self) -> Result<Vec<SchedulerStateRecord>, StoreError>;
    async fn upsert_scheduler_state(&mut self, record: &SchedulerStateRecord)
        -> Result<(), StoreError>;
    async fn delete_scheduler_state(&mut self, instance_id: &str) -> Result<bool, StoreError>;

    /// Remove every job, trigger, paused group and fired record.
    async fn clear_all(&mut self) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}
