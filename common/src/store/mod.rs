// Trigger and job store
//
// Every mutation runs in one backend transaction that first takes a cluster
// lock: TRIGGER_ACCESS for jobs, triggers and fired records, STATE_ACCESS
// for scheduler heartbeat rows. A failed step rolls the whole transaction
// back. Read-only queries take no lock and may see stale data.

pub mod backend;
pub mod memory;
pub mod postgres;

pub use backend::{StoreBackend, StoreTransaction};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

use crate::clock::Clock;
use crate::errors::StoreError;
use crate::keys::{JobKey, TriggerKey, RECOVERING_JOBS_GROUP};
use crate::lock::{LockConfig, LockName, LockSemaphore};
use crate::matchers::Matcher;
use crate::models::{
    CompletedExecutionInstruction, FiredTriggerBundle, FiredTriggerRecord, JobDetail,
    MisfireInstruction, Schedule, SchedulerStateRecord, Trigger, TriggerFiredResult,
    TriggerState, FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS,
    FAILED_JOB_ORIGINAL_TRIGGER_GROUP, FAILED_JOB_ORIGINAL_TRIGGER_NAME,
    FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS,
};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Candidates examined beyond `max_count` per acquisition, so rows skipped
/// for concurrency or misfire do not starve a batch.
const ACQUIRE_CANDIDATE_SLACK: usize = 20;

/// Extra time a cluster peer may miss its check-in by before it counts as failed.
const CLUSTER_CHECKIN_GRACE_MS: i64 = 7_500;

/// Job store settings
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// Scheduler name; lock rows are scoped to it
    pub instance_name: String,
    pub instance_id: String,
    pub clustered: bool,
    pub misfire_threshold: Duration,
    pub cluster_checkin_interval: Duration,
    pub max_misfires_to_handle_at_a_time: usize,
    pub lock: LockConfig,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            instance_name: "TriggerStoreScheduler".to_string(),
            instance_id: "NON_CLUSTERED".to_string(),
            clustered: false,
            misfire_threshold: Duration::milliseconds(60_000),
            cluster_checkin_interval: Duration::milliseconds(7_500),
            max_misfires_to_handle_at_a_time: 20,
            lock: LockConfig::default(),
        }
    }
}

/// Callbacks from the store into the scheduler that owns it
#[async_trait]
pub trait SchedulerSignaler: Send + Sync {
    async fn notify_trigger_misfired(&self, trigger: &Trigger);

    async fn notify_trigger_finalized(&self, trigger: &Trigger);

    /// Scheduling data changed; `candidate` is the earliest affected fire
    /// time, if known.
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);
}

/// Outcome of one misfire scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MisfireRecovery {
    pub processed: usize,
    pub has_more: bool,
    pub earliest_new_time: Option<DateTime<Utc>>,
}

/// Events gathered inside a transaction, delivered after it commits
#[derive(Debug, Default)]
struct Notifications {
    misfired: Vec<Trigger>,
    finalized: Vec<Trigger>,
    scheduling_change: bool,
    earliest: Option<DateTime<Utc>>,
}

impl Notifications {
    fn signal(&mut self, candidate: Option<DateTime<Utc>>) {
        self.scheduling_change = true;
        self.earliest = match (self.earliest, candidate) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Transactional repository of jobs and triggers shared by a scheduler cluster
pub struct JobStore<B: StoreBackend> {
    backend: Arc<B>,
    config: JobStoreConfig,
    semaphore: LockSemaphore,
    clock: Arc<dyn Clock>,
    signaler: OnceLock<Arc<dyn SchedulerSignaler>>,
    first_checkin: AtomicBool,
}

impl<B: StoreBackend> JobStore<B> {
    pub fn new(backend: Arc<B>, config: JobStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let semaphore = LockSemaphore::new(config.instance_name.clone(), config.lock.clone());
        Self {
            backend,
            config,
            semaphore,
            clock,
            signaler: OnceLock::new(),
            first_checkin: AtomicBool::new(true),
        }
    }

    /// Attach the owning scheduler. Later calls are ignored.
    pub fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) {
        if self.signaler.set(signaler).is_err() {
            warn!("Job store already initialized, ignoring signaler");
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn is_clustered(&self) -> bool {
        self.config.clustered
    }

    pub fn misfire_threshold(&self) -> Duration {
        self.config.misfire_threshold
    }

    pub fn cluster_checkin_interval(&self) -> Duration {
        self.config.cluster_checkin_interval
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ------------------------------------------------------------------
    // transaction plumbing
    // ------------------------------------------------------------------

    async fn begin_locked(&self, lock: LockName) -> Result<B::Tx, StoreError> {
        let mut tx = self.backend.begin().await?;
        match self.semaphore.obtain_lock(&mut tx, lock).await {
            Ok(_) => Ok(tx),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after lock failure failed");
                }
                Err(e.into())
            }
        }
    }

    async fn finish<T: Send>(
        &self,
        tx: B::Tx,
        result: Result<T, StoreError>,
        notes: Notifications,
    ) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                self.dispatch(notes).await;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, notes: Notifications) {
        let Some(signaler) = self.signaler.get() else {
            return;
        };
        for trigger in &notes.misfired {
            signaler.notify_trigger_misfired(trigger).await;
        }
        for trigger in &notes.finalized {
            signaler.notify_trigger_finalized(trigger).await;
        }
        if notes.scheduling_change {
            signaler.signal_scheduling_change(notes.earliest);
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Recover state left by a previous run of this scheduler.
    ///
    /// Clustered stores check in and recover failed peers (including this
    /// instance's own stale records); a standalone store resets every
    /// in-flight trigger.
    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn scheduler_started(&self) -> Result<(), StoreError> {
        if self.config.clustered {
            self.check_in_and_recover().await?;
        } else {
            self.recover_jobs().await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover_jobs(&self) -> Result<(), StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.recover_jobs_in_tx(&mut tx, &mut notes).await;
        self.finish(tx, result, notes).await
    }

    async fn recover_jobs_in_tx(
        &self,
        tx: &mut B::Tx,
        notes: &mut Notifications,
    ) -> Result<(), StoreError> {
        let reset = tx
            .update_all_trigger_states_from(
                TriggerState::Waiting,
                &[TriggerState::Acquired, TriggerState::Blocked],
            )
            .await?;
        let unblocked = tx
            .update_all_trigger_states_from(TriggerState::Paused, &[TriggerState::PausedBlocked])
            .await?;
        for key in tx.select_trigger_keys_in_state(TriggerState::Executing).await? {
            self.reset_executing_trigger(tx, &key).await?;
        }
        info!(reset, unblocked, "Freed in-flight triggers");

        let mut recovered = 0;
        for instance_id in tx.select_fired_instance_ids().await? {
            for record in tx.select_fired_for_instance(&instance_id).await? {
                if self.add_recovery_trigger(tx, &record).await? {
                    recovered += 1;
                }
            }
            tx.delete_fired_for_instance(&instance_id).await?;
        }
        info!(recovered, "Recovery triggers scheduled for interrupted jobs");

        let misfires = self
            .recover_misfired_in_tx(tx, usize::MAX, notes)
            .await?;
        info!(handled = misfires.processed, "Misfired triggers handled at startup");

        let mut removed = 0;
        for key in tx.select_trigger_keys_in_state(TriggerState::Complete).await? {
            if self.remove_trigger_in_tx(tx, &key, true).await? {
                removed += 1;
            }
        }
        info!(removed, "Removed completed triggers");
        Ok(())
    }

    /// Executing trigger whose run was lost goes back to waiting, or
    /// completes if it has nothing left to fire.
    async fn reset_executing_trigger(
        &self,
        tx: &mut B::Tx,
        key: &TriggerKey,
    ) -> Result<(), StoreError> {
        if let Some(trigger) = tx.select_trigger(key).await? {
            let state = if trigger.next_fire_time.is_some() {
                TriggerState::Waiting
            } else {
                TriggerState::Complete
            };
            tx.update_trigger_state_from(key, state, &[TriggerState::Executing])
                .await?;
        }
        Ok(())
    }

    /// Schedule a one-shot re-run for an interrupted execution of a job that
    /// requests recovery. Returns whether a trigger was added.
    async fn add_recovery_trigger(
        &self,
        tx: &mut B::Tx,
        record: &FiredTriggerRecord,
    ) -> Result<bool, StoreError> {
        if record.state != TriggerState::Executing || !record.requests_recovery {
            return Ok(false);
        }
        if tx.select_job(&record.job_key).await?.is_none() {
            return Ok(false);
        }

        let scheduled = record.scheduled_time.unwrap_or(record.fired_time);
        let (mut data_map, calendar_name) = match tx.select_trigger(&record.trigger_key).await? {
            Some(original) => (original.data_map, original.calendar_name),
            None => Default::default(),
        };
        data_map.put(FAILED_JOB_ORIGINAL_TRIGGER_NAME, record.trigger_key.name());
        data_map.put(FAILED_JOB_ORIGINAL_TRIGGER_GROUP, record.trigger_key.group());
        data_map.put(
            FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS,
            record.fired_time.timestamp_millis().to_string(),
        );
        data_map.put(
            FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS,
            scheduled.timestamp_millis().to_string(),
        );

        let key = TriggerKey::new(
            format!("recover_{}_{}", record.instance_id, Uuid::new_v4()),
            RECOVERING_JOBS_GROUP,
        );
        let mut trigger = Trigger::builder()
            .with_key(key)
            .for_job(record.job_key.clone())
            .with_schedule(Schedule::Once)
            .with_priority(record.priority)
            .with_misfire_instruction(MisfireInstruction::DoNothing)
            .with_data_map(data_map)
            .start_at(scheduled)
            .build()
            .map_err(|e| StoreError::InvalidTrigger(e.to_string()))?;
        trigger.state = TriggerState::Waiting;
        trigger.calendar_name = calendar_name;

        debug!(
            trigger = %trigger.key,
            job = %record.job_key,
            original = %record.trigger_key,
            "Recovery trigger created"
        );
        tx.upsert_trigger(&trigger).await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // storing and removing
    // ------------------------------------------------------------------

    /// Store a job; the stored copy's data map is clean.
    #[instrument(skip(self, job), fields(job = %job.key))]
    pub async fn store_job(&self, job: &JobDetail, replace: bool) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.store_job_in_tx(&mut tx, job, replace).await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn store_job_in_tx(
        &self,
        tx: &mut B::Tx,
        job: &JobDetail,
        replace: bool,
    ) -> Result<(), StoreError> {
        if !replace && tx.select_job(&job.key).await?.is_some() {
            return Err(StoreError::ObjectAlreadyExists(format!("Job '{}'", job.key)));
        }
        tx.upsert_job(job).await
    }

    /// Store a trigger for an existing job.
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    pub async fn store_trigger(&self, trigger: &Trigger, replace: bool) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.store_trigger_in_tx(&mut tx, trigger, replace).await;
        self.finish(tx, result, Notifications::default()).await
    }

    /// Store a job and its first trigger atomically.
    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key))]
    pub async fn store_job_and_trigger(
        &self,
        job: &JobDetail,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            self.store_job_in_tx(&mut tx, job, false).await?;
            self.store_trigger_in_tx(&mut tx, trigger, false).await
        }
        .await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn store_trigger_in_tx(
        &self,
        tx: &mut B::Tx,
        trigger: &Trigger,
        replace: bool,
    ) -> Result<(), StoreError> {
        if !replace && tx.select_trigger(&trigger.key).await?.is_some() {
            return Err(StoreError::ObjectAlreadyExists(format!(
                "Trigger '{}'",
                trigger.key
            )));
        }
        let job = tx
            .select_job(&trigger.job_key)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(trigger.job_key.to_string()))?;

        let paused = tx
            .select_paused_groups()
            .await?
            .iter()
            .any(|g| g == trigger.key.group());
        let blocked = job.concurrent_execution_disallowed
            && tx
                .select_fired_for_job(&job.key)
                .await?
                .iter()
                .any(|r| r.state == TriggerState::Executing);

        let mut stored = trigger.clone();
        stored.fire_instance_id = None;
        stored.state = match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        };
        if stored.next_fire_time.is_none()
            && stored.times_triggered == 0
            && stored.compute_first_fire_time()?.is_none()
        {
            return Err(StoreError::InvalidTrigger(format!(
                "Trigger '{}' will never fire",
                stored.key
            )));
        }
        tx.upsert_trigger(&stored).await
    }

    /// Remove a job and all of its triggers.
    #[instrument(skip(self))]
    pub async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.remove_job_in_tx(&mut tx, key).await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn remove_job_in_tx(&self, tx: &mut B::Tx, key: &JobKey) -> Result<bool, StoreError> {
        for trigger in tx.select_triggers_for_job(key).await? {
            tx.delete_trigger(&trigger.key).await?;
        }
        tx.delete_job(key).await
    }

    /// Remove a trigger; a non-durable job left without triggers goes too.
    #[instrument(skip(self))]
    pub async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.remove_trigger_in_tx(&mut tx, key, true).await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn remove_trigger_in_tx(
        &self,
        tx: &mut B::Tx,
        key: &TriggerKey,
        remove_orphaned_job: bool,
    ) -> Result<bool, StoreError> {
        let Some(trigger) = tx.select_trigger(key).await? else {
            return Ok(false);
        };
        tx.delete_trigger(key).await?;

        if remove_orphaned_job {
            if let Some(job) = tx.select_job(&trigger.job_key).await? {
                if !job.durable && tx.select_triggers_for_job(&job.key).await?.is_empty() {
                    debug!(job = %job.key, "Removing non-durable job without triggers");
                    tx.delete_job(&job.key).await?;
                }
            }
        }
        Ok(true)
    }

    /// Swap the trigger stored under `key` for `new_trigger`, which must
    /// fire the same job. Returns false if `key` does not exist.
    #[instrument(skip(self, new_trigger), fields(new_trigger = %new_trigger.key))]
    pub async fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            let Some(old) = tx.select_trigger(key).await? else {
                return Ok(false);
            };
            if old.job_key != new_trigger.job_key {
                return Err(StoreError::InvalidTrigger(
                    "New trigger is not related to the same job as the old trigger".to_string(),
                ));
            }
            self.remove_trigger_in_tx(&mut tx, key, false).await?;
            self.store_trigger_in_tx(&mut tx, new_trigger, false).await?;
            Ok(true)
        }
        .await;
        self.finish(tx, result, Notifications::default()).await
    }

    /// Delete every job, trigger, paused group and fired record.
    #[instrument(skip(self))]
    pub async fn clear_all_scheduling_data(&self) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = tx.clear_all().await;
        self.finish(tx, result, Notifications::default()).await
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    pub async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let result = tx.select_job(key).await;
        self.finish(tx, result, Notifications::default()).await
    }

    pub async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let result = tx.select_trigger(key).await;
        self.finish(tx, result, Notifications::default()).await
    }

    pub async fn trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, StoreError> {
        Ok(self.retrieve_trigger(key).await?.map(|t| t.state))
    }

    pub async fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let result = tx.select_triggers_for_job(key).await;
        self.finish(tx, result, Notifications::default()).await
    }

    pub async fn job_exists(&self, key: &JobKey) -> Result<bool, StoreError> {
        Ok(self.retrieve_job(key).await?.is_some())
    }

    pub async fn trigger_exists(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        Ok(self.retrieve_trigger(key).await?.is_some())
    }

    /// Job keys accepted by `matcher`, sorted.
    pub async fn job_keys(&self, matcher: &Matcher<JobKey>) -> Result<Vec<JobKey>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let result = tx.select_job_keys().await;
        let mut keys = self.finish(tx, result, Notifications::default()).await?;
        keys.retain(|k| matcher.is_match(k));
        keys.sort();
        Ok(keys)
    }

    /// Trigger keys accepted by `matcher`, sorted.
    pub async fn trigger_keys(
        &self,
        matcher: &Matcher<TriggerKey>,
    ) -> Result<Vec<TriggerKey>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let result = tx.select_trigger_keys().await;
        let mut keys = self.finish(tx, result, Notifications::default()).await?;
        keys.retain(|k| matcher.is_match(k));
        keys.sort();
        Ok(keys)
    }

    pub async fn job_group_names(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.job_keys(&Matcher::everything()).await?;
        let groups: BTreeSet<String> = keys.into_iter().map(|k| k.group().to_string()).collect();
        Ok(groups.into_iter().collect::<Vec<_>>())
    }

    pub async fn trigger_group_names(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.trigger_keys(&Matcher::everything()).await?;
        let groups: BTreeSet<String> = keys.into_iter().map(|k| k.group().to_string()).collect();
        Ok(groups.into_iter().collect::<Vec<_>>())
    }

    pub async fn paused_trigger_groups(&self) -> Result<Vec<String>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let result = tx.select_paused_groups().await;
        self.finish(tx, result, Notifications::default()).await
    }

    pub async fn number_of_jobs(&self) -> Result<usize, StoreError> {
        Ok(self.job_keys(&Matcher::everything()).await?.len())
    }

    pub async fn number_of_triggers(&self) -> Result<usize, StoreError> {
        Ok(self.trigger_keys(&Matcher::everything()).await?.len())
    }

    /// Heartbeat rows of every known scheduler instance.
    pub async fn scheduler_states(&self) -> Result<Vec<SchedulerStateRecord>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let result = tx.select_scheduler_states().await;
        self.finish(tx, result, Notifications::default()).await
    }

    // ------------------------------------------------------------------
    // pause / resume
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.pause_trigger_in_tx(&mut tx, key).await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn pause_trigger_in_tx(&self, tx: &mut B::Tx, key: &TriggerKey) -> Result<(), StoreError> {
        let Some(trigger) = tx.select_trigger(key).await? else {
            return Ok(());
        };
        let new_state = match trigger.state {
            TriggerState::Waiting | TriggerState::Acquired | TriggerState::Executing => {
                TriggerState::Paused
            }
            TriggerState::Blocked => TriggerState::PausedBlocked,
            _ => return Ok(()),
        };
        tx.update_trigger_state_from(key, new_state, &[trigger.state])
            .await?;
        Ok(())
    }

    /// Pause matching triggers. A group-equals matcher also marks the group
    /// paused so triggers added to it later start paused. Returns the
    /// affected group names.
    #[instrument(skip(self))]
    pub async fn pause_triggers(
        &self,
        matcher: &Matcher<TriggerKey>,
    ) -> Result<Vec<String>, StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.pause_triggers_in_tx(&mut tx, matcher).await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn pause_triggers_in_tx(
        &self,
        tx: &mut B::Tx,
        matcher: &Matcher<TriggerKey>,
    ) -> Result<Vec<String>, StoreError> {
        let mut groups = BTreeSet::new();
        if let Some(group) = matcher.exact_group() {
            tx.insert_paused_group(group).await?;
            groups.insert(group.to_string());
        }
        for key in tx.select_trigger_keys().await? {
            if matcher.is_match(&key) {
                self.pause_trigger_in_tx(tx, &key).await?;
                groups.insert(key.group().to_string());
            }
        }
        Ok(groups.into_iter().collect::<Vec<_>>())
    }

    #[instrument(skip(self))]
    pub async fn pause_job(&self, key: &JobKey) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.pause_job_in_tx(&mut tx, key).await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn pause_job_in_tx(&self, tx: &mut B::Tx, key: &JobKey) -> Result<(), StoreError> {
        for trigger in tx.select_triggers_for_job(key).await? {
            self.pause_trigger_in_tx(tx, &trigger.key).await?;
        }
        Ok(())
    }

    /// Pause every trigger of every matching job. Returns the job groups touched.
    #[instrument(skip(self))]
    pub async fn pause_jobs(&self, matcher: &Matcher<JobKey>) -> Result<Vec<String>, StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            let mut groups = BTreeSet::new();
            for key in tx.select_job_keys().await? {
                if matcher.is_match(&key) {
                    self.pause_job_in_tx(&mut tx, &key).await?;
                    groups.insert(key.group().to_string());
                }
            }
            Ok(groups.into_iter().collect::<Vec<_>>())
        }
        .await;
        self.finish(tx, result, Notifications::default()).await
    }

    #[instrument(skip(self))]
    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.resume_trigger_in_tx(&mut tx, key, &mut notes).await;
        self.finish(tx, result, notes).await
    }

    async fn resume_trigger_in_tx(
        &self,
        tx: &mut B::Tx,
        key: &TriggerKey,
        notes: &mut Notifications,
    ) -> Result<(), StoreError> {
        let Some(mut trigger) = tx.select_trigger(key).await? else {
            return Ok(());
        };
        if !trigger.state.is_paused() {
            return Ok(());
        }

        let fired = tx.select_fired_for_job(&trigger.job_key).await?;
        let running_self = fired
            .iter()
            .any(|r| &r.trigger_key == key && r.state == TriggerState::Executing);
        let job_blocked = fired
            .iter()
            .any(|r| r.nonconcurrent && r.state == TriggerState::Executing);

        trigger.state = if running_self {
            TriggerState::Executing
        } else if job_blocked {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };

        if trigger.state == TriggerState::Waiting
            && trigger.misfire_instruction.resolve() == MisfireInstruction::SkipToNext
        {
            self.apply_misfire(&mut trigger, notes)?;
        }
        notes.signal(trigger.next_fire_time);
        tx.upsert_trigger(&trigger).await
    }

    /// Resume matching triggers, clearing the paused mark of a group-equals
    /// matcher's group. Returns the affected group names.
    #[instrument(skip(self))]
    pub async fn resume_triggers(
        &self,
        matcher: &Matcher<TriggerKey>,
    ) -> Result<Vec<String>, StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.resume_triggers_in_tx(&mut tx, matcher, &mut notes).await;
        self.finish(tx, result, notes).await
    }

    async fn resume_triggers_in_tx(
        &self,
        tx: &mut B::Tx,
        matcher: &Matcher<TriggerKey>,
        notes: &mut Notifications,
    ) -> Result<Vec<String>, StoreError> {
        let mut groups = BTreeSet::new();
        if let Some(group) = matcher.exact_group() {
            tx.delete_paused_group(group).await?;
            groups.insert(group.to_string());
        }
        for key in tx.select_trigger_keys().await? {
            if matcher.is_match(&key) {
                self.resume_trigger_in_tx(tx, &key, notes).await?;
                groups.insert(key.group().to_string());
            }
        }
        Ok(groups.into_iter().collect::<Vec<_>>())
    }

    #[instrument(skip(self))]
    pub async fn resume_job(&self, key: &JobKey) -> Result<(), StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self.resume_job_in_tx(&mut tx, key, &mut notes).await;
        self.finish(tx, result, notes).await
    }

    async fn resume_job_in_tx(
        &self,
        tx: &mut B::Tx,
        key: &JobKey,
        notes: &mut Notifications,
    ) -> Result<(), StoreError> {
        for trigger in tx.select_triggers_for_job(key).await? {
            self.resume_trigger_in_tx(tx, &trigger.key, notes).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume_jobs(&self, matcher: &Matcher<JobKey>) -> Result<Vec<String>, StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            let mut groups = BTreeSet::new();
            for key in tx.select_job_keys().await? {
                if matcher.is_match(&key) {
                    self.resume_job_in_tx(&mut tx, &key, &mut notes).await?;
                    groups.insert(key.group().to_string());
                }
            }
            Ok(groups.into_iter().collect::<Vec<_>>())
        }
        .await;
        self.finish(tx, result, notes).await
    }

    /// Pause every trigger group, marking each one paused.
    #[instrument(skip(self))]
    pub async fn pause_all(&self) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            let groups: BTreeSet<String> = tx
                .select_trigger_keys()
                .await?
                .into_iter()
                .map(|k| k.group().to_string())
                .collect();
            for group in groups {
                self.pause_triggers_in_tx(&mut tx, &Matcher::group_equals(group))
                    .await?;
            }
            Ok(())
        }
        .await;
        self.finish(tx, result, Notifications::default()).await
    }

    /// Resume every trigger and clear all paused group marks.
    #[instrument(skip(self))]
    pub async fn resume_all(&self) -> Result<(), StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            for group in tx.select_paused_groups().await? {
                tx.delete_paused_group(&group).await?;
            }
            self.resume_triggers_in_tx(&mut tx, &Matcher::everything(), &mut notes)
                .await
                .map(|_| ())
        }
        .await;
        self.finish(tx, result, notes).await
    }

    // ------------------------------------------------------------------
    // firing
    // ------------------------------------------------------------------

    /// Apply the misfire instruction if `trigger` is misfired. A trigger left
    /// without a next fire time becomes `Complete`.
    fn apply_misfire(
        &self,
        trigger: &mut Trigger,
        notes: &mut Notifications,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        if !trigger.is_misfired(now, self.config.misfire_threshold) {
            return Ok(false);
        }

        debug!(
            trigger = %trigger.key,
            next_fire_time = ?trigger.next_fire_time,
            instruction = trigger.misfire_instruction.as_str(),
            "Trigger misfired"
        );
        telemetry::record_misfire(trigger.misfire_instruction.as_str());
        notes.misfired.push(trigger.clone());

        trigger.update_after_misfire(now)?;
        if trigger.next_fire_time.is_none() {
            trigger.state = TriggerState::Complete;
            notes.finalized.push(trigger.clone());
        }
        Ok(true)
    }

    /// Acquire up to `max_count` triggers due by `no_later_than`, moving
    /// them from `Waiting` to `Acquired`.
    ///
    /// Triggers are taken in (next fire time, priority desc, key) order.
    /// Once the first is taken the batch closes at `max(its fire time, now)
    /// + time_window`. At most one trigger per non-concurrent job is taken.
    /// Misfired triggers have their instruction applied first.
    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self
            .acquire_in_tx(&mut tx, no_later_than, max_count.max(1), time_window, &mut notes)
            .await;
        let acquired = self.finish(tx, result, notes).await?;
        if !acquired.is_empty() {
            telemetry::record_triggers_acquired(acquired.len());
            debug!(count = acquired.len(), "Triggers acquired");
        }
        Ok(acquired)
    }

    async fn acquire_in_tx(
        &self,
        tx: &mut B::Tx,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
        notes: &mut Notifications,
    ) -> Result<Vec<Trigger>, StoreError> {
        let now = self.clock.now();
        let mut acquired: Vec<Trigger> = Vec::new();
        let mut nonconcurrent_jobs: HashSet<JobKey> = HashSet::new();
        let mut batch_end = no_later_than;

        let candidates = tx
            .select_due_triggers(
                no_later_than + time_window,
                max_count.saturating_add(ACQUIRE_CANDIDATE_SLACK),
            )
            .await?;

        for mut trigger in candidates {
            if acquired.len() >= max_count {
                break;
            }

            let Some(job) = tx.select_job(&trigger.job_key).await? else {
                warn!(trigger = %trigger.key, job = %trigger.job_key, "Trigger references missing job");
                tx.update_trigger_state_from(&trigger.key, TriggerState::Error, &[])
                    .await?;
                continue;
            };

            if nonconcurrent_jobs.contains(&job.key) {
                continue;
            }

            let misfired = self.apply_misfire(&mut trigger, notes)?;
            if trigger.state == TriggerState::Complete {
                tx.upsert_trigger(&trigger).await?;
                continue;
            }

            let Some(next) = trigger.next_fire_time else {
                continue;
            };
            if next > batch_end {
                if misfired {
                    tx.upsert_trigger(&trigger).await?;
                    continue;
                }
                break;
            }

            let rows = tx
                .update_trigger_state_from(
                    &trigger.key,
                    TriggerState::Acquired,
                    &[TriggerState::Waiting],
                )
                .await?;
            if rows == 0 {
                continue;
            }

            let fire_instance_id = Uuid::new_v4().to_string();
            trigger.state = TriggerState::Acquired;
            trigger.fire_instance_id = Some(fire_instance_id.clone());
            tx.upsert_trigger(&trigger).await?;
            tx.upsert_fired(&FiredTriggerRecord {
                entry_id: fire_instance_id,
                trigger_key: trigger.key.clone(),
                job_key: job.key.clone(),
                instance_id: self.config.instance_id.clone(),
                fired_time: now,
                scheduled_time: Some(next),
                priority: trigger.priority,
                state: TriggerState::Acquired,
                nonconcurrent: job.concurrent_execution_disallowed,
                requests_recovery: job.requests_recovery,
            })
            .await?;

            if job.concurrent_execution_disallowed {
                nonconcurrent_jobs.insert(job.key.clone());
            }
            if acquired.is_empty() {
                batch_end = next.max(now) + time_window;
            }
            acquired.push(trigger);
        }

        Ok(acquired)
    }

    /// Return an acquired trigger to `Waiting` and drop its fired record.
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    pub async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            tx.update_trigger_state_from(
                &trigger.key,
                TriggerState::Waiting,
                &[TriggerState::Acquired],
            )
            .await?;
            if let Some(entry_id) = &trigger.fire_instance_id {
                tx.delete_fired(entry_id).await?;
            }
            Ok(())
        }
        .await;
        self.finish(tx, result, Notifications::default()).await
    }

    /// Move acquired triggers to `Executing` and build their bundles.
    ///
    /// A trigger no longer `Acquired` under the same acquisition, or whose
    /// non-concurrent job is already running, is skipped and its fired
    /// record removed; the latter goes to `Blocked`.
    #[instrument(skip(self, triggers), fields(count = triggers.len()))]
    pub async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<TriggerFiredResult>, StoreError> {
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result: Result<_, StoreError> = async {
            let now = self.clock.now();
            let mut results = Vec::with_capacity(triggers.len());
            for trigger in triggers {
                results.push(self.trigger_fired_in_tx(&mut tx, trigger, now).await?);
            }
            Ok(results)
        }
        .await;
        self.finish(tx, result, Notifications::default()).await
    }

    async fn trigger_fired_in_tx(
        &self,
        tx: &mut B::Tx,
        acquired: &Trigger,
        now: DateTime<Utc>,
    ) -> Result<TriggerFiredResult, StoreError> {
        let entry_id = acquired.fire_instance_id.clone().unwrap_or_default();

        let current = tx.select_trigger(&acquired.key).await?;
        let mut trigger = match current {
            Some(t) if t.state == TriggerState::Acquired && t.fire_instance_id.as_deref() == Some(entry_id.as_str()) => t,
            _ => {
                debug!(trigger = %acquired.key, "Trigger no longer acquired, skipping");
                tx.delete_fired(&entry_id).await?;
                return Ok(TriggerFiredResult::Skipped);
            }
        };

        let Some(job) = tx.select_job(&trigger.job_key).await? else {
            warn!(trigger = %trigger.key, job = %trigger.job_key, "Job missing at fire time");
            tx.update_trigger_state_from(&trigger.key, TriggerState::Error, &[])
                .await?;
            tx.delete_fired(&entry_id).await?;
            return Ok(TriggerFiredResult::Failed(StoreError::JobNotFound(
                trigger.job_key.to_string(),
            )));
        };

        if job.concurrent_execution_disallowed {
            let running = tx
                .select_fired_for_job(&job.key)
                .await?
                .into_iter()
                .any(|r| r.state == TriggerState::Executing && r.entry_id != entry_id);
            if running {
                debug!(trigger = %trigger.key, job = %job.key, "Job already executing, blocking trigger");
                tx.update_trigger_state_from(
                    &trigger.key,
                    TriggerState::Blocked,
                    &[TriggerState::Acquired],
                )
                .await?;
                tx.delete_fired(&entry_id).await?;
                return Ok(TriggerFiredResult::Skipped);
            }
        }

        let scheduled_fire_time = trigger.next_fire_time;
        let prev_fire_time = trigger.previous_fire_time;
        if let Err(e) = trigger.triggered(now) {
            warn!(trigger = %trigger.key, error = %e, "Failed to compute next fire time");
            tx.update_trigger_state_from(&trigger.key, TriggerState::Error, &[])
                .await?;
            tx.delete_fired(&entry_id).await?;
            return Ok(TriggerFiredResult::Failed(e.into()));
        }
        trigger.state = TriggerState::Executing;
        tx.upsert_trigger(&trigger).await?;

        tx.upsert_fired(&FiredTriggerRecord {
            entry_id: entry_id.clone(),
            trigger_key: trigger.key.clone(),
            job_key: job.key.clone(),
            instance_id: self.config.instance_id.clone(),
            fired_time: now,
            scheduled_time: scheduled_fire_time,
            priority: trigger.priority,
            state: TriggerState::Executing,
            nonconcurrent: job.concurrent_execution_disallowed,
            requests_recovery: job.requests_recovery,
        })
        .await?;

        if job.concurrent_execution_disallowed {
            tx.update_job_trigger_states_from(
                &job.key,
                TriggerState::Blocked,
                &[TriggerState::Waiting, TriggerState::Acquired],
            )
            .await?;
            tx.update_job_trigger_states_from(
                &job.key,
                TriggerState::PausedBlocked,
                &[TriggerState::Paused],
            )
            .await?;
        }

        telemetry::record_trigger_fired(trigger.key.group());
        let recovering = trigger.key.group() == RECOVERING_JOBS_GROUP;
        let next_fire_time = trigger.next_fire_time;
        let calendar_name = trigger.calendar_name.clone();
        Ok(TriggerFiredResult::Fired(Box::new(FiredTriggerBundle {
            trigger,
            job,
            recovering,
            fire_time: now,
            scheduled_fire_time,
            prev_fire_time,
            next_fire_time,
            fire_instance_id: entry_id,
            calendar_name,
        })))
    }

    /// Record the end of an execution and apply `instruction`.
    ///
    /// Unblocks siblings of a non-concurrent job, persists the job's data map
    /// when the job asks for it and drops the fired record.
    #[instrument(skip(self, trigger, job), fields(trigger = %trigger.key, instruction = ?instruction))]
    pub async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self
            .job_complete_in_tx(&mut tx, trigger, job, instruction, &mut notes)
            .await;
        self.finish(tx, result, notes).await
    }

    async fn job_complete_in_tx(
        &self,
        tx: &mut B::Tx,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
        notes: &mut Notifications,
    ) -> Result<(), StoreError> {
        let current = tx.select_trigger(&trigger.key).await?;

        match instruction {
            CompletedExecutionInstruction::DeleteTrigger => match &current {
                Some(stored) if stored.next_fire_time.is_none() => {
                    self.remove_trigger_in_tx(tx, &trigger.key, true).await?;
                    notes.finalized.push(stored.clone());
                }
                // Rescheduled while running; keep it
                Some(stored) => {
                    self.finish_execution_state(tx, stored, notes).await?;
                }
                None => {}
            },
            CompletedExecutionInstruction::SetTriggerComplete => {
                tx.update_trigger_state_from(&trigger.key, TriggerState::Complete, &[])
                    .await?;
                if let Some(stored) = current {
                    notes.finalized.push(stored);
                }
            }
            CompletedExecutionInstruction::SetTriggerError => {
                info!(trigger = %trigger.key, "Trigger set to ERROR state");
                tx.update_trigger_state_from(&trigger.key, TriggerState::Error, &[])
                    .await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                tx.update_job_trigger_states_from(&job.key, TriggerState::Complete, &[])
                    .await?;
                if let Some(stored) = current {
                    notes.finalized.push(stored);
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                info!(job = %job.key, "All triggers of job set to ERROR state");
                tx.update_job_trigger_states_from(&job.key, TriggerState::Error, &[])
                    .await?;
            }
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {
                if let Some(stored) = &current {
                    self.finish_execution_state(tx, stored, notes).await?;
                }
            }
        }

        if job.concurrent_execution_disallowed {
            tx.update_job_trigger_states_from(
                &job.key,
                TriggerState::Waiting,
                &[TriggerState::Blocked],
            )
            .await?;
            tx.update_job_trigger_states_from(
                &job.key,
                TriggerState::Paused,
                &[TriggerState::PausedBlocked],
            )
            .await?;
            notes.signal(None);
        }

        if job.persist_job_data_after_execution && job.data_map.is_dirty() {
            tx.update_job_data(&job.key, &job.data_map).await?;
        }

        if let Some(entry_id) = &trigger.fire_instance_id {
            tx.delete_fired(entry_id).await?;
        }
        Ok(())
    }

    /// `Executing` back to `Waiting`, or `Complete` with nothing left to fire.
    async fn finish_execution_state(
        &self,
        tx: &mut B::Tx,
        stored: &Trigger,
        notes: &mut Notifications,
    ) -> Result<(), StoreError> {
        let next_state = if stored.next_fire_time.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        let rows = tx
            .update_trigger_state_from(&stored.key, next_state, &[TriggerState::Executing])
            .await?;
        if rows > 0 {
            if next_state == TriggerState::Complete {
                notes.finalized.push(stored.clone());
            } else {
                notes.signal(stored.next_fire_time);
            }
        }
        Ok(())
    }

    /// Apply misfire instructions to waiting triggers late by more than the
    /// threshold, at most `max_misfires_to_handle_at_a_time` per call.
    #[instrument(skip(self))]
    pub async fn recover_misfired_triggers(&self) -> Result<MisfireRecovery, StoreError> {
        let before = self.clock.now() - self.config.misfire_threshold;

        // Cheap unlocked probe; most passes find nothing
        let mut probe = self.backend.begin().await?;
        let found = probe.select_misfired_triggers(before, 1).await;
        let found = self.finish(probe, found, Notifications::default()).await?;
        if found.is_empty() {
            return Ok(MisfireRecovery::default());
        }

        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::TriggerAccess).await?;
        let result = self
            .recover_misfired_in_tx(&mut tx, self.config.max_misfires_to_handle_at_a_time, &mut notes)
            .await;
        let recovery = self.finish(tx, result, notes).await?;
        if recovery.processed > 0 {
            info!(
                handled = recovery.processed,
                has_more = recovery.has_more,
                "Handled misfired triggers"
            );
        }
        Ok(recovery)
    }

    async fn recover_misfired_in_tx(
        &self,
        tx: &mut B::Tx,
        max: usize,
        notes: &mut Notifications,
    ) -> Result<MisfireRecovery, StoreError> {
        let before = self.clock.now() - self.config.misfire_threshold;
        let misfired = tx
            .select_misfired_triggers(before, max.saturating_add(1))
            .await?;

        let mut recovery = MisfireRecovery {
            has_more: misfired.len() > max,
            ..MisfireRecovery::default()
        };
        for mut trigger in misfired.into_iter().take(max) {
            if !self.apply_misfire(&mut trigger, notes)? {
                continue;
            }
            tx.upsert_trigger(&trigger).await?;
            recovery.processed += 1;
            if let Some(next) = trigger.next_fire_time {
                recovery.earliest_new_time = Some(match recovery.earliest_new_time {
                    Some(current) => current.min(next),
                    None => next,
                });
            }
        }
        if recovery.processed > 0 {
            notes.signal(recovery.earliest_new_time);
        }
        Ok(recovery)
    }

    // ------------------------------------------------------------------
    // clustering
    // ------------------------------------------------------------------

    /// Refresh this instance's heartbeat and report failed instances.
    ///
    /// A peer has failed when its last check-in plus its interval plus a
    /// grace period lies in the past. On this instance's first check-in its
    /// own leftover records, and fired records of instances with no heartbeat
    /// row, count as failed too.
    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn cluster_checkin(&self) -> Result<Vec<SchedulerStateRecord>, StoreError> {
        let mut tx = self.begin_locked(LockName::StateAccess).await?;
        let result = self.checkin_in_tx(&mut tx).await;
        let failed = self.finish(tx, result, Notifications::default()).await?;
        self.first_checkin.store(false, Ordering::SeqCst);
        Ok(failed)
    }

    async fn checkin_in_tx(&self, tx: &mut B::Tx) -> Result<Vec<SchedulerStateRecord>, StoreError> {
        let now = self.clock.now();
        let first = self.first_checkin.load(Ordering::SeqCst);
        let states = tx.select_scheduler_states().await?;

        let mut failed = Vec::new();
        for state in &states {
            if state.instance_id == self.config.instance_id {
                if first {
                    failed.push(state.clone());
                }
            } else {
                let deadline = state.last_checkin
                    + Duration::milliseconds(state.checkin_interval_ms + CLUSTER_CHECKIN_GRACE_MS);
                if deadline < now {
                    failed.push(state.clone());
                }
            }
        }

        if first {
            let known: HashSet<&str> = states.iter().map(|s| s.instance_id.as_str()).collect();
            for instance_id in tx.select_fired_instance_ids().await? {
                if !known.contains(instance_id.as_str()) {
                    failed.push(SchedulerStateRecord {
                        instance_id,
                        last_checkin: now,
                        checkin_interval_ms: self.config.cluster_checkin_interval.num_milliseconds(),
                    });
                }
            }
        }

        tx.upsert_scheduler_state(&SchedulerStateRecord {
            instance_id: self.config.instance_id.clone(),
            last_checkin: now,
            checkin_interval_ms: self.config.cluster_checkin_interval.num_milliseconds(),
        })
        .await?;

        for state in &failed {
            if state.instance_id != self.config.instance_id {
                warn!(
                    failed_instance = %state.instance_id,
                    last_checkin = %state.last_checkin,
                    "Scheduler instance detected as failed"
                );
            }
        }
        Ok(failed)
    }

    /// Reclaim the in-flight work of failed instances. Takes both locks.
    #[instrument(skip(self, failed), fields(failed = failed.len()))]
    pub async fn cluster_recover(&self, failed: &[SchedulerStateRecord]) -> Result<(), StoreError> {
        if failed.is_empty() {
            return Ok(());
        }
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::StateAccess).await?;
        let result: Result<_, StoreError> = async {
            self.semaphore
                .obtain_lock(&mut tx, LockName::TriggerAccess)
                .await?;
            self.recover_in_tx(&mut tx, failed, &mut notes).await
        }
        .await;
        self.finish(tx, result, notes).await
    }

    /// Check in and, in the same transaction, recover any failed instances.
    /// Returns whether anything was recovered.
    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn check_in_and_recover(&self) -> Result<bool, StoreError> {
        let mut notes = Notifications::default();
        let mut tx = self.begin_locked(LockName::StateAccess).await?;
        let result: Result<_, StoreError> = async {
            let failed = self.checkin_in_tx(&mut tx).await?;
            if failed.is_empty() {
                return Ok(false);
            }
            self.semaphore
                .obtain_lock(&mut tx, LockName::TriggerAccess)
                .await?;
            self.recover_in_tx(&mut tx, &failed, &mut notes).await?;
            Ok(true)
        }
        .await;
        let recovered = self.finish(tx, result, notes).await?;
        self.first_checkin.store(false, Ordering::SeqCst);
        Ok(recovered)
    }

    async fn recover_in_tx(
        &self,
        tx: &mut B::Tx,
        failed: &[SchedulerStateRecord],
        notes: &mut Notifications,
    ) -> Result<(), StoreError> {
        for state in failed {
            let records = tx.select_fired_for_instance(&state.instance_id).await?;
            let mut acquired = 0;
            let mut executing = 0;
            let mut recovered = 0;

            for record in &records {
                match record.state {
                    TriggerState::Acquired => {
                        tx.update_trigger_state_from(
                            &record.trigger_key,
                            TriggerState::Waiting,
                            &[TriggerState::Acquired],
                        )
                        .await?;
                        acquired += 1;
                    }
                    TriggerState::Executing => {
                        self.reset_executing_trigger(tx, &record.trigger_key).await?;
                        executing += 1;
                        if self.add_recovery_trigger(tx, record).await? {
                            recovered += 1;
                        }
                    }
                    _ => {}
                }
                if record.nonconcurrent {
                    tx.update_job_trigger_states_from(
                        &record.job_key,
                        TriggerState::Waiting,
                        &[TriggerState::Blocked],
                    )
                    .await?;
                    tx.update_job_trigger_states_from(
                        &record.job_key,
                        TriggerState::Paused,
                        &[TriggerState::PausedBlocked],
                    )
                    .await?;
                }
            }

            tx.delete_fired_for_instance(&state.instance_id).await?;
            if state.instance_id != self.config.instance_id {
                tx.delete_scheduler_state(&state.instance_id).await?;
            }

            info!(
                failed_instance = %state.instance_id,
                acquired,
                executing,
                recovered,
                "Recovered failed scheduler instance"
            );
        }
        notes.signal(None);
        Ok(())
    }
}
