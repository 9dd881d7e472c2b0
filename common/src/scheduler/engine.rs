// Firing coordinator and scheduler facade

use crate::context::SchedulerInfo;
use crate::data_map::DataMap;
use crate::errors::{SchedulerError, StoreError};
use crate::job::JobRegistry;
use crate::keys::{JobKey, TriggerKey, MANUAL_TRIGGER_GROUP};
use crate::listeners::ListenerManager;
use crate::matchers::Matcher;
use crate::models::{
    CompletedExecutionInstruction, FiredTriggerBundle, JobDetail, Trigger, TriggerFiredResult,
    TriggerState,
};
use crate::retry::{FixedDelay, RetryStrategy};
use crate::scheduler::background::{spawn_cluster_manager, spawn_misfire_handler};
use crate::scheduler::shell::{completion_backoff, JobRunShell, RunningJobs, ShellEnv};
use crate::scheduler::worker_pool::WorkerPool;
use crate::store::{JobStore, SchedulerSignaler, StoreBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the firing coordinator
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler_name: String,
    /// Longest the loop sleeps when nothing is due
    pub idle_wait: Duration,
    /// Most triggers acquired per cycle
    pub batch_max_size: usize,
    /// How far past the first trigger's fire time a batch may reach
    pub batch_time_window: chrono::Duration,
    /// Pause after a failed store call before trying again
    pub db_failure_retry_interval: Duration,
    /// Consecutive store failures before listeners hear about it
    pub store_failure_give_up_threshold: u32,
    pub thread_count: usize,
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "TriggerStoreScheduler".to_string(),
            idle_wait: Duration::from_secs(30),
            batch_max_size: 1,
            batch_time_window: chrono::Duration::zero(),
            db_failure_retry_interval: Duration::from_secs(15),
            store_failure_give_up_threshold: 10,
            thread_count: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Scheduler trait for the coordinator control loop
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Recover store state, start background tasks and run the firing loop
    /// until `stop` is called
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Stop the loop, wait for running jobs and notify listeners
    async fn stop(&self) -> Result<(), SchedulerError>;

    /// One acquire, wait, fire and dispatch pass. Returns the number of
    /// jobs handed to the worker pool.
    async fn run_cycle(&self) -> Result<usize, SchedulerError>;
}

/// A job running on this node, as reported by `currently_executing_jobs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutingJob {
    pub fire_instance_id: String,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
}

/// Wakes the firing loop when scheduling data changes.
///
/// Holds the earliest candidate fire time signalled since the loop last
/// cleared it; an unknown candidate counts as "now".
pub(crate) struct SchedulingSignal {
    notify: Notify,
    pending: Mutex<Option<DateTime<Utc>>>,
    listeners: Arc<ListenerManager>,
}

impl SchedulingSignal {
    fn new(listeners: Arc<ListenerManager>) -> Self {
        Self {
            notify: Notify::new(),
            pending: Mutex::new(None),
            listeners,
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn signal(&self, candidate: Option<DateTime<Utc>>) {
        let when = candidate.unwrap_or(DateTime::<Utc>::MIN_UTC);
        {
            let mut pending = self.pending();
            *pending = Some(pending.map_or(when, |current| current.min(when)));
        }
        self.notify.notify_one();
    }

    fn clear(&self) {
        *self.pending() = None;
    }

    /// Consume the pending signal if it names a time before `fire_at`.
    fn take_if_earlier(&self, fire_at: DateTime<Utc>) -> bool {
        let mut pending = self.pending();
        match *pending {
            Some(candidate) if candidate < fire_at => {
                *pending = None;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl SchedulerSignaler for SchedulingSignal {
    async fn notify_trigger_misfired(&self, trigger: &Trigger) {
        self.listeners.notify_trigger_misfired(trigger).await;
    }

    async fn notify_trigger_finalized(&self, trigger: &Trigger) {
        self.listeners.notify_trigger_finalized(trigger).await;
    }

    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.signal(candidate);
    }
}

/// Why the loop stopped waiting for the first acquired trigger
enum FireWait {
    Due,
    EarlierTrigger,
    Shutdown,
}

/// Main scheduler engine implementation
pub struct SchedulerEngine<B: StoreBackend> {
    config: EngineConfig,
    store: Arc<JobStore<B>>,
    registry: JobRegistry,
    listeners: Arc<ListenerManager>,
    signal: Arc<SchedulingSignal>,
    pool: WorkerPool,
    running: Arc<RunningJobs>,
    info: SchedulerInfo,
    started: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    consecutive_failures: AtomicU32,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<B: StoreBackend> SchedulerEngine<B> {
    /// Create a new scheduler engine around `store`, which it takes
    /// ownership of and attaches itself to.
    pub fn new(config: EngineConfig, store: JobStore<B>, registry: JobRegistry) -> Self {
        let store = Arc::new(store);
        let listeners = Arc::new(ListenerManager::new());
        let signal = Arc::new(SchedulingSignal::new(Arc::clone(&listeners)));
        store.initialize(Arc::clone(&signal) as Arc<dyn SchedulerSignaler>);

        let info = SchedulerInfo {
            name: config.scheduler_name.clone(),
            instance_id: store.instance_id().to_string(),
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            pool: WorkerPool::new(config.thread_count),
            config,
            store,
            registry,
            listeners,
            signal,
            running: Arc::new(RunningJobs::default()),
            info,
            started: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
            consecutive_failures: AtomicU32::new(0),
            background: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn store(&self) -> &Arc<JobStore<B>> {
        &self.store
    }

    pub fn listener_manager(&self) -> &Arc<ListenerManager> {
        &self.listeners
    }

    pub fn scheduler_info(&self) -> &SchedulerInfo {
        &self.info
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn validate_state(&self) -> Result<(), SchedulerError> {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }
        Ok(())
    }

    fn shell_env(&self) -> ShellEnv<B> {
        ShellEnv {
            store: Arc::clone(&self.store),
            listeners: Arc::clone(&self.listeners),
            running: Arc::clone(&self.running),
            info: self.info.clone(),
            shutting_down: Arc::clone(&self.shutting_down),
            completion_retry: completion_backoff(self.config.db_failure_retry_interval),
        }
    }

    // ------------------------------------------------------------------
    // scheduling facade
    // ------------------------------------------------------------------

    /// Store `job` with its first trigger. Returns the first fire time.
    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key()))]
    pub async fn schedule_job(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        self.validate_state()?;
        if trigger.job_key() != &job.key {
            return Err(SchedulerError::InvalidArgument(
                "Trigger does not reference given job".to_string(),
            ));
        }
        if !self.registry.contains(&job.job_type) {
            return Err(SchedulerError::JobNotRegistered(job.job_type));
        }

        self.store.store_job_and_trigger(&job, &trigger).await?;
        for listener in self.listeners.scheduler_listeners() {
            listener.job_added(&job.key).await;
            listener.job_scheduled(&trigger).await;
        }
        self.signal.signal(trigger.next_fire_time());

        info!(next_fire_time = ?trigger.next_fire_time(), "Job scheduled");
        Ok(trigger.next_fire_time())
    }

    /// Store a job with no trigger. Such jobs must be durable.
    #[instrument(skip(self, job), fields(job = %job.key))]
    pub async fn add_job(&self, job: JobDetail, replace: bool) -> Result<(), SchedulerError> {
        self.validate_state()?;
        if !job.durable {
            return Err(SchedulerError::InvalidArgument(
                "Jobs added with no trigger must be durable".to_string(),
            ));
        }
        if !self.registry.contains(&job.job_type) {
            return Err(SchedulerError::JobNotRegistered(job.job_type));
        }

        self.store.store_job(&job, replace).await?;
        for listener in self.listeners.scheduler_listeners() {
            listener.job_added(&job.key).await;
        }
        Ok(())
    }

    /// Add a trigger for an already stored job.
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key()))]
    pub async fn schedule_trigger(
        &self,
        trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        self.validate_state()?;
        self.store.store_trigger(&trigger, false).await?;
        for listener in self.listeners.scheduler_listeners() {
            listener.job_scheduled(&trigger).await;
        }
        self.signal.signal(trigger.next_fire_time());
        Ok(trigger.next_fire_time())
    }

    /// Remove a trigger; its job goes too if it is not durable and has no
    /// other triggers.
    #[instrument(skip(self))]
    pub async fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        self.validate_state()?;
        let removed = self.store.remove_trigger(key).await?;
        if removed {
            for listener in self.listeners.scheduler_listeners() {
                listener.job_unscheduled(key).await;
            }
            self.signal.signal(None);
        }
        Ok(removed)
    }

    /// Replace the trigger at `key`. Returns the new trigger's first fire
    /// time, or `None` when `key` did not exist.
    #[instrument(skip(self, new_trigger))]
    pub async fn reschedule_job(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        self.validate_state()?;
        if !self.store.replace_trigger(key, &new_trigger).await? {
            return Ok(None);
        }
        for listener in self.listeners.scheduler_listeners() {
            listener.job_unscheduled(key).await;
            listener.job_scheduled(&new_trigger).await;
        }
        self.signal.signal(new_trigger.next_fire_time());
        Ok(new_trigger.next_fire_time())
    }

    /// Remove a job and every trigger pointing at it.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        self.validate_state()?;
        let triggers = self.store.triggers_for_job(key).await?;
        let removed = self.store.remove_job(key).await?;
        if removed {
            for listener in self.listeners.scheduler_listeners() {
                for trigger in &triggers {
                    listener.job_unscheduled(trigger.key()).await;
                }
                listener.job_deleted(key).await;
            }
            self.signal.signal(None);
        }
        Ok(removed)
    }

    /// Fire a stored job once, now, through a one-shot trigger in the
    /// manual trigger group.
    #[instrument(skip(self, data))]
    pub async fn trigger_job(
        &self,
        key: &JobKey,
        data: Option<DataMap>,
    ) -> Result<TriggerKey, SchedulerError> {
        self.validate_state()?;
        let mut builder = Trigger::builder()
            .with_identity(Uuid::new_v4().to_string(), MANUAL_TRIGGER_GROUP)
            .for_job(key.clone())
            .start_at(self.store.clock().now());
        if let Some(data) = data {
            builder = builder.with_data_map(data);
        }
        let trigger = builder.build()?;

        self.store.store_trigger(&trigger, false).await?;
        self.signal.signal(trigger.next_fire_time());
        debug!(trigger = %trigger.key(), "Manual trigger stored");
        Ok(trigger.key().clone())
    }

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.validate_state()?;
        self.store.pause_trigger(key).await?;
        Ok(())
    }

    /// Pause every trigger matched; returns the groups touched.
    pub async fn pause_triggers(
        &self,
        matcher: &Matcher<TriggerKey>,
    ) -> Result<Vec<String>, SchedulerError> {
        self.validate_state()?;
        Ok(self.store.pause_triggers(matcher).await?)
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        self.validate_state()?;
        self.store.pause_job(key).await?;
        Ok(())
    }

    pub async fn pause_jobs(&self, matcher: &Matcher<JobKey>) -> Result<Vec<String>, SchedulerError> {
        self.validate_state()?;
        Ok(self.store.pause_jobs(matcher).await?)
    }

    pub async fn pause_all(&self) -> Result<(), SchedulerError> {
        self.validate_state()?;
        self.store.pause_all().await?;
        Ok(())
    }

    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.validate_state()?;
        self.store.resume_trigger(key).await?;
        Ok(())
    }

    pub async fn resume_triggers(
        &self,
        matcher: &Matcher<TriggerKey>,
    ) -> Result<Vec<String>, SchedulerError> {
        self.validate_state()?;
        Ok(self.store.resume_triggers(matcher).await?)
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        self.validate_state()?;
        self.store.resume_job(key).await?;
        Ok(())
    }

    pub async fn resume_jobs(&self, matcher: &Matcher<JobKey>) -> Result<Vec<String>, SchedulerError> {
        self.validate_state()?;
        Ok(self.store.resume_jobs(matcher).await?)
    }

    pub async fn resume_all(&self) -> Result<(), SchedulerError> {
        self.validate_state()?;
        self.store.resume_all().await?;
        Ok(())
    }

    /// Delete every job and trigger of this scheduler.
    pub async fn clear(&self) -> Result<(), SchedulerError> {
        self.validate_state()?;
        self.store.clear_all_scheduling_data().await?;
        self.signal.signal(None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    pub async fn job_keys(&self, matcher: &Matcher<JobKey>) -> Result<Vec<JobKey>, SchedulerError> {
        Ok(self.store.job_keys(matcher).await?)
    }

    pub async fn trigger_keys(
        &self,
        matcher: &Matcher<TriggerKey>,
    ) -> Result<Vec<TriggerKey>, SchedulerError> {
        Ok(self.store.trigger_keys(matcher).await?)
    }

    pub async fn job_group_names(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.store.job_group_names().await?)
    }

    pub async fn trigger_group_names(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.store.trigger_group_names().await?)
    }

    pub async fn paused_trigger_groups(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.store.paused_trigger_groups().await?)
    }

    pub async fn job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>, SchedulerError> {
        Ok(self.store.retrieve_job(key).await?)
    }

    pub async fn trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, SchedulerError> {
        Ok(self.store.retrieve_trigger(key).await?)
    }

    pub async fn trigger_state(
        &self,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>, SchedulerError> {
        Ok(self.store.trigger_state(key).await?)
    }

    pub async fn triggers_of_job(&self, key: &JobKey) -> Result<Vec<Trigger>, SchedulerError> {
        Ok(self.store.triggers_for_job(key).await?)
    }

    pub fn currently_executing_jobs(&self) -> Vec<ExecutingJob> {
        self.running
            .lock()
            .iter()
            .map(|(id, job)| ExecutingJob {
                fire_instance_id: id.clone(),
                job_key: job.job_key.clone(),
                trigger_key: job.trigger_key.clone(),
            })
            .collect()
    }

    /// Signal every running instance of `key` on this node to stop.
    /// Returns whether any instance was running.
    pub fn interrupt_job(&self, key: &JobKey) -> bool {
        let running = self.running.lock();
        let mut interrupted = false;
        for job in running.values().filter(|job| &job.job_key == key) {
            job.interrupt();
            interrupted = true;
        }
        if interrupted {
            info!(job = %key, "Job interrupted");
        }
        interrupted
    }

    /// Signal one specific firing to stop.
    pub fn interrupt(&self, fire_instance_id: &str) -> bool {
        match self.running.lock().get(fire_instance_id) {
            Some(job) => {
                job.interrupt();
                true
            }
            None => false,
        }
    }

    /// Wait up to `timeout` for jobs already dispatched to finish.
    pub async fn wait_for_running_jobs(&self, timeout: Duration) -> bool {
        self.pool.drain(timeout).await
    }

    // ------------------------------------------------------------------
    // firing loop
    // ------------------------------------------------------------------

    fn record_store_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Log a failed store call, tell listeners once the failure persists,
    /// then back off.
    async fn handle_store_failure(
        &self,
        operation: &str,
        err: StoreError,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        error!(operation, failures, retryable = err.is_retryable(), error = %err, "Job store call failed");

        if failures == self.config.store_failure_give_up_threshold {
            let message = format!(
                "Job store failed {} times in a row while {}",
                failures, operation
            );
            self.listeners
                .notify_scheduler_error(&message, &SchedulerError::Store(err))
                .await;
        }

        let delay = FixedDelay::new(self.config.db_failure_retry_interval)
            .next_delay(failures - 1)
            .unwrap_or(self.config.db_failure_retry_interval);
        self.sleep_unless_shutdown(delay, shutdown_rx).await;
    }

    /// Returns true if woken by shutdown.
    async fn sleep_unless_shutdown(
        &self,
        delay: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown_rx.recv() => true,
        }
    }

    /// Sleep until nothing else is due or a scheduling change arrives.
    async fn idle_wait(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_wait) => {}
            _ = self.signal.notify.notified() => debug!("Woken by scheduling change"),
            _ = shutdown_rx.recv() => {}
        }
    }

    async fn wait_for_fire_time(
        &self,
        fire_at: DateTime<Utc>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> FireWait {
        loop {
            let Ok(wait) = (fire_at - self.store.clock().now()).to_std() else {
                return FireWait::Due;
            };
            if wait.is_zero() {
                return FireWait::Due;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.signal.notify.notified() => {
                    if self.signal.take_if_earlier(fire_at) {
                        return FireWait::EarlierTrigger;
                    }
                }
                _ = shutdown_rx.recv() => return FireWait::Shutdown,
            }
        }
    }

    async fn release_all(&self, triggers: &[Trigger]) {
        for trigger in triggers {
            if let Err(e) = self.store.release_acquired_trigger(trigger).await {
                warn!(trigger = %trigger.key(), error = %e, "Failed to release acquired trigger");
            }
        }
    }

    /// Hand a fired bundle to the worker pool, or fail its job's triggers
    /// when no job implementation is registered for it.
    async fn dispatch(&self, bundle: FiredTriggerBundle) -> bool {
        let Some(job) = self.registry.instantiate(&bundle.job.job_type) else {
            error!(
                job = %bundle.job.key,
                job_type = %bundle.job.job_type,
                "No job registered for type, setting all its triggers to ERROR"
            );
            self.listeners
                .notify_scheduler_error(
                    &format!("An error occurred instantiating job '{}'", bundle.job.key),
                    &SchedulerError::JobNotRegistered(bundle.job.job_type.clone()),
                )
                .await;
            self.shell_env()
                .complete(
                    &bundle.trigger,
                    &bundle.job,
                    CompletedExecutionInstruction::SetAllJobTriggersError,
                )
                .await;
            return false;
        };

        let shell = JobRunShell::new(self.shell_env(), bundle, job);
        self.pool.spawn(shell.run()).await
    }

    fn spawn_background_tasks(&self) {
        let mut handles = Vec::new();
        handles.push(spawn_misfire_handler(
            Arc::clone(&self.store),
            self.config.db_failure_retry_interval,
            self.shutdown_tx.subscribe(),
        ));
        if self.store.is_clustered() {
            handles.push(spawn_cluster_manager(
                Arc::clone(&self.store),
                self.config.db_failure_retry_interval,
                self.shutdown_tx.subscribe(),
            ));
        }
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
    }
}

#[async_trait]
impl<B: StoreBackend> Scheduler for SchedulerEngine<B> {
    #[instrument(skip(self), fields(scheduler = %self.info.name, instance_id = %self.info.instance_id))]
    async fn start(&self) -> Result<(), SchedulerError> {
        self.validate_state()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::InvalidArgument(
                "Scheduler already started".to_string(),
            ));
        }

        info!(
            thread_count = self.pool.size(),
            clustered = self.store.is_clustered(),
            "Starting scheduler"
        );

        if let Err(e) = self.store.scheduler_started().await {
            error!(error = %e, "Failed to recover job store state");
            let err = SchedulerError::Store(e);
            self.listeners
                .notify_scheduler_error("Failure occurred during job recovery", &err)
                .await;
            return Err(err);
        }

        self.spawn_background_tasks();
        for listener in self.listeners.scheduler_listeners() {
            listener.scheduler_started().await;
        }
        info!("Scheduler started");

        while !self.is_shutdown() {
            match self.run_cycle().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Dispatched jobs"),
                Err(e) => error!(error = %e, "Firing cycle failed"),
            }
        }

        info!("Scheduler loop stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), SchedulerError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping scheduler");

        // No receivers just means nothing was waiting
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if !self.pool.shutdown(self.config.shutdown_timeout).await {
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Jobs still running at shutdown were abandoned; they will be recovered on restart"
            );
        }

        for listener in self.listeners.scheduler_listeners() {
            listener.scheduler_shutdown().await;
        }
        info!("Scheduler stopped");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn run_cycle(&self) -> Result<usize, SchedulerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_shutdown() {
            return Ok(0);
        }

        let available = tokio::select! {
            available = self.pool.wait_for_available() => available,
            _ = shutdown_rx.recv() => return Ok(0),
        };
        if available == 0 {
            return Ok(0);
        }

        self.signal.clear();
        let now = self.store.clock().now();
        let idle = chrono::Duration::from_std(self.config.idle_wait)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let max_count = available.min(self.config.batch_max_size.max(1));

        let triggers = match self
            .store
            .acquire_next_triggers(now + idle, max_count, self.config.batch_time_window)
            .await
        {
            Ok(triggers) => {
                self.record_store_success();
                triggers
            }
            Err(e) => {
                self.handle_store_failure("acquiring triggers", e, &mut shutdown_rx)
                    .await;
                return Ok(0);
            }
        };

        let Some(fire_at) = triggers.first().and_then(Trigger::next_fire_time) else {
            self.idle_wait(&mut shutdown_rx).await;
            return Ok(0);
        };

        match self.wait_for_fire_time(fire_at, &mut shutdown_rx).await {
            FireWait::Due => {}
            FireWait::EarlierTrigger => {
                debug!("Earlier trigger scheduled, releasing acquired batch");
                self.release_all(&triggers).await;
                return Ok(0);
            }
            FireWait::Shutdown => {
                self.release_all(&triggers).await;
                return Ok(0);
            }
        }

        let results = match self.store.triggers_fired(&triggers).await {
            Ok(results) => {
                self.record_store_success();
                results
            }
            Err(e) => {
                self.release_all(&triggers).await;
                self.handle_store_failure("firing triggers", e, &mut shutdown_rx)
                    .await;
                return Ok(0);
            }
        };

        let mut dispatched = 0;
        for (trigger, result) in triggers.iter().zip(results) {
            match result {
                TriggerFiredResult::Fired(bundle) => {
                    if self.dispatch(*bundle).await {
                        dispatched += 1;
                    }
                }
                TriggerFiredResult::Skipped => {
                    debug!(trigger = %trigger.key(), "Trigger changed since acquisition, skipped");
                }
                TriggerFiredResult::Failed(e) => {
                    error!(trigger = %trigger.key(), error = %e, "Trigger could not be fired");
                    self.listeners
                        .notify_scheduler_error(
                            &format!("Trigger '{}' could not be fired", trigger.key()),
                            &SchedulerError::Store(e),
                        )
                        .await;
                }
            }
        }

        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::JobExecutionContext;
    use crate::job::{Job, JobExecutionError};
    use crate::listeners::{JobListener, SchedulerListener, TriggerListener};
    use crate::store::{JobStoreConfig, MemoryBackend};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            idle_wait: Duration::from_millis(20),
            batch_max_size: 4,
            db_failure_retry_interval: Duration::from_millis(10),
            thread_count: 2,
            shutdown_timeout: Duration::from_secs(1),
            ..EngineConfig::default()
        }
    }

    fn engine(registry: JobRegistry) -> (SchedulerEngine<MemoryBackend>, ManualClock) {
        let clock = ManualClock::new(start());
        let store = JobStore::new(
            Arc::new(MemoryBackend::new()),
            JobStoreConfig::default(),
            Arc::new(clock.clone()),
        );
        (SchedulerEngine::new(test_config(), store, registry), clock)
    }

    struct CountingJob {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.set_result(serde_json::json!("done"));
            Ok(())
        }
    }

    struct FlakyJob {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for FlakyJob {
        async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if ctx.refire_count() == 0 {
                return Err(JobExecutionError::new("first attempt fails").with_refire_immediately(true));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CalendarAwareJob {
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Job for CalendarAwareJob {
        async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            self.seen.lock().unwrap().push(ctx.calendar().map(str::to_string));
            Ok(())
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            panic!("boom");
        }
    }

    struct WaitForInterruptJob {
        interrupted: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Job for WaitForInterruptJob {
        async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            if tokio::time::timeout(Duration::from_secs(5), ctx.interrupted()).await.is_ok() {
                self.interrupted.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingJobListener {
        vetoed: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobListener for RecordingJobListener {
        fn name(&self) -> &str {
            "recording"
        }

        async fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) {
            self.vetoed.fetch_add(1, Ordering::SeqCst);
        }

        async fn job_was_executed(
            &self,
            _ctx: &JobExecutionContext,
            error: Option<&JobExecutionError>,
        ) {
            if let Some(e) = error {
                self.errors.lock().unwrap().push(e.message().to_string());
            }
        }
    }

    struct VetoAll;

    #[async_trait]
    impl TriggerListener for VetoAll {
        fn name(&self) -> &str {
            "veto-all"
        }

        async fn veto_job_execution(&self, _trigger: &Trigger, _ctx: &JobExecutionContext) -> bool {
            true
        }
    }

    struct PanicOnFire;

    #[async_trait]
    impl TriggerListener for PanicOnFire {
        fn name(&self) -> &str {
            "panic-on-fire"
        }

        async fn trigger_fired(&self, _trigger: &Trigger, _ctx: &JobExecutionContext) {
            panic!("listener exploded");
        }
    }

    #[derive(Default)]
    struct LifecycleListener {
        scheduled: AtomicUsize,
        shutdown: AtomicUsize,
        errors: AtomicUsize,
    }

    #[async_trait]
    impl SchedulerListener for LifecycleListener {
        async fn job_scheduled(&self, _trigger: &Trigger) {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
        }

        async fn scheduler_error(&self, _message: &str, _error: &SchedulerError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        async fn scheduler_shutdown(&self) {
            self.shutdown.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_registry(runs: &Arc<AtomicUsize>) -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register_instance("count", Arc::new(CountingJob { runs: Arc::clone(runs) }));
        registry
    }

    fn job(name: &str, job_type: &str) -> JobDetail {
        JobDetail::builder(job_type).with_identity(name, "jobs").build()
    }

    fn due_now(name: &str, job: &JobDetail) -> Trigger {
        Trigger::builder()
            .with_identity(name, "triggers")
            .for_job(job.key.clone())
            .start_at(start())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_due_trigger_runs_and_one_shot_is_removed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let lifecycle = Arc::new(LifecycleListener::default());
        engine.listener_manager().add_scheduler_listener(lifecycle.clone());

        let j = job("j", "count");
        let t = due_now("t", &j);
        let first = engine.schedule_job(j.clone(), t.clone()).await.unwrap();
        assert_eq!(first, Some(start()));
        assert_eq!(lifecycle.scheduled.load(Ordering::SeqCst), 1);

        assert_eq!(engine.run_cycle().await.unwrap(), 1);
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(engine.trigger(t.key()).await.unwrap().is_none());
        assert!(engine.job_detail(&j.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nothing_due_returns_after_idle_wait() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let dispatched = tokio::time::timeout(Duration::from_secs(1), engine.run_cycle())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dispatched, 0);
    }

    #[tokio::test]
    async fn test_schedule_job_validates_arguments() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));

        let unknown = job("u", "missing");
        let result = engine.schedule_job(unknown.clone(), due_now("t", &unknown)).await;
        assert!(matches!(result, Err(SchedulerError::JobNotRegistered(t)) if t == "missing"));

        let j = job("j", "count");
        let other = job("other", "count");
        let result = engine.schedule_job(j, due_now("t", &other)).await;
        assert!(matches!(result, Err(SchedulerError::InvalidArgument(_))));

        let result = engine.add_job(job("nd", "count"), false).await;
        assert!(matches!(result, Err(SchedulerError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_unregistered_job_type_puts_triggers_in_error() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let lifecycle = Arc::new(LifecycleListener::default());
        engine.listener_manager().add_scheduler_listener(lifecycle.clone());

        // Bypass the facade check, as if the type was unregistered after storing
        let j = job("j", "retired");
        let t = due_now("t", &j);
        engine.store().store_job_and_trigger(&j, &t).await.unwrap();

        assert_eq!(engine.run_cycle().await.unwrap(), 0);
        assert_eq!(
            engine.trigger_state(t.key()).await.unwrap(),
            Some(TriggerState::Error)
        );
        assert_eq!(lifecycle.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_vetoed_execution_skips_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let recorder = Arc::new(RecordingJobListener::default());
        engine.listener_manager().add_job_listener(recorder.clone(), vec![]);
        engine
            .listener_manager()
            .add_trigger_listener(Arc::new(VetoAll), vec![]);

        let j = job("j", "count");
        engine.schedule_job(j.clone(), due_now("t", &j)).await.unwrap();
        assert_eq!(engine.run_cycle().await.unwrap(), 1);
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.vetoed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refire_requested_by_job_runs_again() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();
        registry.register_instance("flaky", Arc::new(FlakyJob { runs: Arc::clone(&runs) }));
        let (engine, _) = engine(registry);
        let recorder = Arc::new(RecordingJobListener::default());
        engine.listener_manager().add_job_listener(recorder.clone(), vec![]);

        let j = job("j", "flaky");
        let t = due_now("t", &j);
        engine.schedule_job(j, t.clone()).await.unwrap();
        engine.run_cycle().await.unwrap();
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*recorder.errors.lock().unwrap(), vec!["first attempt fails".to_string()]);
        assert!(engine.trigger(t.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let mut registry = JobRegistry::new();
        registry.register_instance("panics", Arc::new(PanickingJob));
        let (engine, _) = engine(registry);
        let recorder = Arc::new(RecordingJobListener::default());
        engine.listener_manager().add_job_listener(recorder.clone(), vec![]);

        let j = job("j", "panics");
        let t = due_now("t", &j);
        engine.schedule_job(j, t.clone()).await.unwrap();
        engine.run_cycle().await.unwrap();
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);

        let errors = recorder.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("boom"));
        assert!(engine.trigger(t.key()).await.unwrap().is_none());
        assert!(engine.currently_executing_jobs().is_empty());
    }

    #[test]
    fn test_fired_trigger_is_counted_once() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let runs = Arc::new(AtomicUsize::new(0));
                let (engine, _) = engine(counting_registry(&runs));
                let j = job("j", "count");
                engine.schedule_job(j.clone(), due_now("t", &j)).await.unwrap();
                assert_eq!(engine.run_cycle().await.unwrap(), 1);
                assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);
            })
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("triggers_fired_total{group=\"triggers\"} 1"),
            "unexpected metrics output: {}",
            rendered
        );
    }

    #[tokio::test]
    async fn test_job_sees_trigger_calendar() {
        let calendar_job = Arc::new(CalendarAwareJob::default());
        let mut registry = JobRegistry::new();
        registry.register_instance("calendar", calendar_job.clone());
        let (engine, _) = engine(registry);

        let j = job("j", "calendar");
        let t = Trigger::builder()
            .with_identity("t", "triggers")
            .for_job(j.key.clone())
            .modified_by_calendar("weekdays")
            .start_at(start())
            .build()
            .unwrap();
        engine.schedule_job(j, t).await.unwrap();
        assert_eq!(engine.run_cycle().await.unwrap(), 1);
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);

        assert_eq!(
            *calendar_job.seen.lock().unwrap(),
            vec![Some("weekdays".to_string())]
        );
    }

    #[tokio::test]
    async fn test_panicking_trigger_listener_errors_triggers_and_releases_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let lifecycle = Arc::new(LifecycleListener::default());
        engine.listener_manager().add_scheduler_listener(lifecycle.clone());
        engine
            .listener_manager()
            .add_trigger_listener(Arc::new(PanicOnFire), vec![]);

        let j = job("j", "count");
        let t = due_now("t", &j);
        engine.schedule_job(j, t.clone()).await.unwrap();
        assert_eq!(engine.run_cycle().await.unwrap(), 1);
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            engine.trigger_state(t.key()).await.unwrap(),
            Some(TriggerState::Error)
        );
        assert!(engine.currently_executing_jobs().is_empty());
        assert_eq!(lifecycle.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupt_running_job() {
        let interrupted = Arc::new(AtomicBool::new(false));
        let mut registry = JobRegistry::new();
        registry.register_instance(
            "waits",
            Arc::new(WaitForInterruptJob {
                interrupted: Arc::clone(&interrupted),
            }),
        );
        let (engine, _) = engine(registry);

        let j = job("j", "waits");
        engine.schedule_job(j.clone(), due_now("t", &j)).await.unwrap();
        assert_eq!(engine.run_cycle().await.unwrap(), 1);

        let mut seen = false;
        for _ in 0..100 {
            if !engine.currently_executing_jobs().is_empty() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(seen);
        assert!(engine.interrupt_job(&j.key));
        assert!(!engine.interrupt("no-such-firing"));

        assert!(engine.wait_for_running_jobs(Duration::from_secs(2)).await);
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_manual_trigger_fires_durable_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let j = JobDetail {
            durable: true,
            ..job("j", "count")
        };
        engine.add_job(j.clone(), false).await.unwrap();

        let key = engine.trigger_job(&j.key, None).await.unwrap();
        assert_eq!(key.group(), MANUAL_TRIGGER_GROUP);

        assert_eq!(engine.run_cycle().await.unwrap(), 1);
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(engine.job_detail(&j.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_paused_trigger_is_not_fired() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let j = job("j", "count");
        let t = due_now("t", &j);
        engine.schedule_job(j, t.clone()).await.unwrap();
        engine.pause_trigger(t.key()).await.unwrap();

        assert_eq!(engine.run_cycle().await.unwrap(), 0);
        assert_eq!(engine.trigger_state(t.key()).await.unwrap(), Some(TriggerState::Paused));

        engine.resume_trigger(t.key()).await.unwrap();
        assert_eq!(engine.run_cycle().await.unwrap(), 1);
        assert!(engine.wait_for_running_jobs(Duration::from_secs(1)).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_rejects_further_scheduling() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let lifecycle = Arc::new(LifecycleListener::default());
        engine.listener_manager().add_scheduler_listener(lifecycle.clone());

        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(lifecycle.shutdown.load(Ordering::SeqCst), 1);

        let j = job("j", "count");
        let result = engine.schedule_job(j.clone(), due_now("t", &j)).await;
        assert!(matches!(result, Err(SchedulerError::Shutdown)));
        assert_eq!(engine.run_cycle().await.unwrap(), 0);
        assert!(matches!(engine.start().await, Err(SchedulerError::Shutdown)));
    }

    #[tokio::test]
    async fn test_start_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (engine, _) = engine(counting_registry(&runs));
        let engine = Arc::new(engine);
        let j = job("j", "count");
        engine.schedule_job(j.clone(), due_now("t", &j)).await.unwrap();

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move { runner.start().await });

        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        engine.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_signal_keeps_earliest_candidate() {
        let signal = SchedulingSignal::new(Arc::new(ListenerManager::new()));
        let fire_at = start() + chrono::Duration::minutes(10);

        signal.signal(Some(start() + chrono::Duration::minutes(20)));
        assert!(!signal.take_if_earlier(fire_at));

        signal.signal(Some(start() + chrono::Duration::minutes(5)));
        assert!(signal.take_if_earlier(fire_at));
        assert!(!signal.take_if_earlier(fire_at));

        signal.signal(None);
        assert!(signal.take_if_earlier(fire_at));

        signal.signal(Some(start()));
        signal.clear();
        assert!(!signal.take_if_earlier(fire_at));
    }
}
