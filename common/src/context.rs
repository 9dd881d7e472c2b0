// Per-firing execution context handed to a running job

use crate::data_map::DataMap;
use crate::errors::ContextError;
use crate::job::Job;
use crate::keys::TriggerKey;
use crate::models::{
    FiredTriggerBundle, JobDetail, Trigger, FAILED_JOB_ORIGINAL_TRIGGER_GROUP,
    FAILED_JOB_ORIGINAL_TRIGGER_NAME,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Identity of the scheduler running a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerInfo {
    pub name: String,
    pub instance_id: String,
}

/// Everything a job sees during one firing.
///
/// The merged data map is the job's map overlaid by the trigger's map. It is
/// a per-execution copy; only changes made through [`job_data_map_mut`]
/// can be persisted, and only for jobs that ask for it.
///
/// [`job_data_map_mut`]: JobExecutionContext::job_data_map_mut
pub struct JobExecutionContext {
    scheduler: SchedulerInfo,
    trigger: Trigger,
    job_detail: JobDetail,
    job: Arc<dyn Job>,
    merged_data_map: DataMap,
    fire_instance_id: String,
    recovering: bool,
    fire_time: DateTime<Utc>,
    scheduled_fire_time: Option<DateTime<Utc>>,
    prev_fire_time: Option<DateTime<Utc>>,
    next_fire_time: Option<DateTime<Utc>>,
    calendar: Option<String>,
    refire_count: u32,
    result: Option<Value>,
    job_run_time: Option<Duration>,
    data: HashMap<String, Value>,
    interrupt: watch::Receiver<bool>,
}

impl JobExecutionContext {
    /// Assemble a context from a fired bundle. Pure: no store access.
    pub fn new(scheduler: SchedulerInfo, bundle: FiredTriggerBundle, job: Arc<dyn Job>) -> Self {
        let mut merged_data_map = DataMap::new();
        merged_data_map.put_all(&bundle.job.data_map);
        merged_data_map.put_all(bundle.trigger.data_map());
        merged_data_map.clear_dirty();

        // Never interrupted unless the scheduler attaches a live signal
        let (_, interrupt) = watch::channel(false);

        Self {
            scheduler,
            trigger: bundle.trigger,
            job_detail: bundle.job,
            job,
            merged_data_map,
            fire_instance_id: bundle.fire_instance_id,
            recovering: bundle.recovering,
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            prev_fire_time: bundle.prev_fire_time,
            next_fire_time: bundle.next_fire_time,
            calendar: bundle.calendar_name,
            refire_count: 0,
            result: None,
            job_run_time: None,
            data: HashMap::new(),
            interrupt,
        }
    }

    /// Attach the interrupt signal the scheduler flips on `interrupt_job`.
    pub fn with_interrupt_signal(mut self, signal: watch::Receiver<bool>) -> Self {
        self.interrupt = signal;
        self
    }

    pub fn scheduler(&self) -> &SchedulerInfo {
        &self.scheduler
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn job_detail(&self) -> &JobDetail {
        &self.job_detail
    }

    pub fn job_instance(&self) -> &Arc<dyn Job> {
        &self.job
    }

    pub fn merged_job_data_map(&self) -> &DataMap {
        &self.merged_data_map
    }

    /// The job's own data map; persisted after the run when the job detail
    /// sets `persist_job_data_after_execution`.
    pub fn job_data_map_mut(&mut self) -> &mut DataMap {
        &mut self.job_detail.data_map
    }

    pub fn fire_instance_id(&self) -> &str {
        &self.fire_instance_id
    }

    /// Name of the calendar attached to the fired trigger, if any.
    pub fn calendar(&self) -> Option<&str> {
        self.calendar.as_deref()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Key of the trigger whose firing is being recovered.
    ///
    /// # Errors
    /// `ContextError::NotRecovering` unless this is a recovery run;
    /// `MissingRecoveryData` if the reserved keys are absent.
    pub fn recovering_trigger_key(&self) -> Result<TriggerKey, ContextError> {
        if !self.recovering {
            return Err(ContextError::NotRecovering);
        }
        let name = self
            .merged_data_map
            .get_as_string(FAILED_JOB_ORIGINAL_TRIGGER_NAME)
            .ok_or_else(|| {
                ContextError::MissingRecoveryData(FAILED_JOB_ORIGINAL_TRIGGER_NAME.to_string())
            })?;
        let group = self
            .merged_data_map
            .get_as_string(FAILED_JOB_ORIGINAL_TRIGGER_GROUP)
            .ok_or_else(|| {
                ContextError::MissingRecoveryData(FAILED_JOB_ORIGINAL_TRIGGER_GROUP.to_string())
            })?;
        Ok(TriggerKey::new(name, group))
    }

    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    pub fn scheduled_fire_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled_fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.prev_fire_time
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    pub fn refire_count(&self) -> u32 {
        self.refire_count
    }

    pub fn increment_refire_count(&mut self) {
        self.refire_count += 1;
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, result: Value) {
        self.result = Some(result);
    }

    /// `None` until the job has run.
    pub fn job_run_time(&self) -> Option<Duration> {
        self.job_run_time
    }

    pub fn set_job_run_time(&mut self, run_time: Duration) {
        self.job_run_time = Some(run_time);
    }

    /// Store a value for the duration of this execution only.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Resolves once the scheduler asks this execution to stop.
    pub async fn interrupted(&self) {
        let mut signal = self.interrupt.clone();
        loop {
            if *signal.borrow_and_update() {
                return;
            }
            if signal.changed().await.is_err() {
                // Sender gone: no interrupt can arrive any more
                std::future::pending::<()>().await;
            }
        }
    }

    /// Give the job detail back, e.g. to persist its data map.
    pub(crate) fn into_parts(self) -> (Trigger, JobDetail) {
        (self.trigger, self.job_detail)
    }
}

impl fmt::Display for JobExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobExecutionContext: trigger: '{}' job: '{}' fireTime: '{}' scheduledFireTime: '{:?}' \
             previousFireTime: '{:?}' nextFireTime: '{:?}' isRecovering: {} refireCount: {}",
            self.trigger.key(),
            self.job_detail.key,
            self.fire_time,
            self.scheduled_fire_time,
            self.prev_fire_time,
            self.next_fire_time,
            self.recovering,
            self.refire_count
        )
    }
}

impl fmt::Debug for JobExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobExecutionError;
    use crate::keys::{JobKey, RECOVERING_JOBS_GROUP};
    use crate::models::Schedule;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            Ok(())
        }
    }

    fn scheduler() -> SchedulerInfo {
        SchedulerInfo {
            name: "test".to_string(),
            instance_id: "node-1".to_string(),
        }
    }

    fn bundle(trigger: Trigger, job: JobDetail, recovering: bool) -> FiredTriggerBundle {
        let now = Utc::now();
        let trigger_calendar = trigger.calendar_name().map(str::to_string);
        FiredTriggerBundle {
            scheduled_fire_time: trigger.next_fire_time(),
            trigger,
            job,
            recovering,
            fire_time: now,
            prev_fire_time: None,
            next_fire_time: None,
            fire_instance_id: "fire-1".to_string(),
            calendar_name: trigger_calendar,
        }
    }

    #[test]
    fn test_trigger_data_overrides_job_data() {
        let job = JobDetail::builder("noop")
            .with_identity("j", "g")
            .using_job_data("a", 1)
            .build();
        let trigger = Trigger::builder()
            .for_job(job.key.clone())
            .using_job_data("a", 2)
            .using_job_data("b", 3)
            .build()
            .unwrap();
        let ctx = JobExecutionContext::new(scheduler(), bundle(trigger, job, false), Arc::new(Noop));

        let merged = ctx.merged_job_data_map();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get_int("a"), Some(2));
        assert_eq!(merged.get_int("b"), Some(3));
    }

    #[test]
    fn test_calendar_comes_from_fired_trigger() {
        let job = JobDetail::builder("noop").build();
        let plain = Trigger::builder().for_job(job.key.clone()).build().unwrap();
        let ctx = JobExecutionContext::new(scheduler(), bundle(plain, job.clone(), false), Arc::new(Noop));
        assert_eq!(ctx.calendar(), None);

        let trigger = Trigger::builder()
            .for_job(job.key.clone())
            .modified_by_calendar("bank-holidays")
            .build()
            .unwrap();
        let ctx = JobExecutionContext::new(scheduler(), bundle(trigger, job, false), Arc::new(Noop));
        assert_eq!(ctx.calendar(), Some("bank-holidays"));
    }

    #[test]
    fn test_recovering_trigger_key_requires_recovery() {
        let job = JobDetail::builder("noop").build();
        let trigger = Trigger::builder().for_job(job.key.clone()).build().unwrap();
        let ctx = JobExecutionContext::new(scheduler(), bundle(trigger, job, false), Arc::new(Noop));
        assert_eq!(ctx.recovering_trigger_key(), Err(ContextError::NotRecovering));
    }

    #[test]
    fn test_recovering_trigger_key_reads_reserved_fields() {
        let job = JobDetail::builder("noop").build();
        let trigger = Trigger::builder()
            .with_identity("recover_node-1_1", RECOVERING_JOBS_GROUP)
            .for_job(job.key.clone())
            .with_schedule(Schedule::Once)
            .using_job_data(FAILED_JOB_ORIGINAL_TRIGGER_NAME, "nightly")
            .using_job_data(FAILED_JOB_ORIGINAL_TRIGGER_GROUP, "reports")
            .build()
            .unwrap();
        let ctx = JobExecutionContext::new(scheduler(), bundle(trigger, job, true), Arc::new(Noop));
        assert_eq!(
            ctx.recovering_trigger_key(),
            Ok(TriggerKey::new("nightly", "reports"))
        );
    }

    #[test]
    fn test_refire_count_result_and_side_channel() {
        let job = JobDetail::builder("noop").build();
        let trigger = Trigger::builder()
            .for_job(JobKey::new("x", "y"))
            .build()
            .unwrap();
        let mut ctx =
            JobExecutionContext::new(scheduler(), bundle(trigger, job, false), Arc::new(Noop));

        assert_eq!(ctx.refire_count(), 0);
        ctx.increment_refire_count();
        assert_eq!(ctx.refire_count(), 1);

        assert!(ctx.job_run_time().is_none());
        ctx.set_job_run_time(Duration::from_millis(40));
        assert_eq!(ctx.job_run_time(), Some(Duration::from_millis(40)));

        ctx.set_result(serde_json::json!({"rows": 12}));
        assert_eq!(ctx.result().unwrap()["rows"], 12);

        assert!(ctx.put("k", serde_json::json!("v")).is_none());
        assert_eq!(ctx.get("k"), Some(&serde_json::json!("v")));
        assert!(ctx.merged_job_data_map().get("k").is_none());
    }

    #[tokio::test]
    async fn test_interrupt_signal() {
        let job = JobDetail::builder("noop").build();
        let trigger = Trigger::builder().for_job(job.key.clone()).build().unwrap();
        let (tx, rx) = watch::channel(false);
        let ctx = JobExecutionContext::new(scheduler(), bundle(trigger, job, false), Arc::new(Noop))
            .with_interrupt_signal(rx);

        assert!(!ctx.is_interrupted());
        tx.send(true).unwrap();
        ctx.interrupted().await;
        assert!(ctx.is_interrupted());
    }
}
