// Data models for jobs, triggers and the store's bookkeeping records

use crate::data_map::DataMap;
use crate::errors::{ScheduleError, SchedulerError};
use crate::keys::{JobKey, TriggerKey, DEFAULT_GROUP};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Data-map key holding the name of the trigger a recovered job originally fired from.
pub const FAILED_JOB_ORIGINAL_TRIGGER_NAME: &str = "FAILED_JOB_ORIGINAL_TRIGGER_NAME";
/// Data-map key holding the group of the trigger a recovered job originally fired from.
pub const FAILED_JOB_ORIGINAL_TRIGGER_GROUP: &str = "FAILED_JOB_ORIGINAL_TRIGGER_GROUP";
/// Data-map key holding the original actual fire time, epoch millis as a string.
pub const FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS: &str =
    "FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS";
/// Data-map key holding the original scheduled fire time, epoch millis as a string.
pub const FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS: &str =
    "FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS";

/// Default trigger priority
pub const DEFAULT_PRIORITY: i32 = 5;

fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

// ============================================================================
// Job Models
// ============================================================================

/// A stored job definition.
///
/// `job_type` names the implementation registered in the scheduler's
/// `JobRegistry`; the store itself treats it as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    pub description: Option<String>,
    pub job_type: String,
    pub data_map: DataMap,
    pub durable: bool,
    pub concurrent_execution_disallowed: bool,
    pub persist_job_data_after_execution: bool,
    pub requests_recovery: bool,
}

impl JobDetail {
    pub fn builder(job_type: impl Into<String>) -> JobBuilder {
        JobBuilder::new(job_type)
    }
}

/// Builder for [`JobDetail`]
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job: JobDetail,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job: JobDetail {
                key: JobKey::new(Uuid::new_v4().to_string(), DEFAULT_GROUP),
                description: None,
                job_type: job_type.into(),
                data_map: DataMap::new(),
                durable: false,
                concurrent_execution_disallowed: false,
                persist_job_data_after_execution: false,
                requests_recovery: false,
            },
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.job.key = JobKey::new(name, group);
        self
    }

    pub fn with_key(mut self, key: JobKey) -> Self {
        self.job.key = key;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.job.description = Some(description.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.job.durable = durable;
        self
    }

    pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
        self.job.concurrent_execution_disallowed = disallow;
        self
    }

    pub fn persist_job_data_after_execution(mut self, persist: bool) -> Self {
        self.job.persist_job_data_after_execution = persist;
        self
    }

    pub fn requests_recovery(mut self, requests: bool) -> Self {
        self.job.requests_recovery = requests;
        self
    }

    pub fn using_job_data(mut self, key: impl Into<String>, value: impl Into<crate::data_map::DataValue>) -> Self {
        self.job.data_map.put(key, value);
        self
    }

    pub fn data_map_mut(&mut self) -> &mut DataMap {
        &mut self.job.data_map
    }

    pub fn build(self) -> JobDetail {
        self.job
    }
}

// ============================================================================
// Trigger Models
// ============================================================================

/// Lifecycle state of a stored trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Complete,
    Error,
    Blocked,
    Paused,
    PausedBlocked,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Error => "ERROR",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::Paused => "PAUSED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
        }
    }

    /// True for `Paused` and `PausedBlocked`.
    pub fn is_paused(&self) -> bool {
        matches!(self, TriggerState::Paused | TriggerState::PausedBlocked)
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TriggerState::Waiting),
            "ACQUIRED" => Ok(TriggerState::Acquired),
            "EXECUTING" => Ok(TriggerState::Executing),
            "COMPLETE" => Ok(TriggerState::Complete),
            "ERROR" => Ok(TriggerState::Error),
            "BLOCKED" => Ok(TriggerState::Blocked),
            "PAUSED" => Ok(TriggerState::Paused),
            "PAUSED_BLOCKED" => Ok(TriggerState::PausedBlocked),
            other => Err(format!("Unknown trigger state: {}", other)),
        }
    }
}

impl TryFrom<String> for TriggerState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// What to do with a trigger whose fire time passed beyond the misfire threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Resolves to `FireNow`
    #[default]
    Smart,
    FireNow,
    SkipToNext,
    DoNothing,
}

impl MisfireInstruction {
    pub fn resolve(self) -> Self {
        match self {
            MisfireInstruction::Smart => MisfireInstruction::FireNow,
            other => other,
        }
    }

    /// Triggers with this instruction are never treated as misfired.
    pub fn ignores_misfires(&self) -> bool {
        matches!(self, MisfireInstruction::DoNothing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MisfireInstruction::Smart => "smart",
            MisfireInstruction::FireNow => "fire_now",
            MisfireInstruction::SkipToNext => "skip_to_next",
            MisfireInstruction::DoNothing => "do_nothing",
        }
    }
}

impl FromStr for MisfireInstruction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smart" => Ok(MisfireInstruction::Smart),
            "fire_now" => Ok(MisfireInstruction::FireNow),
            "skip_to_next" => Ok(MisfireInstruction::SkipToNext),
            "do_nothing" => Ok(MisfireInstruction::DoNothing),
            other => Err(format!("Unknown misfire instruction: {}", other)),
        }
    }
}

/// Instruction handed back to the store when a job finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

/// When a trigger fires. Time math lives in `crate::schedule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once, at the trigger's start time
    Once,
    /// Fire at start time and every `interval_ms` after it; `repeat_count`
    /// additional firings, or forever when absent
    Interval {
        interval_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat_count: Option<u32>,
    },
    Cron {
        expression: String,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        timezone: Tz,
    },
}

/// A firing rule bound to a job.
///
/// State and fire-time fields change only inside the store; callers read
/// them through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub(crate) key: TriggerKey,
    pub(crate) job_key: JobKey,
    pub(crate) description: Option<String>,
    pub(crate) data_map: DataMap,
    pub(crate) priority: i32,
    pub(crate) misfire_instruction: MisfireInstruction,
    pub(crate) state: TriggerState,
    pub(crate) schedule: Schedule,
    /// Calendar whose exclusions apply to this trigger's fire times
    #[serde(default)]
    pub(crate) calendar_name: Option<String>,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) next_fire_time: Option<DateTime<Utc>>,
    pub(crate) previous_fire_time: Option<DateTime<Utc>>,
    pub(crate) times_triggered: u32,
    pub(crate) fire_instance_id: Option<String>,
}

impl Trigger {
    pub fn builder() -> TriggerBuilder {
        TriggerBuilder::new()
    }

    pub fn key(&self) -> &TriggerKey {
        &self.key
    }

    pub fn job_key(&self) -> &JobKey {
        &self.job_key
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn data_map(&self) -> &DataMap {
        &self.data_map
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn misfire_instruction(&self) -> MisfireInstruction {
        self.misfire_instruction
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn calendar_name(&self) -> Option<&str> {
        self.calendar_name.as_deref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.previous_fire_time
    }

    pub fn times_triggered(&self) -> u32 {
        self.times_triggered
    }

    /// Id of the current acquisition, set while `Acquired`/`Executing`.
    pub fn fire_instance_id(&self) -> Option<&str> {
        self.fire_instance_id.as_deref()
    }

    /// Copy of this trigger re-targeted under a new key, for `replace_trigger`
    /// and rescheduling through the facade.
    pub fn with_key(mut self, key: TriggerKey) -> Self {
        self.key = key;
        self
    }
}

/// Builder for [`Trigger`]
#[derive(Debug, Clone)]
pub struct TriggerBuilder {
    key: Option<TriggerKey>,
    job_key: Option<JobKey>,
    description: Option<String>,
    data_map: DataMap,
    priority: i32,
    misfire_instruction: MisfireInstruction,
    schedule: Schedule,
    calendar_name: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl Default for TriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self {
            key: None,
            job_key: None,
            description: None,
            data_map: DataMap::new(),
            priority: DEFAULT_PRIORITY,
            misfire_instruction: MisfireInstruction::Smart,
            schedule: Schedule::Once,
            calendar_name: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.key = Some(TriggerKey::new(name, group));
        self
    }

    pub fn with_key(mut self, key: TriggerKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn for_job(mut self, job_key: JobKey) -> Self {
        self.job_key = Some(job_key);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn modified_by_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    pub fn start_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn end_at(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn using_job_data(mut self, key: impl Into<String>, value: impl Into<crate::data_map::DataValue>) -> Self {
        self.data_map.put(key, value);
        self
    }

    pub fn with_data_map(mut self, data_map: DataMap) -> Self {
        self.data_map = data_map;
        self
    }

    /// Build the trigger and compute its first fire time.
    ///
    /// # Errors
    /// `InvalidArgument` without a job key, or when the schedule would never
    /// fire; `Store(Schedule(..))` for a malformed cron expression.
    pub fn build(self) -> Result<Trigger, SchedulerError> {
        let job_key = self
            .job_key
            .ok_or_else(|| SchedulerError::InvalidArgument("Trigger must reference a job".to_string()))?;

        if let Schedule::Interval { interval_ms, .. } = &self.schedule {
            if *interval_ms <= 0 {
                return Err(SchedulerError::Store(
                    ScheduleError::InvalidConfiguration(format!(
                        "Repeat interval must be positive, got {}",
                        interval_ms
                    ))
                    .into(),
                ));
            }
        }

        let start_time = self.start_time.unwrap_or_else(Utc::now);
        if let Some(end) = self.end_time {
            if end < start_time {
                return Err(SchedulerError::InvalidArgument(
                    "End time cannot be before start time".to_string(),
                ));
            }
        }

        let mut trigger = Trigger {
            key: self
                .key
                .unwrap_or_else(|| TriggerKey::new(Uuid::new_v4().to_string(), DEFAULT_GROUP)),
            job_key,
            description: self.description,
            data_map: self.data_map,
            priority: self.priority,
            misfire_instruction: self.misfire_instruction,
            state: TriggerState::Waiting,
            schedule: self.schedule,
            calendar_name: self.calendar_name,
            start_time,
            end_time: self.end_time,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
            fire_instance_id: None,
        };

        let first = trigger
            .compute_first_fire_time()
            .map_err(|e| SchedulerError::Store(e.into()))?;
        match first {
            Some(_) => Ok(trigger),
            None => Err(SchedulerError::InvalidArgument(format!(
                "Trigger '{}' will never fire",
                trigger.key
            ))),
        }
    }
}

// ============================================================================
// Firing Records
// ============================================================================

/// Everything a job execution needs, produced when a trigger moves to
/// `Executing`.
#[derive(Debug, Clone)]
pub struct FiredTriggerBundle {
    pub trigger: Trigger,
    pub job: JobDetail,
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub prev_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub fire_instance_id: String,
    pub calendar_name: Option<String>,
}

/// Per-instance ownership record of an acquired or executing trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub entry_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub instance_id: String,
    pub fired_time: DateTime<Utc>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub state: TriggerState,
    pub nonconcurrent: bool,
    pub requests_recovery: bool,
}

/// Heartbeat row of one scheduler instance in a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

/// Per-trigger outcome of `triggers_fired`
#[derive(Debug)]
pub enum TriggerFiredResult {
    Fired(Box<FiredTriggerBundle>),
    /// Raced, paused, removed or blocked since acquisition
    Skipped,
    Failed(crate::errors::StoreError),
}
