// Schedule parsing and fire-time calculation
//
// Computes first fire times, fire times after a given instant and end-time
// clamping for the three schedule kinds, and applies a trigger's misfire and
// completion policies on top of them.

use crate::errors::ScheduleError;
use crate::job::JobExecutionError;
use crate::models::{CompletedExecutionInstruction, MisfireInstruction, Schedule, Trigger};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Parse and validate a cron expression (seconds precision)
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Validate a schedule without computing anything.
pub fn validate_schedule(schedule: &Schedule) -> Result<(), ScheduleError> {
    match schedule {
        Schedule::Once => Ok(()),
        Schedule::Interval { interval_ms, .. } if *interval_ms <= 0 => Err(
            ScheduleError::InvalidConfiguration(format!(
                "Repeat interval must be positive, got {}",
                interval_ms
            )),
        ),
        Schedule::Interval { .. } => Ok(()),
        Schedule::Cron { expression, .. } => parse_cron_expression(expression).map(|_| ()),
    }
}

/// First fire time strictly after `after`, before end-time clamping.
fn schedule_fire_time_after(
    schedule: &Schedule,
    start: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match schedule {
        Schedule::Once => Ok((after < start).then_some(start)),

        Schedule::Interval {
            interval_ms,
            repeat_count,
        } => {
            if after < start {
                return Ok(Some(start));
            }
            let elapsed = (after - start).num_milliseconds();
            let index = elapsed / interval_ms + 1;
            if let Some(repeat) = repeat_count {
                if index > i64::from(*repeat) {
                    return Ok(None);
                }
            }
            Ok(Some(start + Duration::milliseconds(index * interval_ms)))
        }

        Schedule::Cron {
            expression,
            timezone,
        } => cron_fire_time_after(expression, *timezone, after),
    }
}

fn cron_fire_time_after(
    expression: &str,
    timezone: Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_expression(expression)?;

    // Evaluate in the trigger's timezone so DST shifts land on wall-clock time
    let after_in_tz = after.with_timezone(&timezone);
    let next = schedule
        .after(&after_in_tz)
        .next()
        .map(|dt| dt.with_timezone(&Utc));

    Ok(next)
}

fn clamp_to_end(
    time: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (time, end) {
        (Some(t), Some(end)) if t > end => None,
        (t, _) => t,
    }
}

impl Trigger {
    /// Next fire time strictly after `after`, honouring start and end time.
    pub fn fire_time_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let after = if after < self.start_time {
            // Anything before the start resolves to the first firing at or after start
            self.start_time - Duration::milliseconds(1)
        } else {
            after
        };
        let next = schedule_fire_time_after(&self.schedule, self.start_time, after)?;
        Ok(clamp_to_end(next, self.end_time))
    }

    /// Compute and store the first fire time. `None` means the trigger can
    /// never fire.
    pub fn compute_first_fire_time(&mut self) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        validate_schedule(&self.schedule)?;
        let first = self.fire_time_after(self.start_time - Duration::milliseconds(1))?;
        self.next_fire_time = first;
        Ok(first)
    }

    /// Whether the trigger's next fire time lies further in the past than
    /// the misfire threshold.
    pub fn is_misfired(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.misfire_instruction.ignores_misfires() {
            return false;
        }
        match self.next_fire_time {
            Some(next) => next < now - threshold,
            None => false,
        }
    }

    /// Record a firing: lineage moves forward and the next fire time advances.
    ///
    /// Unless the trigger ignores misfires, the new next fire time is pushed
    /// past `now` so missed firings are not replayed.
    pub(crate) fn triggered(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.times_triggered = self.times_triggered.saturating_add(1);
        self.previous_fire_time = self.next_fire_time;

        let base = match self.previous_fire_time {
            Some(prev) if self.misfire_instruction.ignores_misfires() => prev,
            Some(prev) => prev.max(now),
            None => now,
        };
        self.next_fire_time = self.fire_time_after(base)?;
        Ok(())
    }

    /// Apply the misfire instruction to a misfired trigger.
    ///
    /// `FireNow` leaves the missed fire time in place so the trigger is
    /// acquired immediately and its lineage keeps the scheduled time.
    pub(crate) fn update_after_misfire(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        if self.misfire_instruction.resolve() == MisfireInstruction::SkipToNext {
            self.next_fire_time = self.fire_time_after(now)?;
        }
        Ok(())
    }

    /// Map a job's outcome to the instruction the store applies on completion.
    pub fn execution_complete(
        &self,
        error: Option<&JobExecutionError>,
    ) -> CompletedExecutionInstruction {
        if let Some(err) = error {
            if err.refire_immediately() {
                return CompletedExecutionInstruction::ReExecuteJob;
            }
            if err.unschedule_firing_trigger() {
                return CompletedExecutionInstruction::SetTriggerComplete;
            }
            if err.unschedule_all_triggers() {
                return CompletedExecutionInstruction::SetAllJobTriggersComplete;
            }
        }

        if self.next_fire_time.is_none() {
            CompletedExecutionInstruction::DeleteTrigger
        } else {
            CompletedExecutionInstruction::Noop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::JobKey;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn trigger(schedule: Schedule, start: DateTime<Utc>) -> Trigger {
        Trigger::builder()
            .with_identity("t", "g")
            .for_job(JobKey::new("j", "g"))
            .with_schedule(schedule)
            .start_at(start)
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_valid_cron_expression() {
        assert!(parse_cron_expression("0 0 12 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        assert!(parse_cron_expression("invalid").is_err());
    }

    #[test]
    fn test_once_fires_at_start_only() {
        let mut t = trigger(Schedule::Once, at(10, 0, 0));
        assert_eq!(t.next_fire_time(), Some(at(10, 0, 0)));
        t.triggered(at(10, 0, 0)).unwrap();
        assert_eq!(t.previous_fire_time(), Some(at(10, 0, 0)));
        assert_eq!(t.next_fire_time(), None);
    }

    #[test]
    fn test_interval_respects_repeat_count() {
        let schedule = Schedule::Interval {
            interval_ms: 60_000,
            repeat_count: Some(1),
        };
        let mut t = trigger(schedule, at(10, 0, 0));
        t.triggered(at(10, 0, 0)).unwrap();
        assert_eq!(t.next_fire_time(), Some(at(10, 1, 0)));
        t.triggered(at(10, 1, 0)).unwrap();
        assert_eq!(t.next_fire_time(), None);
        assert_eq!(t.times_triggered(), 2);
    }

    #[test]
    fn test_interval_clamped_by_end_time() {
        let mut t = Trigger::builder()
            .for_job(JobKey::new("j", "g"))
            .with_schedule(Schedule::Interval {
                interval_ms: 60_000,
                repeat_count: None,
            })
            .start_at(at(10, 0, 0))
            .end_at(at(10, 1, 30))
            .build()
            .unwrap();
        t.triggered(at(10, 0, 0)).unwrap();
        t.triggered(at(10, 1, 0)).unwrap();
        assert_eq!(t.next_fire_time(), None);
    }

    #[test]
    fn test_triggered_skips_past_now_unless_do_nothing() {
        let schedule = Schedule::Interval {
            interval_ms: 60_000,
            repeat_count: None,
        };
        let mut skipping = trigger(schedule.clone(), at(10, 0, 0));
        skipping.triggered(at(10, 5, 30)).unwrap();
        assert_eq!(skipping.next_fire_time(), Some(at(10, 6, 0)));

        let mut catching_up = Trigger::builder()
            .for_job(JobKey::new("j", "g"))
            .with_schedule(schedule)
            .with_misfire_instruction(MisfireInstruction::DoNothing)
            .start_at(at(10, 0, 0))
            .build()
            .unwrap();
        catching_up.triggered(at(10, 5, 30)).unwrap();
        assert_eq!(catching_up.next_fire_time(), Some(at(10, 1, 0)));
    }

    #[test]
    fn test_cron_first_fire_time_in_timezone() {
        let t = trigger(
            Schedule::Cron {
                expression: "0 0 12 * * * *".to_string(),
                timezone: chrono_tz::UTC,
            },
            at(10, 0, 0),
        );
        assert_eq!(t.next_fire_time(), Some(at(12, 0, 0)));
    }

    #[test]
    fn test_misfire_detection_and_skip_to_next() {
        let mut t = Trigger::builder()
            .for_job(JobKey::new("j", "g"))
            .with_schedule(Schedule::Interval {
                interval_ms: 60_000,
                repeat_count: None,
            })
            .with_misfire_instruction(MisfireInstruction::SkipToNext)
            .start_at(at(10, 0, 0))
            .build()
            .unwrap();
        let now = at(10, 10, 30);
        assert!(t.is_misfired(now, Duration::seconds(60)));
        t.update_after_misfire(now).unwrap();
        assert_eq!(t.next_fire_time(), Some(at(10, 11, 0)));
        assert!(!t.is_misfired(now, Duration::seconds(60)));
    }

    #[test]
    fn test_fire_now_keeps_missed_time() {
        let mut t = trigger(Schedule::Once, at(10, 0, 0));
        t.update_after_misfire(at(11, 0, 0)).unwrap();
        assert_eq!(t.next_fire_time(), Some(at(10, 0, 0)));
    }

    #[test]
    fn test_execution_complete_mapping() {
        let mut t = trigger(Schedule::Once, at(10, 0, 0));
        assert_eq!(t.execution_complete(None), CompletedExecutionInstruction::Noop);

        let refire = JobExecutionError::new("retry").with_refire_immediately(true);
        assert_eq!(
            t.execution_complete(Some(&refire)),
            CompletedExecutionInstruction::ReExecuteJob
        );

        let unschedule = JobExecutionError::new("stop").with_unschedule_all_triggers(true);
        assert_eq!(
            t.execution_complete(Some(&unschedule)),
            CompletedExecutionInstruction::SetAllJobTriggersComplete
        );

        t.triggered(at(10, 0, 0)).unwrap();
        assert_eq!(
            t.execution_complete(None),
            CompletedExecutionInstruction::DeleteTrigger
        );
    }
}
