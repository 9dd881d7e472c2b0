// PostgreSQL store backend
//
// Runtime-checked sqlx queries against the sched_* tables. Every row is
// scoped by sched_name. Lock statements run inside a savepoint so a failed
// UPDATE or INSERT does not abort the surrounding transaction.

use super::backend::{StoreBackend, StoreTransaction};
use crate::data_map::DataMap;
use crate::db::DbPool;
use crate::errors::{DatabaseError, StoreError};
use crate::keys::{JobKey, TriggerKey};
use crate::lock::LockRowAccess;
use crate::models::{
    FiredTriggerRecord, JobDetail, MisfireInstruction, Schedule, SchedulerStateRecord, Trigger,
    TriggerState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgRow, Postgres};
use sqlx::{Row, Transaction};
use tracing::{info, instrument};

const JOB_COLUMNS: &str = r#"job_name, job_group, description, job_type, is_durable,
    is_nonconcurrent, is_update_data, requests_recovery, job_data"#;

const TRIGGER_COLUMNS: &str = r#"trigger_name, trigger_group, job_name, job_group, description,
    next_fire_time, prev_fire_time, priority, trigger_state, misfire_instr, schedule,
    calendar_name, start_time, end_time, times_triggered, fire_instance_id, job_data"#;

const FIRED_COLUMNS: &str = r#"entry_id, trigger_name, trigger_group, instance_name,
    fired_time, sched_time, priority, state, job_name, job_group, is_nonconcurrent,
    requests_recovery"#;

// Byte-wise key order, matching `TriggerKey`'s `Ord`
const ACQUISITION_ORDER: &str = r#"next_fire_time ASC, priority DESC,
    trigger_group COLLATE "C" ASC, trigger_name COLLATE "C" ASC"#;

/// Job store backend on a shared PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: DbPool,
    sched_name: String,
}

impl PostgresBackend {
    pub fn new(pool: DbPool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("../migrations")
            .run(self.pool.pool())
            .await
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        info!("Scheduler schema migrations applied");
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for PostgresBackend {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.pool.pool().begin().await?;
        Ok(PgTransaction {
            tx,
            sched_name: self.sched_name.clone(),
        })
    }
}

/// One open PostgreSQL transaction
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    sched_name: String,
}

fn state_strings(states: &[TriggerState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

fn decode_data_map(value: serde_json::Value) -> Result<DataMap, StoreError> {
    let mut map: DataMap = serde_json::from_value(value)?;
    map.clear_dirty();
    Ok(map)
}

fn decode_state(raw: String) -> Result<TriggerState, StoreError> {
    TriggerState::try_from(raw).map_err(StoreError::Serialization)
}

fn job_from_row(row: &PgRow) -> Result<JobDetail, StoreError> {
    Ok(JobDetail {
        key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        description: row.try_get("description")?,
        job_type: row.try_get("job_type")?,
        data_map: decode_data_map(row.try_get("job_data")?)?,
        durable: row.try_get("is_durable")?,
        concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
        persist_job_data_after_execution: row.try_get("is_update_data")?,
        requests_recovery: row.try_get("requests_recovery")?,
    })
}

fn trigger_from_row(row: &PgRow) -> Result<Trigger, StoreError> {
    let schedule: Schedule = serde_json::from_value(row.try_get("schedule")?)?;
    let misfire: String = row.try_get("misfire_instr")?;
    let misfire_instruction = misfire
        .parse::<MisfireInstruction>()
        .map_err(StoreError::Serialization)?;
    let times_triggered: i32 = row.try_get("times_triggered")?;

    Ok(Trigger {
        key: TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ),
        job_key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        description: row.try_get("description")?,
        data_map: decode_data_map(row.try_get("job_data")?)?,
        priority: row.try_get("priority")?,
        misfire_instruction,
        state: decode_state(row.try_get("trigger_state")?)?,
        schedule,
        calendar_name: row.try_get("calendar_name")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        next_fire_time: row.try_get("next_fire_time")?,
        previous_fire_time: row.try_get("prev_fire_time")?,
        times_triggered: u32::try_from(times_triggered).unwrap_or(0),
        fire_instance_id: row.try_get("fire_instance_id")?,
    })
}

fn fired_from_row(row: &PgRow) -> Result<FiredTriggerRecord, StoreError> {
    Ok(FiredTriggerRecord {
        entry_id: row.try_get("entry_id")?,
        trigger_key: TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ),
        job_key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        instance_id: row.try_get("instance_name")?,
        fired_time: row.try_get("fired_time")?,
        scheduled_time: row.try_get("sched_time")?,
        priority: row.try_get("priority")?,
        state: decode_state(row.try_get("state")?)?,
        nonconcurrent: row.try_get("is_nonconcurrent")?,
        requests_recovery: row.try_get("requests_recovery")?,
    })
}

impl PgTransaction {
    /// Run one lock statement inside a savepoint, rolling back to it on error.
    async fn with_savepoint(
        &mut self,
        sql: &str,
        sched_name: &str,
        lock_name: &str,
    ) -> Result<u64, DatabaseError> {
        sqlx::query("SAVEPOINT sched_lock")
            .execute(&mut *self.tx)
            .await?;

        let result = sqlx::query(sql)
            .bind(sched_name)
            .bind(lock_name)
            .execute(&mut *self.tx)
            .await;

        match result {
            Ok(done) => {
                sqlx::query("RELEASE SAVEPOINT sched_lock")
                    .execute(&mut *self.tx)
                    .await?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                sqlx::query("ROLLBACK TO SAVEPOINT sched_lock")
                    .execute(&mut *self.tx)
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn select_triggers_where(
        &mut self,
        condition: &str,
        order_and_limit: &str,
        bind_time: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Trigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sched_triggers WHERE sched_name = $1 AND {} {}",
            TRIGGER_COLUMNS, condition, order_and_limit
        );
        let mut query = sqlx::query(&sql).bind(&self.sched_name);
        if let Some(time) = bind_time {
            query = query.bind(time);
        }
        if let Some(limit) = limit {
            query = query.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let rows = query.fetch_all(&mut *self.tx).await?;
        rows.iter().map(trigger_from_row).collect()
    }
}

#[async_trait]
impl LockRowAccess for PgTransaction {
    async fn update_lock_row(
        &mut self,
        sched_name: &str,
        lock_name: &str,
    ) -> Result<u64, DatabaseError> {
        self.with_savepoint(
            "UPDATE sched_locks SET lock_name = lock_name WHERE sched_name = $1 AND lock_name = $2",
            sched_name,
            lock_name,
        )
        .await
    }

    async fn insert_lock_row(
        &mut self,
        sched_name: &str,
        lock_name: &str,
    ) -> Result<(), DatabaseError> {
        self.with_savepoint(
            "INSERT INTO sched_locks (sched_name, lock_name) VALUES ($1, $2)",
            sched_name,
            lock_name,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn select_job(&mut self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sched_job_details WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(key.name())
            .bind(key.group())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn upsert_job(&mut self, job: &JobDetail) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sched_job_details (
                sched_name, job_name, job_group, description, job_type, is_durable,
                is_nonconcurrent, is_update_data, requests_recovery, job_data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (sched_name, job_name, job_group) DO UPDATE
            SET description = EXCLUDED.description,
                job_type = EXCLUDED.job_type,
                is_durable = EXCLUDED.is_durable,
                is_nonconcurrent = EXCLUDED.is_nonconcurrent,
                is_update_data = EXCLUDED.is_update_data,
                requests_recovery = EXCLUDED.requests_recovery,
                job_data = EXCLUDED.job_data
            "#,
        )
        .bind(&self.sched_name)
        .bind(job.key.name())
        .bind(job.key.group())
        .bind(&job.description)
        .bind(&job.job_type)
        .bind(job.durable)
        .bind(job.concurrent_execution_disallowed)
        .bind(job.persist_job_data_after_execution)
        .bind(job.requests_recovery)
        .bind(serde_json::to_value(&job.data_map)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_job_data(&mut self, key: &JobKey, data: &DataMap) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sched_job_details SET job_data = $4 \
             WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .bind(serde_json::to_value(data)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_job(&mut self, key: &JobKey) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "DELETE FROM sched_job_details WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn select_job_keys(&mut self) -> Result<Vec<JobKey>, StoreError> {
        let rows = sqlx::query("SELECT job_name, job_group FROM sched_job_details WHERE sched_name = $1")
            .bind(&self.sched_name)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(JobKey::new(
                    row.try_get::<String, _>("job_name")?,
                    row.try_get::<String, _>("job_group")?,
                ))
            })
            .collect()
    }

    async fn select_trigger(&mut self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sched_triggers \
             WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
            TRIGGER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(key.name())
            .bind(key.group())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(trigger_from_row).transpose()
    }

    async fn upsert_trigger(&mut self, trigger: &Trigger) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sched_triggers (
                sched_name, trigger_name, trigger_group, job_name, job_group, description,
                next_fire_time, prev_fire_time, priority, trigger_state, misfire_instr,
                schedule, calendar_name, start_time, end_time, times_triggered, fire_instance_id,
                job_data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (sched_name, trigger_name, trigger_group) DO UPDATE
            SET job_name = EXCLUDED.job_name,
                job_group = EXCLUDED.job_group,
                description = EXCLUDED.description,
                next_fire_time = EXCLUDED.next_fire_time,
                prev_fire_time = EXCLUDED.prev_fire_time,
                priority = EXCLUDED.priority,
                trigger_state = EXCLUDED.trigger_state,
                misfire_instr = EXCLUDED.misfire_instr,
                schedule = EXCLUDED.schedule,
                calendar_name = EXCLUDED.calendar_name,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                times_triggered = EXCLUDED.times_triggered,
                fire_instance_id = EXCLUDED.fire_instance_id,
                job_data = EXCLUDED.job_data
            "#,
        )
        .bind(&self.sched_name)
        .bind(trigger.key.name())
        .bind(trigger.key.group())
        .bind(trigger.job_key.name())
        .bind(trigger.job_key.group())
        .bind(&trigger.description)
        .bind(trigger.next_fire_time)
        .bind(trigger.previous_fire_time)
        .bind(trigger.priority)
        .bind(trigger.state.as_str())
        .bind(trigger.misfire_instruction.as_str())
        .bind(serde_json::to_value(&trigger.schedule)?)
        .bind(&trigger.calendar_name)
        .bind(trigger.start_time)
        .bind(trigger.end_time)
        .bind(i32::try_from(trigger.times_triggered).unwrap_or(i32::MAX))
        .bind(&trigger.fire_instance_id)
        .bind(serde_json::to_value(&trigger.data_map)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "DELETE FROM sched_triggers WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn select_trigger_keys(&mut self) -> Result<Vec<TriggerKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT trigger_name, trigger_group FROM sched_triggers WHERE sched_name = $1",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(TriggerKey::new(
                    row.try_get::<String, _>("trigger_name")?,
                    row.try_get::<String, _>("trigger_group")?,
                ))
            })
            .collect()
    }

    async fn select_triggers_for_job(&mut self, job: &JobKey) -> Result<Vec<Trigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sched_triggers WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
            TRIGGER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(job.name())
            .bind(job.group())
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(trigger_from_row).collect()
    }

    async fn select_trigger_keys_in_state(
        &mut self,
        state: TriggerState,
    ) -> Result<Vec<TriggerKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT trigger_name, trigger_group FROM sched_triggers \
             WHERE sched_name = $1 AND trigger_state = $2",
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(TriggerKey::new(
                    row.try_get::<String, _>("trigger_name")?,
                    row.try_get::<String, _>("trigger_group")?,
                ))
            })
            .collect()
    }

    async fn update_trigger_state_from(
        &mut self,
        key: &TriggerKey,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "UPDATE sched_triggers SET trigger_state = $4 \
             WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3 \
             AND (cardinality($5::text[]) = 0 OR trigger_state = ANY($5))",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .bind(new_state.as_str())
        .bind(state_strings(from))
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected())
    }

    async fn update_job_trigger_states_from(
        &mut self,
        job: &JobKey,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "UPDATE sched_triggers SET trigger_state = $4 \
             WHERE sched_name = $1 AND job_name = $2 AND job_group = $3 \
             AND (cardinality($5::text[]) = 0 OR trigger_state = ANY($5))",
        )
        .bind(&self.sched_name)
        .bind(job.name())
        .bind(job.group())
        .bind(new_state.as_str())
        .bind(state_strings(from))
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected())
    }

    async fn update_all_trigger_states_from(
        &mut self,
        new_state: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "UPDATE sched_triggers SET trigger_state = $2 \
             WHERE sched_name = $1 \
             AND (cardinality($3::text[]) = 0 OR trigger_state = ANY($3))",
        )
        .bind(&self.sched_name)
        .bind(new_state.as_str())
        .bind(state_strings(from))
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected())
    }

    async fn select_due_triggers(
        &mut self,
        no_later_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError> {
        self.select_triggers_where(
            "trigger_state = 'WAITING' AND next_fire_time <= $2",
            &format!("ORDER BY {} LIMIT $3", ACQUISITION_ORDER),
            Some(no_later_than),
            Some(limit),
        )
        .await
    }

    async fn select_misfired_triggers(
        &mut self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError> {
        self.select_triggers_where(
            "trigger_state = 'WAITING' AND misfire_instr = 'skip_to_next' AND next_fire_time < $2",
            &format!("ORDER BY {} LIMIT $3", ACQUISITION_ORDER),
            Some(before),
            Some(limit),
        )
        .await
    }

    async fn insert_paused_group(&mut self, group: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sched_paused_trigger_grps (sched_name, trigger_group) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_paused_group(&mut self, group: &str) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "DELETE FROM sched_paused_trigger_grps WHERE sched_name = $1 AND trigger_group = $2",
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn select_paused_groups(&mut self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT trigger_group FROM sched_paused_trigger_grps WHERE sched_name = $1 \
             ORDER BY trigger_group",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| row.try_get("trigger_group").map_err(StoreError::from))
            .collect()
    }

    async fn upsert_fired(&mut self, record: &FiredTriggerRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sched_fired_triggers (
                sched_name, entry_id, trigger_name, trigger_group, instance_name,
                fired_time, sched_time, priority, state, job_name, job_group,
                is_nonconcurrent, requests_recovery
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (sched_name, entry_id) DO UPDATE
            SET instance_name = EXCLUDED.instance_name,
                fired_time = EXCLUDED.fired_time,
                sched_time = EXCLUDED.sched_time,
                priority = EXCLUDED.priority,
                state = EXCLUDED.state,
                is_nonconcurrent = EXCLUDED.is_nonconcurrent,
                requests_recovery = EXCLUDED.requests_recovery
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.entry_id)
        .bind(record.trigger_key.name())
        .bind(record.trigger_key.group())
        .bind(&record.instance_id)
        .bind(record.fired_time)
        .bind(record.scheduled_time)
        .bind(record.priority)
        .bind(record.state.as_str())
        .bind(record.job_key.name())
        .bind(record.job_key.group())
        .bind(record.nonconcurrent)
        .bind(record.requests_recovery)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_fired(&mut self, entry_id: &str) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "DELETE FROM sched_fired_triggers WHERE sched_name = $1 AND entry_id = $2",
        )
        .bind(&self.sched_name)
        .bind(entry_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn select_fired_for_job(
        &mut self,
        job: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sched_fired_triggers \
             WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
            FIRED_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(job.name())
            .bind(job.group())
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(fired_from_row).collect()
    }

    async fn select_fired_for_instance(
        &mut self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sched_fired_triggers WHERE sched_name = $1 AND instance_name = $2",
            FIRED_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(instance_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(fired_from_row).collect()
    }

    async fn select_fired_instance_ids(&mut self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT instance_name FROM sched_fired_triggers WHERE sched_name = $1",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| row.try_get("instance_name").map_err(StoreError::from))
            .collect()
    }

    async fn delete_fired_for_instance(&mut self, instance_id: &str) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "DELETE FROM sched_fired_triggers WHERE sched_name = $1 AND instance_name = $2",
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected())
    }

    async fn select_scheduler_states(&mut self) -> Result<Vec<SchedulerStateRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT instance_name, last_checkin_time, checkin_interval \
             FROM sched_scheduler_state WHERE sched_name = $1",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SchedulerStateRecord {
                    instance_id: row.try_get("instance_name")?,
                    last_checkin: row.try_get("last_checkin_time")?,
                    checkin_interval_ms: row.try_get("checkin_interval")?,
                })
            })
            .collect()
    }

    async fn upsert_scheduler_state(
        &mut self,
        record: &SchedulerStateRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sched_scheduler_state (sched_name, instance_name, last_checkin_time, checkin_interval)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (sched_name, instance_name) DO UPDATE
            SET last_checkin_time = EXCLUDED.last_checkin_time,
                checkin_interval = EXCLUDED.checkin_interval
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.instance_id)
        .bind(record.last_checkin)
        .bind(record.checkin_interval_ms)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_scheduler_state(&mut self, instance_id: &str) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "DELETE FROM sched_scheduler_state WHERE sched_name = $1 AND instance_name = $2",
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn clear_all(&mut self) -> Result<(), StoreError> {
        for table in [
            "sched_fired_triggers",
            "sched_triggers",
            "sched_job_details",
            "sched_paused_trigger_grps",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE sched_name = $1", table))
                .bind(&self.sched_name)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
