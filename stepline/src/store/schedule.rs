//! Schedule rows.
//!
//! Unscheduling is a soft delete: the row stays with status `inactive` so
//! its fire history is kept, and it is never re-armed.

use super::{decode_error, RunStore};
use crate::core::{ScheduleRecord, ScheduleSpec, ScheduleStatus};
use crate::errors::Result;
use crate::utils::Timestamp;
use std::time::Duration;

impl RunStore {
    /// Persists a new schedule.
    pub async fn insert_schedule(&self, record: &ScheduleRecord) -> Result<()> {
        let (cron_expression, interval_seconds) = match &record.spec {
            ScheduleSpec::Cron(expr) => (Some(expr.as_str()), None),
            ScheduleSpec::Interval(every) => (None, Some(every.as_secs_f64())),
        };

        sqlx::query(
            r"
            INSERT INTO schedules (id, pipeline_name, trigger_kind, cron_expression,
                                   interval_seconds, status, created_at, last_run, next_run)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(&record.id)
        .bind(&record.pipeline_name)
        .bind(record.spec.kind())
        .bind(cron_expression)
        .bind(interval_seconds)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.last_run)
        .bind(record.next_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lists schedules, oldest first. With `active_only`, soft-deleted
    /// schedules are left out.
    pub async fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleRecord>> {
        let status = active_only.then_some(ScheduleStatus::Active.as_str());
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r"
            SELECT id, pipeline_name, trigger_kind, cron_expression, interval_seconds,
                   status, created_at, last_run, next_run
            FROM schedules
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at ASC, rowid ASC
            ",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(ScheduleRecord::try_from)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Fetches one schedule by id.
    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>> {
        let row = sqlx::query_as::<_, ScheduleRow>(
            r"
            SELECT id, pipeline_name, trigger_kind, cron_expression, interval_seconds,
                   status, created_at, last_run, next_run
            FROM schedules
            WHERE id = ?1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ScheduleRecord::try_from).transpose()?)
    }

    /// Active schedules whose id or pipeline name equals `key`.
    pub async fn find_active_schedules(&self, key: &str) -> Result<Vec<ScheduleRecord>> {
        Ok(self
            .list_schedules(true)
            .await?
            .into_iter()
            .filter(|s| s.id == key || s.pipeline_name == key)
            .collect())
    }

    /// Marks every schedule in `ids` inactive in one transaction: either
    /// all of them change or none does.
    pub async fn deactivate_schedules(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE schedules SET status = ?1 WHERE id = ?2")
                .bind(ScheduleStatus::Inactive.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Records a trigger firing and the next fire time.
    pub async fn record_schedule_fire(
        &self,
        id: &str,
        fired_at: Timestamp,
        next_run: Option<Timestamp>,
    ) -> Result<()> {
        sqlx::query("UPDATE schedules SET last_run = ?1, next_run = ?2 WHERE id = ?3")
            .bind(fired_at)
            .bind(next_run)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Updates the next fire time, e.g. after re-arming on start.
    pub async fn update_schedule_next_run(&self, id: &str, next_run: Option<Timestamp>) -> Result<()> {
        sqlx::query("UPDATE schedules SET next_run = ?1 WHERE id = ?2")
            .bind(next_run)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    pipeline_name: String,
    trigger_kind: String,
    cron_expression: Option<String>,
    interval_seconds: Option<f64>,
    status: String,
    created_at: Timestamp,
    last_run: Option<Timestamp>,
    next_run: Option<Timestamp>,
}

#[derive(Debug, thiserror::Error)]
#[error("schedule '{id}' has an unreadable trigger ({kind})")]
struct BadTrigger {
    id: String,
    kind: String,
}

impl TryFrom<ScheduleRow> for ScheduleRecord {
    type Error = sqlx::Error;

    fn try_from(row: ScheduleRow) -> std::result::Result<Self, Self::Error> {
        let spec = match row.trigger_kind.as_str() {
            "cron" => row.cron_expression.map(ScheduleSpec::Cron),
            "interval" => row
                .interval_seconds
                .filter(|secs| *secs > 0.0)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .map(ScheduleSpec::Interval),
            _ => None,
        };
        let Some(spec) = spec else {
            return Err(decode_error(BadTrigger {
                id: row.id,
                kind: row.trigger_kind,
            }));
        };

        Ok(Self {
            status: row.status.parse().map_err(decode_error)?,
            id: row.id,
            pipeline_name: row.pipeline_name,
            spec,
            created_at: row.created_at,
            last_run: row.last_run,
            next_run: row.next_run,
        })
    }
}
