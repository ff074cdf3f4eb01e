//! Step rows.

use super::{decode_error, RunStore};
use crate::core::StepRecord;
use crate::errors::Result;
use crate::utils::Timestamp;

impl RunStore {
    /// Writes the current state of a step record.
    ///
    /// Called on every transition and attempt, so readers always see the
    /// latest status, attempt counter and captured output.
    pub async fn update_step(&self, step: &StepRecord) -> Result<()> {
        sqlx::query(
            r"
            UPDATE steps
            SET status = ?1, attempt = ?2, start_time = ?3, end_time = ?4,
                stdout = ?5, stderr = ?6, exit_code = ?7, error = ?8
            WHERE id = ?9
            ",
        )
        .bind(step.status.as_str())
        .bind(i64::from(step.attempt))
        .bind(step.start_time)
        .bind(step.end_time)
        .bind(&step.stdout)
        .bind(&step.stderr)
        .bind(step.exit_code)
        .bind(&step.error)
        .bind(&step.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Step records of a run in declaration order.
    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            r"
            SELECT id, run_id, name, task, status, attempt, start_time, end_time,
                   stdout, stderr, exit_code, error
            FROM steps
            WHERE run_id = ?1
            ORDER BY position ASC
            ",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(StepRecord::try_from)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// One step record.
    pub async fn get_step(&self, run_id: &str, name: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query_as::<_, StepRow>(
            r"
            SELECT id, run_id, name, task, status, attempt, start_time, end_time,
                   stdout, stderr, exit_code, error
            FROM steps
            WHERE run_id = ?1 AND name = ?2
            ",
        )
        .bind(run_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StepRecord::try_from).transpose()?)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    name: String,
    task: String,
    status: String,
    attempt: i64,
    start_time: Option<Timestamp>,
    end_time: Option<Timestamp>,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl TryFrom<StepRow> for StepRecord {
    type Error = sqlx::Error;

    fn try_from(row: StepRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse().map_err(decode_error)?,
            attempt: u32::try_from(row.attempt).unwrap_or(0),
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            task: row.task,
            start_time: row.start_time,
            end_time: row.end_time,
            stdout: row.stdout,
            stderr: row.stderr,
            exit_code: row.exit_code,
            error: row.error,
        })
    }
}
