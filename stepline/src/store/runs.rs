//! Run rows: creation, progress, completion, history and recovery.

use super::{decode_error, to_i64, to_usize, RunStore};
use crate::core::{ExecutionMode, PipelineRun, RunStatus, StepRecord, StepStatus};
use crate::errors::Result;
use crate::utils::{now_utc, Timestamp};
use serde::Serialize;
use tracing::warn;

/// Reason stored on runs and steps left `running` by a previous process.
pub const INTERRUPTED_REASON: &str = "interrupted by process restart";

/// A run row without its steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Run id.
    pub id: String,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Run status.
    pub status: RunStatus,
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Worker pool size.
    pub max_workers: usize,
    /// Start time.
    pub start_time: Timestamp,
    /// End time.
    pub end_time: Option<Timestamp>,
    /// Number of steps in the run.
    pub total_steps: usize,
    /// Steps that completed or were skipped.
    pub completed_steps: usize,
    /// Fraction of steps completed or skipped.
    pub progress: f64,
    /// Why the run did not complete.
    pub error: Option<String>,
}

/// Filter for run history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Only runs of this pipeline.
    pub pipeline: Option<String>,
    /// Only runs with this status.
    pub status: Option<RunStatus>,
    /// At most this many runs, newest first.
    pub limit: Option<u32>,
}

impl HistoryFilter {
    /// Matches every run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one pipeline.
    #[must_use]
    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline = Some(name.into());
        self
    }

    /// Restricts to one status.
    #[must_use]
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Caps the number of runs returned.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl RunStore {
    /// Persists a new run together with its pending steps and dependency
    /// edges, in one transaction.
    ///
    /// `order` fixes the position of each step in later listings.
    pub async fn begin_run(
        &self,
        run: &PipelineRun,
        order: &[String],
        edges: &[(String, String)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO runs (id, pipeline_name, status, mode, max_workers, start_time,
                              total_steps, completed_steps, progress)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(&run.id)
        .bind(&run.pipeline_name)
        .bind(run.status.as_str())
        .bind(run.mode.as_str())
        .bind(to_i64(run.max_workers))
        .bind(run.start_time)
        .bind(to_i64(run.total_steps()))
        .bind(to_i64(run.completed_steps()))
        .bind(run.progress())
        .execute(&mut *tx)
        .await?;

        for (position, name) in order.iter().enumerate() {
            let Some(step) = run.steps.get(name) else {
                continue;
            };
            sqlx::query(
                r"
                INSERT INTO steps (id, run_id, position, name, task, status, attempt,
                                   start_time, end_time, stdout, stderr, exit_code, error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
            )
            .bind(&step.id)
            .bind(&step.run_id)
            .bind(to_i64(position))
            .bind(&step.name)
            .bind(&step.task)
            .bind(step.status.as_str())
            .bind(i64::from(step.attempt))
            .bind(step.start_time)
            .bind(step.end_time)
            .bind(&step.stdout)
            .bind(&step.stderr)
            .bind(step.exit_code)
            .bind(&step.error)
            .execute(&mut *tx)
            .await?;
        }

        for (from, to) in edges {
            sqlx::query("INSERT OR IGNORE INTO dependencies (run_id, from_step, to_step) VALUES (?1, ?2, ?3)")
                .bind(&run.id)
                .bind(from)
                .bind(to)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Records the completed-step count and progress fraction of a running
    /// run.
    pub async fn update_run_progress(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query("UPDATE runs SET completed_steps = ?1, progress = ?2 WHERE id = ?3")
            .bind(to_i64(run.completed_steps()))
            .bind(run.progress())
            .bind(&run.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes the terminal status, end time, step counts, final progress
    /// and reason.
    pub async fn finish_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r"
            UPDATE runs
            SET status = ?1, end_time = ?2, total_steps = ?3, completed_steps = ?4,
                progress = ?5, error = ?6
            WHERE id = ?7
            ",
        )
        .bind(run.status.as_str())
        .bind(run.end_time.unwrap_or_else(now_utc))
        .bind(to_i64(run.total_steps()))
        .bind(to_i64(run.completed_steps()))
        .bind(run.progress())
        .bind(&run.error)
        .bind(&run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches one run row.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunSummary>> {
        let row = sqlx::query_as::<_, RunRow>(
            r"
            SELECT id, pipeline_name, status, mode, max_workers, start_time, end_time,
                   total_steps, completed_steps, progress, error
            FROM runs
            WHERE id = ?1
            ",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RunSummary::try_from).transpose()?)
    }

    /// Loads a run with all of its step records.
    pub async fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let Some(summary) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let steps = self.list_steps(run_id).await?;

        let mut run = PipelineRun::new(
            summary.id,
            summary.pipeline_name,
            summary.mode,
            summary.max_workers,
        );
        run.status = summary.status;
        run.start_time = summary.start_time;
        run.end_time = summary.end_time;
        run.error = summary.error;
        for step in steps {
            run.steps.insert(step.name.clone(), step);
        }
        Ok(Some(run))
    }

    /// Lists runs, newest first.
    pub async fn list_runs(&self, filter: &HistoryFilter) -> Result<Vec<RunSummary>> {
        let limit = filter.limit.map_or(-1, i64::from);
        let rows = sqlx::query_as::<_, RunRow>(
            r"
            SELECT id, pipeline_name, status, mode, max_workers, start_time, end_time,
                   total_steps, completed_steps, progress, error
            FROM runs
            WHERE (?1 IS NULL OR pipeline_name = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY start_time DESC, rowid DESC
            LIMIT ?3
            ",
        )
        .bind(&filter.pipeline)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(RunSummary::try_from)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// The most recent run of `pipeline` with `status`.
    pub async fn latest_run_with_status(
        &self,
        pipeline: &str,
        status: RunStatus,
    ) -> Result<Option<RunSummary>> {
        let runs = self
            .list_runs(&HistoryFilter::new().pipeline(pipeline).status(status).limit(1))
            .await?;
        Ok(runs.into_iter().next())
    }

    /// Marks runs left `running` by a previous process as failed, together
    /// with their `running` steps. Returns the affected run ids.
    pub async fn recover_interrupted_runs(&self) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let now = now_utc();

        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM runs WHERE status = ?1")
            .bind(RunStatus::Running.as_str())
            .fetch_all(&mut *tx)
            .await?;

        for (id,) in &ids {
            sqlx::query(
                r"
                UPDATE steps
                SET status = ?1, end_time = ?2, error = ?3
                WHERE run_id = ?4 AND status = ?5
                ",
            )
            .bind(StepStatus::Failed.as_str())
            .bind(now)
            .bind(INTERRUPTED_REASON)
            .bind(id)
            .bind(StepStatus::Running.as_str())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r"
                UPDATE runs
                SET status = ?1, end_time = ?2, error = ?3
                WHERE id = ?4
                ",
            )
            .bind(RunStatus::Failed.as_str())
            .bind(now)
            .bind(INTERRUPTED_REASON)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            warn!(run_id = %id, "Marked interrupted run as failed");
        }

        tx.commit().await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Persisted dependency edges of a run, sorted.
    pub async fn list_dependencies(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r"
            SELECT from_step, to_step
            FROM dependencies
            WHERE run_id = ?1
            ORDER BY from_step, to_step
            ",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Steps that completed in a run.
    pub async fn completed_steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        Ok(self
            .list_steps(run_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    pipeline_name: String,
    status: String,
    mode: String,
    max_workers: i64,
    start_time: Timestamp,
    end_time: Option<Timestamp>,
    total_steps: i64,
    completed_steps: i64,
    progress: f64,
    error: Option<String>,
}

impl TryFrom<RunRow> for RunSummary {
    type Error = sqlx::Error;

    fn try_from(row: RunRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse().map_err(decode_error)?,
            mode: row.mode.parse().map_err(decode_error)?,
            id: row.id,
            pipeline_name: row.pipeline_name,
            max_workers: to_usize(row.max_workers),
            start_time: row.start_time,
            end_time: row.end_time,
            total_steps: to_usize(row.total_steps),
            completed_steps: to_usize(row.completed_steps),
            progress: row.progress,
            error: row.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_run(id: &str, pipeline: &str) -> PipelineRun {
        let mut run = PipelineRun::new(id, pipeline, ExecutionMode::Parallel, 2);
        run.add_step("build", "ci.build");
        run.add_step("test", "ci.test");
        run
    }

    async fn store_with_run(id: &str) -> (RunStore, PipelineRun) {
        let store = RunStore::in_memory().await.unwrap();
        let run = sample_run(id, "deploy");
        store
            .begin_run(
                &run,
                &["build".to_string(), "test".to_string()],
                &[("build".to_string(), "test".to_string())],
            )
            .await
            .unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn test_begin_and_load_run() {
        let (store, _) = store_with_run("deploy_1").await;

        let loaded = store.load_run("deploy_1").await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_name, "deploy");
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.mode, ExecutionMode::Parallel);
        assert_eq!(loaded.max_workers, 2);
        assert_eq!(loaded.total_steps(), 2);
        assert_eq!(loaded.step_status("test"), Some(StepStatus::Pending));

        assert_eq!(
            store.list_dependencies("deploy_1").await.unwrap(),
            vec![("build".to_string(), "test".to_string())]
        );
        assert!(store.load_run("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_run_records_reason() {
        let (store, mut run) = store_with_run("deploy_2").await;
        let fresh = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!((fresh.total_steps, fresh.completed_steps), (2, 0));

        run.step_mut("build").unwrap().transition(StepStatus::Completed);
        store.update_run_progress(&run).await.unwrap();
        let halfway = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(halfway.completed_steps, 1);
        assert!((halfway.progress - 0.5).abs() < 1e-9);

        run.finish(RunStatus::Failed, Some("step 'build' failed".to_string()));
        store.finish_run(&run).await.unwrap();

        let summary = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.end_time.is_some());
        assert_eq!(summary.error.as_deref(), Some("step 'build' failed"));
    }

    #[tokio::test]
    async fn test_history_filter_and_order() {
        let store = RunStore::in_memory().await.unwrap();
        for (i, pipeline) in ["a", "b", "a"].iter().enumerate() {
            let mut run = sample_run(&format!("{pipeline}_{i}"), pipeline);
            run.start_time = now_utc() + chrono::Duration::seconds(i64::try_from(i).unwrap());
            store.begin_run(&run, &[], &[]).await.unwrap();
            if i == 0 {
                run.finish(RunStatus::Failed, None);
                store.finish_run(&run).await.unwrap();
            }
        }

        let all = store.list_runs(&HistoryFilter::new()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "a_2");

        let only_a = store.list_runs(&HistoryFilter::new().pipeline("a")).await.unwrap();
        assert_eq!(
            only_a.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a_2", "a_0"]
        );

        let limited = store.list_runs(&HistoryFilter::new().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);

        let failed = store
            .latest_run_with_status("a", RunStatus::Failed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.id, "a_0");
        assert!(store
            .latest_run_with_status("b", RunStatus::Failed)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted_runs() {
        let (store, mut run) = store_with_run("deploy_3").await;
        let build = run.step_mut("build").unwrap();
        build.transition(StepStatus::Running);
        build.attempt = 1;
        store.update_step(build).await.unwrap();

        let recovered = store.recover_interrupted_runs().await.unwrap();
        assert_eq!(recovered, vec!["deploy_3".to_string()]);

        let loaded = store.load_run("deploy_3").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(loaded.step_status("build"), Some(StepStatus::Failed));
        assert_eq!(loaded.step_status("test"), Some(StepStatus::Pending));

        assert!(store.recover_interrupted_runs().await.unwrap().is_empty());
    }
}
