//! Log rows and the follow cursor.

use super::{decode_error, RunStore};
use crate::core::LogType;
use crate::errors::Result;
use crate::utils::{now_utc, Timestamp};
use serde::Serialize;

/// One persisted log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Monotonic id; later lines have larger ids.
    pub id: i64,
    /// Run id.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Step name, absent for run-level lines.
    pub step_name: Option<String>,
    /// Which stream the line came from.
    pub log_type: LogType,
    /// The line, without its trailing newline.
    pub message: String,
    /// When the line was written.
    pub timestamp: Timestamp,
}

/// Filter for log queries. Results are ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Only lines of this run.
    pub run_id: Option<String>,
    /// Only lines of this pipeline.
    pub pipeline: Option<String>,
    /// Only lines of this step.
    pub step: Option<String>,
    /// Only lines of this type.
    pub log_type: Option<LogType>,
    /// Only lines with an id greater than this.
    pub since_id: Option<i64>,
    /// At most this many lines.
    pub limit: Option<u32>,
}

impl LogFilter {
    /// Matches every line.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one run.
    #[must_use]
    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Restricts to one pipeline.
    #[must_use]
    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline = Some(name.into());
        self
    }

    /// Restricts to one step.
    #[must_use]
    pub fn step(mut self, name: impl Into<String>) -> Self {
        self.step = Some(name.into());
        self
    }

    /// Restricts to one log type.
    #[must_use]
    pub fn log_type(mut self, log_type: LogType) -> Self {
        self.log_type = Some(log_type);
        self
    }

    /// Only lines after `id`.
    #[must_use]
    pub fn since(mut self, id: i64) -> Self {
        self.since_id = Some(id);
        self
    }

    /// Caps the number of lines.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl RunStore {
    /// Appends a log line and returns its id.
    pub async fn append_log(
        &self,
        run_id: &str,
        pipeline: &str,
        step: Option<&str>,
        log_type: LogType,
        message: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r"
            INSERT INTO logs (run_id, pipeline_name, step_name, log_type, message, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )
        .bind(run_id)
        .bind(pipeline)
        .bind(step)
        .bind(log_type.as_str())
        .bind(message)
        .bind(now_utc())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Queries log lines, oldest first.
    pub async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r"
            SELECT id, run_id, pipeline_name, step_name, log_type, message, timestamp
            FROM logs
            WHERE (?1 IS NULL OR run_id = ?1)
              AND (?2 IS NULL OR pipeline_name = ?2)
              AND (?3 IS NULL OR step_name = ?3)
              AND (?4 IS NULL OR log_type = ?4)
              AND id > ?5
            ORDER BY id ASC
            LIMIT ?6
            ",
        )
        .bind(&filter.run_id)
        .bind(&filter.pipeline)
        .bind(&filter.step)
        .bind(filter.log_type.map(|t| t.as_str()))
        .bind(filter.since_id.unwrap_or(0))
        .bind(filter.limit.map_or(-1, i64::from))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(LogEntry::try_from)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Deletes every log line. Returns the number of rows removed.
    pub async fn clear_logs(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM logs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Creates a cursor that returns new matching lines on each poll.
    #[must_use]
    pub fn follow(&self, filter: LogFilter) -> LogFollower {
        LogFollower::new(self.clone(), filter)
    }
}

/// Follows a log stream by remembering the last id it returned.
#[derive(Debug, Clone)]
pub struct LogFollower {
    store: RunStore,
    filter: LogFilter,
    last_id: i64,
}

impl LogFollower {
    /// Creates a follower starting after `filter.since_id`.
    #[must_use]
    pub fn new(store: RunStore, filter: LogFilter) -> Self {
        let last_id = filter.since_id.unwrap_or(0);
        Self {
            store,
            filter,
            last_id,
        }
    }

    /// Returns lines written since the previous poll.
    pub async fn poll(&mut self) -> Result<Vec<LogEntry>> {
        let filter = LogFilter {
            since_id: Some(self.last_id),
            ..self.filter.clone()
        };
        let entries = self.store.query_logs(&filter).await?;
        if let Some(last) = entries.last() {
            self.last_id = last.id;
        }
        Ok(entries)
    }

    /// The id of the last line returned.
    #[must_use]
    pub fn last_id(&self) -> i64 {
        self.last_id
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    run_id: String,
    pipeline_name: String,
    step_name: Option<String>,
    log_type: String,
    message: String,
    timestamp: Timestamp,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = sqlx::Error;

    fn try_from(row: LogRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            log_type: row.log_type.parse().map_err(decode_error)?,
            id: row.id,
            run_id: row.run_id,
            pipeline_name: row.pipeline_name,
            step_name: row.step_name,
            message: row.message,
            timestamp: row.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn seeded() -> RunStore {
        let store = RunStore::in_memory().await.unwrap();
        store
            .append_log("r1", "deploy", Some("build"), LogType::Stdout, "compiling")
            .await
            .unwrap();
        store
            .append_log("r1", "deploy", Some("build"), LogType::Stderr, "warning: unused")
            .await
            .unwrap();
        store
            .append_log("r1", "deploy", Some("test"), LogType::System, "retrying")
            .await
            .unwrap();
        store
            .append_log("r2", "other", None, LogType::System, "run cancelled")
            .await
            .unwrap();
        store
    }

    fn messages(entries: &[LogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.message.as_str()).collect()
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = seeded().await;

        let run = store.query_logs(&LogFilter::new().run("r1")).await.unwrap();
        assert_eq!(messages(&run), vec!["compiling", "warning: unused", "retrying"]);

        let step = store
            .query_logs(&LogFilter::new().run("r1").step("build"))
            .await
            .unwrap();
        assert_eq!(step.len(), 2);

        let stderr = store
            .query_logs(&LogFilter::new().log_type(LogType::Stderr))
            .await
            .unwrap();
        assert_eq!(messages(&stderr), vec!["warning: unused"]);

        let by_pipeline = store
            .query_logs(&LogFilter::new().pipeline("other"))
            .await
            .unwrap();
        assert_eq!(by_pipeline[0].step_name, None);

        let since = store
            .query_logs(&LogFilter::new().since(run[0].id).limit(1))
            .await
            .unwrap();
        assert_eq!(messages(&since), vec!["warning: unused"]);
    }

    #[tokio::test]
    async fn test_follower_returns_only_new_lines() {
        let store = seeded().await;
        let mut follower = store.follow(LogFilter::new().run("r1"));

        assert_eq!(follower.poll().await.unwrap().len(), 3);
        assert!(follower.poll().await.unwrap().is_empty());

        store
            .append_log("r1", "deploy", Some("test"), LogType::Stdout, "ok")
            .await
            .unwrap();
        store
            .append_log("r2", "other", None, LogType::Stdout, "ignored")
            .await
            .unwrap();

        let fresh = follower.poll().await.unwrap();
        assert_eq!(messages(&fresh), vec!["ok"]);
        assert_eq!(follower.last_id(), fresh[0].id);
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let store = seeded().await;
        assert_eq!(store.clear_logs().await.unwrap(), 4);
        assert!(store.query_logs(&LogFilter::new()).await.unwrap().is_empty());
    }
}
