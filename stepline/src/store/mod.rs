//! Persistent run store.
//!
//! Every run, step transition, log line and schedule goes through
//! [`RunStore`], backed by SQLite. Writes happen as events occur so that
//! concurrent readers see near-real-time state, and everything survives a
//! process restart.

mod logs;
mod runs;
mod schedule;
mod schema;
mod steps;

pub use logs::{LogEntry, LogFilter, LogFollower};
pub use runs::{HistoryFilter, RunSummary, INTERRUPTED_REASON};

use crate::errors::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Handle to the run store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    /// Opens (creating if needed) the database at `url` and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns a store error if the database cannot be opened or migrated.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Each connection to `:memory:` is its own database, so an in-memory
        // store is pinned to one connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, "Run store opened");
        Ok(store)
    }

    /// Opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns a store error if SQLite cannot be initialised.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Runs the schema migrations.
    ///
    /// # Errors
    ///
    /// Returns a store error if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        schema::run_migrations(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

pub(crate) fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

pub(crate) fn decode_error(err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_migrates_twice() {
        let store = RunStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('runs', 'steps', 'dependencies', 'logs', 'schedules')",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_file_store_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.sqlite");
        let url = format!("sqlite://{}?mode=rwc", path.display());

        let store = RunStore::connect(&url, 2).await.unwrap();
        store.close().await;
        assert!(path.exists());
    }
}
