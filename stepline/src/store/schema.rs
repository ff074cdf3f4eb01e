//! Run store schema.
//!
//! Migrations are idempotent `CREATE ... IF NOT EXISTS` statements, so
//! opening an existing database is safe.

use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        pipeline_name TEXT NOT NULL,
        status TEXT NOT NULL,
        mode TEXT NOT NULL,
        max_workers INTEGER NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        total_steps INTEGER NOT NULL DEFAULT 0,
        completed_steps INTEGER NOT NULL DEFAULT 0,
        progress REAL NOT NULL DEFAULT 0,
        error TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        task TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0,
        start_time TEXT,
        end_time TEXT,
        stdout TEXT NOT NULL DEFAULT '',
        stderr TEXT NOT NULL DEFAULT '',
        exit_code INTEGER,
        error TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS dependencies (
        run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
        from_step TEXT NOT NULL,
        to_step TEXT NOT NULL,
        PRIMARY KEY (run_id, from_step, to_step)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        pipeline_name TEXT NOT NULL,
        step_name TEXT,
        log_type TEXT NOT NULL,
        message TEXT NOT NULL,
        timestamp TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS schedules (
        id TEXT PRIMARY KEY,
        pipeline_name TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        cron_expression TEXT,
        interval_seconds REAL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_run TEXT,
        next_run TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline_name, start_time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
    "CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_logs_run ON logs(run_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_schedules_pipeline ON schedules(pipeline_name, status)",
];

/// Creates every table and index the run store needs.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::debug!("Run store migrations completed");
    Ok(())
}
