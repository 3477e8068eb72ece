//! Database initialization
//!
//! Opens (creating if needed) the SQLite file backing the run log and makes
//! sure the append-only `run_records` table exists. Safe to call repeatedly
//! and from several processes against the same file.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open the run-log database and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // WAL lets concurrent readers proceed while one writer appends; a committed
    // append is visible to every connection opened afterwards.
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(250));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new run-log database: {}", db_path.display());
    } else {
        info!("Opened existing run-log database: {}", db_path.display());
    }

    create_run_records_table(&pool).await?;

    Ok(pool)
}

/// Append-only lifecycle log, one row per start/complete event.
///
/// `seq` breaks ties between a run's `running` row and its terminal row,
/// which share `started_at_ms`.
pub async fn create_run_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            processor_name TEXT NOT NULL,
            phase TEXT NOT NULL,
            data_unit_key TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('running', 'success', 'partial', 'failed')),
            started_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER,
            trigger_json TEXT NOT NULL DEFAULT '{}',
            metrics_json TEXT,
            recorded_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_run_records_key_latest
        ON run_records (processor_name, data_unit_key, started_at_ms DESC, seq DESC)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_run_records_run_id ON run_records (run_id)")
        .execute(pool)
        .await?;

    Ok(())
}
