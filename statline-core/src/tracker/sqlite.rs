//! SQLite-backed run log
//!
//! Insert-only access to the `run_records` table. Appends go through
//! [`retry_on_lock`] so that parallel backfill workers contending for the
//! write lock wait instead of failing. WAL mode gives readers on other
//! connections (and other processes) visibility of every committed append.

use super::{RunLog, RunMetrics, RunRecord, RunStatus, TriggerMetadata};
use sqlx::{Row, SqlitePool};
use statline_common::db::{init_database, retry_on_lock};
use statline_common::time::from_millis;
use statline_common::{Error, Result};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SqliteRunLog {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteRunLog {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    /// Open (creating if needed) the database at `path`
    pub async fn open(path: &Path, max_lock_wait_ms: u64) -> Result<Self> {
        let pool = init_database(path).await?;
        Ok(Self::new(pool, max_lock_wait_ms))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl RunLog for SqliteRunLog {
    async fn append(&self, record: &RunRecord) -> Result<()> {
        let run_id = record.run_id.to_string();
        let trigger_json = serde_json::to_string(&record.trigger)
            .map_err(|e| Error::Internal(format!("Failed to serialize trigger: {}", e)))?;
        let metrics_json = record
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Internal(format!("Failed to serialize metrics: {}", e)))?;
        let started_at_ms = record.started_at.timestamp_millis();
        let completed_at_ms = record.completed_at.map(|t| t.timestamp_millis());
        let recorded_at_ms = record.recorded_at.timestamp_millis();

        retry_on_lock("append_run_record", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO run_records (
                    run_id, processor_name, phase, data_unit_key, status,
                    started_at_ms, completed_at_ms, trigger_json, metrics_json, recorded_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&run_id)
            .bind(&record.processor_name)
            .bind(&record.phase)
            .bind(&record.data_unit_key)
            .bind(record.status.as_str())
            .bind(started_at_ms)
            .bind(completed_at_ms)
            .bind(&trigger_json)
            .bind(&metrics_json)
            .bind(recorded_at_ms)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

            Ok(())
        })
        .await
    }

    async fn query_latest(
        &self,
        processor_name: &str,
        data_unit_key: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, processor_name, phase, data_unit_key, status,
                   started_at_ms, completed_at_ms, trigger_json, metrics_json, recorded_at_ms
            FROM run_records
            WHERE processor_name = ? AND data_unit_key = ?
            ORDER BY started_at_ms DESC, seq DESC
            LIMIT ?
            "#,
        )
        .bind(processor_name)
        .bind(data_unit_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunRecord> {
    let run_id: String = row.get("run_id");
    let run_id = Uuid::parse_str(&run_id)
        .map_err(|e| Error::Internal(format!("Invalid run_id '{}': {}", run_id, e)))?;

    let status: String = row.get("status");
    let status: RunStatus = status.parse()?;

    let trigger_json: String = row.get("trigger_json");
    let trigger: TriggerMetadata = serde_json::from_str(&trigger_json)
        .map_err(|e| Error::Internal(format!("Invalid trigger_json: {}", e)))?;

    let metrics_json: Option<String> = row.get("metrics_json");
    let metrics: Option<RunMetrics> = metrics_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| Error::Internal(format!("Invalid metrics_json: {}", e)))?;

    let completed_at_ms: Option<i64> = row.get("completed_at_ms");

    Ok(RunRecord {
        run_id,
        processor_name: row.get("processor_name"),
        phase: row.get("phase"),
        data_unit_key: row.get("data_unit_key"),
        status,
        started_at: from_millis(row.get("started_at_ms")),
        completed_at: completed_at_ms.map(from_millis),
        trigger,
        metrics,
        recorded_at: from_millis(row.get("recorded_at_ms")),
    })
}
