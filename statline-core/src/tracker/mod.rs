//! Run Tracker
//!
//! Idempotent run tracking over an append-only run log. For a given
//! (processor, data unit) key the *current* status is the status of the
//! most-recently-started record; records are never updated in place.
//!
//! # Deduplication protocol
//! 1. [`RunTracker::evaluate`] reads the latest record for the key
//! 2. If not processed, [`RunTracker::start`] appends a `running` record and
//!    only returns once the append is durable and visible to other readers
//! 3. [`RunTracker::complete`] appends a terminal record with the same
//!    `run_id` and `started_at`
//!
//! A `running` record older than the staleness threshold is presumed
//! abandoned and may be superseded by a new attempt.

mod memory;
mod sqlite;

pub use memory::InMemoryRunLog;
pub use sqlite::SqliteRunLog;

use crate::error::TrackerError;
use crate::types::QualityTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statline_common::config::{RunLogBackend, RunLogConfig, TrackerConfig};
use statline_common::time::Clock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = statline_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(statline_common::Error::InvalidInput(format!(
                "Unknown run status: {}",
                other
            ))),
        }
    }
}

/// Audit context passed through `start`; stored, never interpreted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerMetadata {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
    pub backfill: bool,
    pub extra: BTreeMap<String, String>,
}

impl TriggerMetadata {
    pub fn message(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Default::default()
        }
    }

    pub fn backfill() -> Self {
        Self {
            backfill: true,
            source: Some("backfill".to_string()),
            ..Default::default()
        }
    }
}

/// Outcome figures stored with a terminal record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetrics {
    pub records_written: u64,
    pub quality_score: Option<u8>,
    pub tier: Option<QualityTier>,
    pub error: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl RunMetrics {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// One append-only lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub processor_name: String,
    pub phase: String,
    pub data_unit_key: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub trigger: TriggerMetadata,
    pub metrics: Option<RunMetrics>,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Run Log Contract
// ============================================================================

/// Append-only store of [`RunRecord`]s
///
/// Implementations must guarantee read-after-write visibility: once
/// `append` returns `Ok`, a `query_latest` issued by any other caller sees
/// the record.
#[async_trait::async_trait]
pub trait RunLog: Send + Sync {
    async fn append(&self, record: &RunRecord) -> statline_common::Result<()>;

    /// Up to `limit` records for the key, newest `started_at` first; ties
    /// are broken by append order, latest append first.
    async fn query_latest(
        &self,
        processor_name: &str,
        data_unit_key: &str,
        limit: usize,
    ) -> statline_common::Result<Vec<RunRecord>>;
}

/// Open the backend selected by `[run_log]`
pub async fn open_run_log(config: &RunLogConfig) -> statline_common::Result<Arc<dyn RunLog>> {
    match config.backend {
        RunLogBackend::Sqlite => {
            let log = SqliteRunLog::open(&config.database, config.max_lock_wait_ms).await?;
            Ok(Arc::new(log))
        }
        RunLogBackend::Memory => Ok(Arc::new(InMemoryRunLog::new())),
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Returned by [`RunTracker::start`]; consumed by [`RunTracker::complete`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub processor_name: String,
    pub phase: String,
    pub data_unit_key: String,
    pub started_at: DateTime<Utc>,
    pub trigger: TriggerMetadata,
}

/// Current state of a key, as seen by the deduplication check
#[derive(Debug, Clone, PartialEq)]
pub enum RunCheck {
    NeverRun,
    /// Latest record is `success` or `partial`
    Completed { run_id: Uuid, status: RunStatus },
    /// Latest record is `failed`
    Retryable { run_id: Uuid },
    /// Latest record is `running` and younger than the staleness threshold
    InFlight { run_id: Uuid, age: chrono::Duration },
    /// Latest record is `running` and at least as old as the threshold
    Stale { run_id: Uuid, age: chrono::Duration },
}

impl RunCheck {
    /// Whether a new attempt must not start
    pub fn is_processed(&self) -> bool {
        matches!(self, RunCheck::Completed { .. } | RunCheck::InFlight { .. })
    }
}

impl std::fmt::Display for RunCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunCheck::NeverRun => write!(f, "never run"),
            RunCheck::Completed { run_id, status } => write!(f, "completed ({}) run {}", status, run_id),
            RunCheck::Retryable { run_id } => write!(f, "failed, retryable (run {})", run_id),
            RunCheck::InFlight { run_id, age } => {
                write!(f, "in flight for {} min (run {})", age.num_minutes(), run_id)
            }
            RunCheck::Stale { run_id, age } => {
                write!(f, "stale after {} min (run {})", age.num_minutes(), run_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A `running` record was appended; `superseded` is set when a stale run was taken over
    Started {
        handle: RunHandle,
        superseded: Option<RunCheck>,
    },
    AlreadyProcessed(RunCheck),
}

pub struct RunTracker {
    log: Arc<dyn RunLog>,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
}

impl RunTracker {
    pub fn new(log: Arc<dyn RunLog>, clock: Arc<dyn Clock>, config: TrackerConfig) -> Self {
        Self { log, clock, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Append a `running` record; fail-closed
    ///
    /// Returns only after the append is durable. If it fails the caller must
    /// abort the attempt: proceeding untracked reopens the duplicate window.
    pub async fn start(
        &self,
        processor_name: &str,
        phase: &str,
        data_unit_key: &str,
        trigger: TriggerMetadata,
    ) -> Result<RunHandle, TrackerError> {
        let now = self.clock.now();
        let handle = RunHandle {
            run_id: Uuid::new_v4(),
            processor_name: processor_name.to_string(),
            phase: phase.to_string(),
            data_unit_key: data_unit_key.to_string(),
            started_at: now,
            trigger,
        };

        let record = RunRecord {
            run_id: handle.run_id,
            processor_name: handle.processor_name.clone(),
            phase: handle.phase.clone(),
            data_unit_key: handle.data_unit_key.clone(),
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            trigger: handle.trigger.clone(),
            metrics: None,
            recorded_at: now,
        };

        if let Err(e) = self.log.append(&record).await {
            error!(
                processor = %processor_name,
                data_unit_key = %data_unit_key,
                error = %e,
                "Run log append failed, aborting attempt"
            );
            return Err(TrackerError::AppendFailed {
                processor: processor_name.to_string(),
                data_unit_key: data_unit_key.to_string(),
                source: e,
            });
        }

        info!(
            processor = %processor_name,
            phase = %phase,
            data_unit_key = %data_unit_key,
            run_id = %handle.run_id,
            backfill = handle.trigger.backfill,
            "Run started"
        );

        Ok(handle)
    }

    /// Append the terminal record for `handle`
    pub async fn complete(
        &self,
        handle: RunHandle,
        status: RunStatus,
        metrics: RunMetrics,
    ) -> Result<RunRecord, TrackerError> {
        if !status.is_terminal() {
            return Err(TrackerError::NonTerminalStatus(status.to_string()));
        }

        let now = self.clock.now();
        let record = RunRecord {
            run_id: handle.run_id,
            processor_name: handle.processor_name,
            phase: handle.phase,
            data_unit_key: handle.data_unit_key,
            status,
            started_at: handle.started_at,
            completed_at: Some(now),
            trigger: handle.trigger,
            metrics: Some(metrics),
            recorded_at: now,
        };

        self.log.append(&record).await?;

        info!(
            processor = %record.processor_name,
            data_unit_key = %record.data_unit_key,
            run_id = %record.run_id,
            status = %status,
            duration_ms = (now - record.started_at).num_milliseconds(),
            "Run completed"
        );

        Ok(record)
    }

    /// Classify the latest record for the key
    ///
    /// A `Stale` result always logs a warning: the caller is about to
    /// supersede an abandoned run.
    pub async fn evaluate(
        &self,
        processor_name: &str,
        data_unit_key: &str,
    ) -> Result<RunCheck, TrackerError> {
        let latest = self
            .log
            .query_latest(processor_name, data_unit_key, 1)
            .await
            .map_err(TrackerError::QueryFailed)?;

        let Some(record) = latest.into_iter().next() else {
            return Ok(RunCheck::NeverRun);
        };

        let check = match record.status {
            RunStatus::Success | RunStatus::Partial => RunCheck::Completed {
                run_id: record.run_id,
                status: record.status,
            },
            RunStatus::Failed => RunCheck::Retryable {
                run_id: record.run_id,
            },
            RunStatus::Running => {
                let age = self.clock.now() - record.started_at;
                if age >= self.config.staleness_threshold() {
                    warn!(
                        processor = %processor_name,
                        data_unit_key = %data_unit_key,
                        run_id = %record.run_id,
                        age_minutes = age.num_minutes(),
                        threshold_minutes = self.config.staleness_threshold_minutes,
                        "Stale running record found, superseding"
                    );
                    RunCheck::Stale {
                        run_id: record.run_id,
                        age,
                    }
                } else {
                    RunCheck::InFlight {
                        run_id: record.run_id,
                        age,
                    }
                }
            }
        };

        debug!(
            processor = %processor_name,
            data_unit_key = %data_unit_key,
            check = %check,
            "Run check"
        );

        Ok(check)
    }

    pub async fn check_already_processed(
        &self,
        processor_name: &str,
        data_unit_key: &str,
    ) -> Result<bool, TrackerError> {
        Ok(self.evaluate(processor_name, data_unit_key).await?.is_processed())
    }

    /// Check, then start when the key is not already processed
    pub async fn begin(
        &self,
        processor_name: &str,
        phase: &str,
        data_unit_key: &str,
        trigger: TriggerMetadata,
    ) -> Result<StartOutcome, TrackerError> {
        let check = self.evaluate(processor_name, data_unit_key).await?;
        if check.is_processed() {
            info!(
                processor = %processor_name,
                data_unit_key = %data_unit_key,
                check = %check,
                "Already processed, skipping duplicate trigger"
            );
            return Ok(StartOutcome::AlreadyProcessed(check));
        }

        let handle = self
            .start(processor_name, phase, data_unit_key, trigger)
            .await?;
        let superseded = matches!(check, RunCheck::Stale { .. }).then_some(check);
        Ok(StartOutcome::Started { handle, superseded })
    }

    /// Latest `history_limit` records for the key, newest first
    pub async fn history(
        &self,
        processor_name: &str,
        data_unit_key: &str,
    ) -> Result<Vec<RunRecord>, TrackerError> {
        self.history_with_limit(processor_name, data_unit_key, self.config.history_limit)
            .await
    }

    pub async fn history_with_limit(
        &self,
        processor_name: &str,
        data_unit_key: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>, TrackerError> {
        self.log
            .query_latest(processor_name, data_unit_key, limit)
            .await
            .map_err(TrackerError::QueryFailed)
    }
}
