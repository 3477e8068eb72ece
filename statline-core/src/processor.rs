//! Pipeline stage runner
//!
//! Composes tracker, resolver, scorer and alerts for one processing stage.
//! Collaborators are injected at construction; a stage holds them, it does
//! not inherit their behavior.
//!
//! # Flow (per data unit)
//! 1. `tracker.begin`: duplicates return [`StageOutcome::Duplicate`]
//! 2. `resolver.resolve_scored`
//! 3. Downstream write via the caller's writer
//! 4. `tracker.complete` with the matching terminal status

use crate::alerts::{AlertAggregator, AlertEvent};
use crate::error::{ResolveError, StageError, TrackerError};
use crate::resolver::{ExtractorSet, FallbackChainResolver, ScoredExtraction};
use crate::tracker::{RunCheck, RunHandle, RunMetrics, RunStatus, RunTracker, StartOutcome, TriggerMetadata};
use crate::types::{ExtractionContext, QualityScore};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Identity of one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    pub processor: String,
    pub phase: String,
    /// Fallback chain this stage resolves
    pub chain: String,
}

impl StageDefinition {
    pub fn new(processor: impl Into<String>, phase: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            phase: phase.into(),
            chain: chain.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Already processed or in flight elsewhere; nothing was done
    Duplicate(RunCheck),
    /// Chain exhausted under `skip`; run recorded as partial
    Skipped { run_id: Uuid, issues: Vec<String> },
    Processed {
        run_id: Uuid,
        status: RunStatus,
        quality: QualityScore,
        source_used: Option<String>,
        records_written: u64,
    },
}

pub struct StageRunner {
    definition: StageDefinition,
    resolver: Arc<FallbackChainResolver>,
    tracker: Arc<RunTracker>,
    alerts: Arc<AlertAggregator>,
}

impl StageRunner {
    pub fn new(
        definition: StageDefinition,
        resolver: Arc<FallbackChainResolver>,
        tracker: Arc<RunTracker>,
        alerts: Arc<AlertAggregator>,
    ) -> Self {
        Self {
            definition,
            resolver,
            tracker,
            alerts,
        }
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    /// Process one data unit
    ///
    /// `write` receives the resolved data and returns the number of records
    /// it wrote downstream.
    pub async fn run<W, Fut, E>(
        &self,
        data_unit_key: &str,
        trigger: TriggerMetadata,
        extractors: &ExtractorSet,
        write: W,
    ) -> Result<StageOutcome, StageError>
    where
        W: FnOnce(ScoredExtraction) -> Fut,
        Fut: Future<Output = Result<u64, E>>,
        E: std::fmt::Display,
    {
        let def = &self.definition;

        let handle = match self
            .tracker
            .begin(&def.processor, &def.phase, data_unit_key, trigger)
            .await
        {
            Ok(StartOutcome::AlreadyProcessed(check)) => {
                return Ok(StageOutcome::Duplicate(check));
            }
            Ok(StartOutcome::Started { handle, superseded }) => {
                if let Some(RunCheck::Stale { run_id, age }) = superseded {
                    self.alerts
                        .notify(AlertEvent::stale_run_superseded(
                            &def.processor,
                            data_unit_key,
                            &run_id.to_string(),
                            age.num_minutes(),
                        ))
                        .await;
                }
                handle
            }
            Err(e) => {
                // Fail-closed: never resolve or write without a tracked run
                self.alerts
                    .notify(AlertEvent::run_log_unavailable(
                        &def.processor,
                        data_unit_key,
                        &e.to_string(),
                    ))
                    .await;
                return Err(e.into());
            }
        };
        let run_id = handle.run_id;

        let ctx = ExtractionContext::new(data_unit_key).with_processor(def.processor.as_str());
        let scored = match self.resolver.resolve_scored(&def.chain, extractors, &ctx).await {
            Ok(scored) => scored,
            Err(e) => {
                if let ResolveError::ChainExhausted { issues, .. } = &e {
                    self.alerts
                        .notify(AlertEvent::chain_exhausted(
                            &def.processor,
                            data_unit_key,
                            &def.chain,
                            issues,
                        ))
                        .await;
                }
                self.finish_failed(handle, RunMetrics::failed(e.to_string())).await;
                return Err(e.into());
            }
        };

        let quality = scored.quality.clone();
        let metrics_base = RunMetrics {
            quality_score: Some(quality.score),
            tier: Some(quality.tier),
            ..Default::default()
        };

        if scored.extraction.should_skip() {
            self.finish(handle, RunStatus::Partial, metrics_base).await?;
            return Ok(StageOutcome::Skipped {
                run_id,
                issues: scored.extraction.quality_issues,
            });
        }

        let degraded = scored.extraction.is_placeholder() || scored.extraction.is_degraded();
        let source_used = scored.extraction.source_used().map(str::to_string);
        let issues = scored.extraction.quality_issues.clone();

        let records_written = match write(scored).await {
            Ok(n) => n,
            Err(e) => {
                let message = e.to_string();
                error!(
                    processor = %def.processor,
                    data_unit_key = %data_unit_key,
                    error = %message,
                    "Downstream write failed"
                );
                self.finish_failed(
                    handle,
                    RunMetrics {
                        error: Some(message.clone()),
                        ..metrics_base
                    },
                )
                .await;
                return Err(StageError::Write(message));
            }
        };

        if degraded {
            self.alerts
                .notify(AlertEvent::degraded_extraction(
                    &def.processor,
                    data_unit_key,
                    &def.chain,
                    &issues.join(", "),
                ))
                .await;
        } else if !quality.prediction_eligible {
            self.alerts
                .notify(AlertEvent::unusable_quality(
                    &def.processor,
                    data_unit_key,
                    &def.chain,
                    quality.score,
                ))
                .await;
        }

        let status = if degraded {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
        self.finish(
            handle,
            status,
            RunMetrics {
                records_written,
                ..metrics_base
            },
        )
        .await?;

        info!(
            processor = %def.processor,
            data_unit_key = %data_unit_key,
            source_used = ?source_used,
            score = quality.score,
            tier = %quality.tier,
            records_written,
            "Stage processed data unit"
        );

        Ok(StageOutcome::Processed {
            run_id,
            status,
            quality,
            source_used,
            records_written,
        })
    }

    async fn finish(
        &self,
        handle: RunHandle,
        status: RunStatus,
        metrics: RunMetrics,
    ) -> Result<(), TrackerError> {
        self.tracker.complete(handle, status, metrics).await.map(|_| ())
    }

    /// Record a `failed` terminal status on an error path
    ///
    /// A run-log failure here is logged only; the caller returns the error
    /// that caused the failure.
    async fn finish_failed(&self, handle: RunHandle, metrics: RunMetrics) {
        let run_id = handle.run_id;
        let data_unit_key = handle.data_unit_key.clone();
        if let Err(e) = self.finish(handle, RunStatus::Failed, metrics).await {
            error!(
                processor = %self.definition.processor,
                data_unit_key = %data_unit_key,
                run_id = %run_id,
                error = %e,
                "Failed to record failed run"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SourceCatalog;
    use crate::resolver::mock::ScriptedExtractor;
    use crate::scorer::QualityScorer;
    use crate::tracker::{InMemoryRunLog, RunLog, RunRecord};
    use crate::alerts::MemorySink;
    use serde_json::json;
    use statline_common::config::{
        AlertsConfig, ChainConfig, ExhaustionPolicy, ResolverConfig, ScoringConfig, SourceConfig,
        TrackerConfig,
    };
    use statline_common::time::ManualClock;

    struct BrokenRunLog;

    #[async_trait::async_trait]
    impl RunLog for BrokenRunLog {
        async fn append(&self, _record: &RunRecord) -> statline_common::Result<()> {
            Err(statline_common::Error::Internal("disk full".to_string()))
        }

        async fn query_latest(
            &self,
            _processor_name: &str,
            _data_unit_key: &str,
            _limit: usize,
        ) -> statline_common::Result<Vec<RunRecord>> {
            Ok(vec![])
        }
    }

    /// Accepts the `running` record, rejects every later append
    #[derive(Default)]
    struct StartOnlyRunLog {
        appends: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RunLog for StartOnlyRunLog {
        async fn append(&self, _record: &RunRecord) -> statline_common::Result<()> {
            if self.appends.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(statline_common::Error::Internal("disk full".to_string()))
            }
        }

        async fn query_latest(
            &self,
            _processor_name: &str,
            _data_unit_key: &str,
            _limit: usize,
        ) -> statline_common::Result<Vec<RunRecord>> {
            Ok(vec![])
        }
    }

    struct Harness {
        runner: StageRunner,
        log: Arc<InMemoryRunLog>,
        sink: MemorySink,
    }

    fn harness_with_log(exhaustion: ExhaustionPolicy, log: Arc<dyn RunLog>) -> (StageRunner, MemorySink) {
        let sources = vec![
            SourceConfig {
                id: "nbac".to_string(),
                weight: 100,
                tier: "primary".to_string(),
                fields: vec![],
                timeout_ms: None,
            },
            SourceConfig {
                id: "espn".to_string(),
                weight: 80,
                tier: "secondary".to_string(),
                fields: vec![],
                timeout_ms: None,
            },
        ];
        let chains = vec![ChainConfig {
            name: "team_boxscores".to_string(),
            sources: vec!["nbac".to_string(), "espn".to_string()],
            exhaustion,
        }];
        let catalog = Arc::new(SourceCatalog::new(&sources, &chains).unwrap());
        let resolver = Arc::new(FallbackChainResolver::new(
            catalog,
            QualityScorer::new(ScoringConfig::default()),
            ResolverConfig {
                extractor_timeout_ms: 100,
            },
        ));

        let clock = Arc::new(ManualClock::starting_now());
        let tracker = Arc::new(RunTracker::new(log, clock.clone(), TrackerConfig::default()));
        let sink = MemorySink::new();
        let alerts = Arc::new(AlertAggregator::new(
            Arc::new(sink.clone()),
            clock,
            AlertsConfig::default(),
        ));

        let runner = StageRunner::new(
            StageDefinition::new("team_offense_game_summary", "phase3", "team_boxscores"),
            resolver,
            tracker,
            alerts,
        );
        (runner, sink)
    }

    fn harness(exhaustion: ExhaustionPolicy) -> Harness {
        let log = Arc::new(InMemoryRunLog::new());
        let (runner, sink) = harness_with_log(exhaustion, log.clone());
        Harness { runner, log, sink }
    }

    fn failing_nbac() -> ExtractorSet {
        ExtractorSet::new()
            .with("nbac", ScriptedExtractor::failing("nbac"))
            .with("espn", ScriptedExtractor::rows("espn", json!([{"team": "BOS"}, {"team": "NYK"}])))
    }

    fn all_failing() -> ExtractorSet {
        ExtractorSet::new()
            .with("nbac", ScriptedExtractor::failing("nbac"))
            .with("espn", ScriptedExtractor::failing("espn"))
    }

    async fn write_rows(scored: ScoredExtraction) -> Result<u64, String> {
        Ok(scored.extraction.row_count())
    }

    #[tokio::test]
    async fn test_processes_then_absorbs_duplicate() {
        let h = harness(ExhaustionPolicy::Fail);

        let outcome = h
            .runner
            .run("0022500301", TriggerMetadata::message("m-1"), &failing_nbac(), write_rows)
            .await
            .unwrap();
        match outcome {
            StageOutcome::Processed {
                status,
                quality,
                source_used,
                records_written,
                ..
            } => {
                assert_eq!(status, RunStatus::Success);
                assert_eq!(quality.score, 80);
                assert_eq!(source_used.as_deref(), Some("espn"));
                assert_eq!(records_written, 2);
            }
            other => panic!("expected Processed, got {other:?}"),
        }

        let again = h
            .runner
            .run("0022500301", TriggerMetadata::message("m-1"), &failing_nbac(), write_rows)
            .await
            .unwrap();
        assert!(matches!(again, StageOutcome::Duplicate(RunCheck::Completed { .. })));
        assert_eq!(h.log.records().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_fail_chain_records_failure_and_alerts() {
        let h = harness(ExhaustionPolicy::Fail);

        let err = h
            .runner
            .run("0022500301", TriggerMetadata::default(), &all_failing(), write_rows)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Resolve(ResolveError::ChainExhausted { .. })));

        let records = h.log.records();
        assert_eq!(records.last().unwrap().status, RunStatus::Failed);
        assert_eq!(h.sink.events()[0].category, "chain_exhausted");
    }

    #[tokio::test]
    async fn test_skip_completes_partial_without_writing() {
        let h = harness(ExhaustionPolicy::Skip);

        let outcome = h
            .runner
            .run("0022500301", TriggerMetadata::default(), &all_failing(), |_| async {
                Err::<u64, _>("writer must not be called")
            })
            .await
            .unwrap();

        assert!(matches!(outcome, StageOutcome::Skipped { ref issues, .. } if issues.len() == 2));
        assert_eq!(h.log.records().last().unwrap().status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_placeholder_is_partial_with_alert() {
        let h = harness(ExhaustionPolicy::Placeholder);

        let outcome = h
            .runner
            .run("0022500301", TriggerMetadata::default(), &all_failing(), write_rows)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StageOutcome::Processed { status: RunStatus::Partial, records_written: 1, .. }
        ));
        assert_eq!(h.sink.events()[0].category, "extraction_degraded");
    }

    #[tokio::test]
    async fn test_writer_failure_marks_run_failed_and_is_retryable() {
        let h = harness(ExhaustionPolicy::Fail);

        let err = h
            .runner
            .run("0022500301", TriggerMetadata::default(), &failing_nbac(), |_| async {
                Err::<u64, _>("warehouse unavailable")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Write(ref m) if m == "warehouse unavailable"));

        let retry = h
            .runner
            .run("0022500301", TriggerMetadata::default(), &failing_nbac(), write_rows)
            .await
            .unwrap();
        assert!(matches!(retry, StageOutcome::Processed { .. }));
    }

    #[tokio::test]
    async fn test_run_log_failure_aborts_before_resolving() {
        let (runner, sink) = harness_with_log(ExhaustionPolicy::Fail, Arc::new(BrokenRunLog));
        let calls = crate::resolver::mock::call_log();
        let extractors = ExtractorSet::new()
            .with("nbac", ScriptedExtractor::rows("nbac", json!([{}])).recording(&calls))
            .with("espn", ScriptedExtractor::failing("espn"));

        let err = runner
            .run("0022500301", TriggerMetadata::default(), &extractors, write_rows)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Tracker(TrackerError::AppendFailed { .. })));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(sink.events()[0].category, "run_log_unavailable");
    }

    #[tokio::test]
    async fn test_resolve_error_survives_failed_completion() {
        let (runner, _) =
            harness_with_log(ExhaustionPolicy::Fail, Arc::new(StartOnlyRunLog::default()));

        let err = runner
            .run("0022500301", TriggerMetadata::default(), &all_failing(), write_rows)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Resolve(ResolveError::ChainExhausted { .. })));
    }

    #[tokio::test]
    async fn test_write_error_survives_failed_completion() {
        let (runner, _) =
            harness_with_log(ExhaustionPolicy::Fail, Arc::new(StartOnlyRunLog::default()));

        let err = runner
            .run("0022500301", TriggerMetadata::default(), &failing_nbac(), |_| async {
                Err::<u64, _>("warehouse unavailable")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Write(ref m) if m == "warehouse unavailable"));
    }
}
