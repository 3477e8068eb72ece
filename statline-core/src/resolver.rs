//! Fallback Chain Resolver
//!
//! Tries the sources of a named chain strictly in declared order and stops at
//! the first usable result. Every source that was passed over is documented
//! in `quality_issues`, so a result from a lower-ranked source still says why
//! the higher-ranked ones were skipped.
//!
//! # Soft failures
//! An extractor error, an empty payload and an extractor timeout are all soft
//! failures: the resolver records them and advances to the next source. It
//! never retries an individual extractor.
//!
//! # Exhaustion
//! When every source fails, the chain's [`ExhaustionPolicy`] decides:
//! - `skip`: `Skipped` result, no payload
//! - `fail`: [`ResolveError::ChainExhausted`]
//! - `placeholder`: minimal synthesized record
//! - `continue_with_penalty`: last attempt's partial data (or empty), degraded

use crate::catalog::SourceCatalog;
use crate::error::ResolveError;
use crate::scorer::QualityScorer;
use crate::types::{
    ExtractionContext, ExtractionOutcome, ExtractionResult, ExtractorError, FailureReason,
    QualityScore, SourceData, SourceExtractor, SourceFailure,
};
use serde_json::{json, Value};
use statline_common::config::{ExhaustionPolicy, ResolverConfig, StatlineConfig};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Extractor Set
// ============================================================================

/// Source id → extraction callable, supplied per resolution call
#[derive(Clone, Default)]
pub struct ExtractorSet {
    extractors: HashMap<String, Arc<dyn SourceExtractor>>,
}

impl ExtractorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, source_id: impl Into<String>, extractor: impl SourceExtractor + 'static) -> Self {
        self.insert(source_id, Arc::new(extractor));
        self
    }

    pub fn insert(&mut self, source_id: impl Into<String>, extractor: Arc<dyn SourceExtractor>) {
        self.extractors.insert(source_id.into(), extractor);
    }

    pub fn get(&self, source_id: &str) -> Option<&Arc<dyn SourceExtractor>> {
        self.extractors.get(source_id)
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.extractors.contains_key(source_id)
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl std::fmt::Debug for ExtractorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.extractors.keys().collect();
        ids.sort();
        f.debug_struct("ExtractorSet").field("sources", &ids).finish()
    }
}

/// Closure-backed extractor, see [`extractor_fn`]
pub struct FnExtractor<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> SourceExtractor for FnExtractor<F>
where
    F: Fn(ExtractionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SourceData, ExtractorError>> + Send + 'static,
{
    async fn extract(&self, ctx: &ExtractionContext) -> Result<SourceData, ExtractorError> {
        (self.f)(ctx.clone()).await
    }
}

/// Wrap an async closure as a [`SourceExtractor`]
///
/// ```rust,ignore
/// let extractors = ExtractorSet::new()
///     .with("nbac", extractor_fn(|ctx| async move { fetch_nbac(&ctx.data_unit_key).await }));
/// ```
pub fn extractor_fn<F, Fut>(f: F) -> FnExtractor<F>
where
    F: Fn(ExtractionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SourceData, ExtractorError>> + Send + 'static,
{
    FnExtractor { f }
}

// ============================================================================
// Resolver
// ============================================================================

/// Extraction result together with its quality annotation
#[derive(Debug, Clone)]
pub struct ScoredExtraction {
    pub extraction: ExtractionResult,
    pub quality: QualityScore,
}

/// Stateless across calls; safe to share between workers behind an `Arc`
#[derive(Debug, Clone)]
pub struct FallbackChainResolver {
    catalog: Arc<SourceCatalog>,
    scorer: QualityScorer,
    config: ResolverConfig,
}

impl FallbackChainResolver {
    pub fn new(catalog: Arc<SourceCatalog>, scorer: QualityScorer, config: ResolverConfig) -> Self {
        Self {
            catalog,
            scorer,
            config,
        }
    }

    pub fn from_config(config: &StatlineConfig) -> statline_common::Result<Self> {
        let catalog = Arc::new(SourceCatalog::from_config(config)?);
        Ok(Self::new(
            catalog,
            QualityScorer::new(config.scoring.clone()),
            config.resolver.clone(),
        ))
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    pub fn scorer(&self) -> &QualityScorer {
        &self.scorer
    }

    /// Per-source override, else the resolver-wide timeout
    fn timeout_for(&self, source_id: &str) -> Duration {
        self.catalog
            .source(source_id)
            .and_then(|s| s.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.extractor_timeout())
    }

    /// Resolve `chain_name` for the data unit in `ctx`
    pub async fn resolve(
        &self,
        chain_name: &str,
        extractors: &ExtractorSet,
        ctx: &ExtractionContext,
    ) -> Result<ExtractionResult, ResolveError> {
        let chain = self
            .catalog
            .chain(chain_name)
            .ok_or_else(|| ResolveError::UnknownChain(chain_name.to_string()))?;

        // Fail fast: a missing extractor is a configuration error
        if let Some(missing) = chain.sources.iter().find(|id| !extractors.contains(id)) {
            return Err(ResolveError::MissingExtractor {
                chain: chain.name.clone(),
                source_id: missing.clone(),
            });
        }

        let mut attempted = Vec::with_capacity(chain.sources.len());
        let mut failures: Vec<SourceFailure> = Vec::new();
        let mut quality_issues: Vec<String> = Vec::new();
        let mut last_attempt: Option<(String, SourceData)> = None;

        for source_id in &chain.sources {
            let extractor = extractors
                .get(source_id)
                .ok_or_else(|| ResolveError::MissingExtractor {
                    chain: chain.name.clone(),
                    source_id: source_id.clone(),
                })?;
            let timeout = self.timeout_for(source_id);
            attempted.push(source_id.clone());

            debug!(
                chain = %chain.name,
                source = %source_id,
                data_unit_key = %ctx.data_unit_key,
                timeout_ms = timeout.as_millis() as u64,
                "Attempting source"
            );

            let reason = match tokio::time::timeout(timeout, extractor.extract(ctx)).await {
                Ok(Ok(data)) if data.is_usable() => {
                    let weight = self.catalog.weight(source_id).unwrap_or(0);
                    let current_issues = data.issues.clone();
                    quality_issues.extend(data.issues);

                    debug!(
                        chain = %chain.name,
                        source = %source_id,
                        data_unit_key = %ctx.data_unit_key,
                        skipped = failures.len(),
                        "Chain resolved"
                    );

                    return Ok(ExtractionResult {
                        chain: chain.name.clone(),
                        data_unit_key: ctx.data_unit_key.clone(),
                        outcome: ExtractionOutcome::Resolved {
                            source: source_id.clone(),
                            weight,
                        },
                        payload: data.payload,
                        attempted,
                        failures,
                        quality_issues,
                        current_issues,
                    });
                }
                Ok(Ok(data)) => {
                    last_attempt = Some((source_id.clone(), data));
                    FailureReason::NoData
                }
                Ok(Err(e)) => {
                    last_attempt = None;
                    FailureReason::Error {
                        message: e.to_string(),
                    }
                }
                Err(_) => {
                    last_attempt = None;
                    FailureReason::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    }
                }
            };

            if matches!(reason, FailureReason::Timeout { .. }) {
                warn!(
                    chain = %chain.name,
                    source = %source_id,
                    data_unit_key = %ctx.data_unit_key,
                    "Extractor timed out, advancing to next source"
                );
            } else {
                debug!(
                    chain = %chain.name,
                    source = %source_id,
                    data_unit_key = %ctx.data_unit_key,
                    reason = %reason,
                    "Source failed, advancing to next source"
                );
            }

            let failure = SourceFailure {
                source: source_id.clone(),
                reason,
            };
            quality_issues.push(failure.as_issue());
            failures.push(failure);
        }

        // Every source failed
        let base = ExtractionResult {
            chain: chain.name.clone(),
            data_unit_key: ctx.data_unit_key.clone(),
            outcome: ExtractionOutcome::Skipped,
            payload: Value::Null,
            attempted,
            failures,
            quality_issues,
            current_issues: Vec::new(),
        };

        match chain.exhaustion {
            ExhaustionPolicy::Skip => {
                info!(
                    chain = %chain.name,
                    data_unit_key = %ctx.data_unit_key,
                    "Chain exhausted, skipping data unit"
                );
                Ok(base)
            }
            ExhaustionPolicy::Fail => {
                warn!(
                    chain = %chain.name,
                    data_unit_key = %ctx.data_unit_key,
                    issues = ?base.quality_issues,
                    "Chain exhausted"
                );
                Err(ResolveError::ChainExhausted {
                    chain: base.chain,
                    data_unit_key: base.data_unit_key,
                    issues: base.quality_issues,
                })
            }
            ExhaustionPolicy::Placeholder => {
                info!(
                    chain = %chain.name,
                    data_unit_key = %ctx.data_unit_key,
                    "Chain exhausted, emitting placeholder"
                );
                Ok(ExtractionResult {
                    outcome: ExtractionOutcome::Placeholder,
                    payload: json!({
                        "placeholder": true,
                        "chain": chain.name,
                        "data_unit_key": ctx.data_unit_key,
                    }),
                    ..base
                })
            }
            ExhaustionPolicy::ContinueWithPenalty { penalty } => {
                let mut result = base;
                let partial_source = match last_attempt {
                    Some((source_id, data)) if data.has_payload() => {
                        result.payload = data.payload;
                        result.current_issues = data.issues.clone();
                        result.quality_issues.extend(data.issues);
                        Some(source_id)
                    }
                    _ => None,
                };

                info!(
                    chain = %chain.name,
                    data_unit_key = %ctx.data_unit_key,
                    penalty,
                    partial_source = ?partial_source,
                    "Chain exhausted, continuing with degraded data"
                );

                result.outcome = ExtractionOutcome::Degraded {
                    penalty,
                    partial_source,
                };
                Ok(result)
            }
        }
    }

    /// [`resolve`](Self::resolve) plus quality annotation
    pub async fn resolve_scored(
        &self,
        chain_name: &str,
        extractors: &ExtractorSet,
        ctx: &ExtractionContext,
    ) -> Result<ScoredExtraction, ResolveError> {
        let extraction = self.resolve(chain_name, extractors, ctx).await?;
        let quality = self.scorer.score(&extraction, &self.catalog);
        Ok(ScoredExtraction {
            extraction,
            quality,
        })
    }
}

// ============================================================================
// Scripted extractors for tests and dry runs
// ============================================================================

pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Shared record of which sources were called, in call order
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub fn call_log() -> CallLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[derive(Debug, Clone)]
    pub enum Behavior {
        /// Usable rows plus the given issues
        Rows { payload: Value, issues: Vec<String> },
        /// Nothing for this data unit
        Empty,
        /// Some data, but flagged unusable
        Partial(Value),
        /// Extractor error
        Fail(String),
        /// Sleeps far past any sane timeout
        Hang,
    }

    pub struct ScriptedExtractor {
        pub source_id: String,
        pub behavior: Behavior,
        pub calls: Option<CallLog>,
    }

    impl ScriptedExtractor {
        pub fn new(source_id: &str, behavior: Behavior) -> Self {
            Self {
                source_id: source_id.to_string(),
                behavior,
                calls: None,
            }
        }

        pub fn rows(source_id: &str, payload: Value) -> Self {
            Self::new(
                source_id,
                Behavior::Rows {
                    payload,
                    issues: vec![],
                },
            )
        }

        pub fn failing(source_id: &str) -> Self {
            Self::new(source_id, Behavior::Fail(format!("{} unavailable", source_id)))
        }

        pub fn recording(mut self, calls: &CallLog) -> Self {
            self.calls = Some(Arc::clone(calls));
            self
        }
    }

    #[async_trait::async_trait]
    impl SourceExtractor for ScriptedExtractor {
        async fn extract(&self, _ctx: &ExtractionContext) -> Result<SourceData, ExtractorError> {
            if let Some(calls) = &self.calls {
                if let Ok(mut calls) = calls.lock() {
                    calls.push(self.source_id.clone());
                }
            }

            match &self.behavior {
                Behavior::Rows { payload, issues } => Ok(SourceData {
                    payload: payload.clone(),
                    success: true,
                    issues: issues.clone(),
                }),
                Behavior::Empty => Ok(SourceData::empty()),
                Behavior::Partial(payload) => Ok(SourceData::partial(payload.clone())),
                Behavior::Fail(message) => Err(ExtractorError::Network(message.clone())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(SourceData::empty())
                }
            }
        }
    }
}
