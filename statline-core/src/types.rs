//! Core Types and Trait Definitions
//!
//! Types shared by the resolver, scorer and stage runner:
//! - [`SourceExtractor`]: per-source extraction callable
//! - [`ExtractionResult`]: outcome of resolving one chain for one data unit
//! - [`QualityScore`] / [`QualityTier`]: derived quality of a result

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// Extraction Inputs
// ============================================================================

/// Context handed to every extractor of one resolution call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionContext {
    /// Data unit being resolved (game id, game date, ...)
    pub data_unit_key: String,
    /// Processor on whose behalf the resolution runs
    pub processor: Option<String>,
    /// Opaque extractor parameters (season, team code, ...)
    pub params: BTreeMap<String, String>,
}

impl ExtractionContext {
    pub fn new(data_unit_key: impl Into<String>) -> Self {
        Self {
            data_unit_key: data_unit_key.into(),
            ..Default::default()
        }
    }

    pub fn with_processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = Some(processor.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// What one extractor returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceData {
    /// Rows or record for the data unit
    pub payload: Value,
    /// Extractor's own verdict on whether this is usable data
    pub success: bool,
    /// Quality issues observed in this data (`code` or `code:detail`)
    pub issues: Vec<String>,
}

impl SourceData {
    /// Successful extraction without issues
    pub fn rows(payload: Value) -> Self {
        Self {
            payload,
            success: true,
            issues: Vec::new(),
        }
    }

    /// Extractor ran but had nothing for this data unit
    pub fn empty() -> Self {
        Self {
            payload: Value::Null,
            success: false,
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    /// Partial data: something came back but the extractor flags it unusable
    pub fn partial(payload: Value) -> Self {
        Self {
            payload,
            success: false,
            issues: Vec::new(),
        }
    }

    /// True when the payload carries anything at all
    pub fn has_payload(&self) -> bool {
        match &self.payload {
            Value::Null => false,
            Value::Array(rows) => !rows.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Counts as a successful extraction for chain resolution
    pub fn is_usable(&self) -> bool {
        self.success && self.has_payload()
    }
}

/// Extractor error
///
/// Always a soft failure from the resolver's point of view; retry policy
/// belongs to the extractor.
#[derive(Debug, Error)]
pub enum ExtractorError {
    /// Upstream could not be reached or answered with an error
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream answered but the response could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Upstream does not have this data unit (yet)
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Per-source extraction callable
///
/// # Example
/// ```rust,ignore
/// use statline_core::types::{ExtractionContext, SourceData, SourceExtractor, ExtractorError};
///
/// struct NbacBoxscores { client: reqwest::Client }
///
/// #[async_trait::async_trait]
/// impl SourceExtractor for NbacBoxscores {
///     async fn extract(&self, ctx: &ExtractionContext) -> Result<SourceData, ExtractorError> {
///         let rows = fetch_boxscores(&self.client, &ctx.data_unit_key).await?;
///         Ok(SourceData::rows(rows))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait SourceExtractor: Send + Sync {
    async fn extract(&self, ctx: &ExtractionContext) -> Result<SourceData, ExtractorError>;
}

// ============================================================================
// Resolution Output
// ============================================================================

/// Why a source was passed over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Error { message: String },
    NoData,
    Timeout { after_ms: u64 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Error { message } => write!(f, "error: {}", message),
            FailureReason::NoData => write!(f, "no data"),
            FailureReason::Timeout { after_ms } => write!(f, "timed out after {} ms", after_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: FailureReason,
}

impl SourceFailure {
    /// Issue string recorded in `quality_issues`
    pub fn as_issue(&self) -> String {
        format!("source_failed:{}:{}", self.source, self.reason)
    }
}

/// Exactly one of these holds for every returned result; a hard failure is
/// the `Err` arm of the resolver instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    /// A source in the chain produced usable data
    Resolved { source: String, weight: u8 },
    /// All sources failed, policy `skip`
    Skipped,
    /// All sources failed, policy `placeholder`
    Placeholder,
    /// All sources failed, policy `continue_with_penalty`
    Degraded {
        penalty: u8,
        /// Last attempted source, when it returned partial data
        partial_source: Option<String>,
    },
}

/// Outcome of resolving one chain for one data unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub chain: String,
    pub data_unit_key: String,
    pub outcome: ExtractionOutcome,
    pub payload: Value,
    /// Sources tried, in order
    pub attempted: Vec<String>,
    pub failures: Vec<SourceFailure>,
    /// Every issue in order: skipped sources first, then the used data's own issues
    pub quality_issues: Vec<String>,
    /// Issues reported by the data actually used; the only ones that cost score
    pub current_issues: Vec<String>,
}

impl ExtractionResult {
    pub fn source_used(&self) -> Option<&str> {
        match &self.outcome {
            ExtractionOutcome::Resolved { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, ExtractionOutcome::Resolved { .. })
    }

    pub fn should_skip(&self) -> bool {
        matches!(self.outcome, ExtractionOutcome::Skipped)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.outcome, ExtractionOutcome::Placeholder)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, ExtractionOutcome::Degraded { .. })
    }

    /// Rows carried by the payload (objects count as one row)
    pub fn row_count(&self) -> u64 {
        match &self.payload {
            Value::Null => 0,
            Value::Array(rows) => rows.len() as u64,
            _ => 1,
        }
    }
}

// ============================================================================
// Quality
// ============================================================================

/// Discrete quality bucket derived from a numeric score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Unusable,
    Poor,
    Bronze,
    Silver,
    Gold,
}

impl QualityTier {
    /// Fixed thresholds, inclusive lower bound
    pub fn from_score(score: u8) -> Self {
        match score {
            95..=u8::MAX => QualityTier::Gold,
            75..=94 => QualityTier::Silver,
            50..=74 => QualityTier::Bronze,
            25..=49 => QualityTier::Poor,
            _ => QualityTier::Unusable,
        }
    }

    /// Maximum confidence (percent) downstream predictions may claim
    pub fn confidence_cap(&self) -> u8 {
        match self {
            QualityTier::Gold => 100,
            QualityTier::Silver => 95,
            QualityTier::Bronze => 80,
            QualityTier::Poor => 60,
            QualityTier::Unusable => 0,
        }
    }

    pub fn prediction_eligible(&self) -> bool {
        !matches!(self, QualityTier::Unusable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Gold => "gold",
            QualityTier::Silver => "silver",
            QualityTier::Bronze => "bronze",
            QualityTier::Poor => "poor",
            QualityTier::Unusable => "unusable",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Derived quality of an [`ExtractionResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityScore {
    /// 0-100
    pub score: u8,
    pub tier: QualityTier,
    /// Percentage
    pub confidence_cap: u8,
    pub prediction_eligible: bool,
    /// Issues that reduced the score, with the penalty each cost
    pub charged_issues: Vec<(String, u8)>,
}

impl QualityScore {
    pub fn from_score(score: u8, charged_issues: Vec<(String, u8)>) -> Self {
        let score = score.min(100);
        let tier = QualityTier::from_score(score);
        Self {
            score,
            tier,
            confidence_cap: tier.confidence_cap(),
            prediction_eligible: tier.prediction_eligible(),
            charged_issues,
        }
    }
}
