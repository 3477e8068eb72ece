//! # Statline pipeline core
//!
//! Fallback resolution, quality scoring and idempotent run tracking for a
//! sports-analytics pipeline.
//!
//! **Components:**
//! - [`catalog::SourceCatalog`]: sources, weights and fallback chains
//! - [`scorer::QualityScorer`]: extraction outcome → score, tier, eligibility
//! - [`resolver::FallbackChainResolver`]: tries a chain's sources in order
//! - [`tracker::RunTracker`]: deduplication over an append-only run log
//! - [`alerts::AlertAggregator`]: rate-limited, batched notifications
//! - [`processor::StageRunner`]: one pipeline stage composed from the above

pub mod alerts;
pub mod catalog;
pub mod error;
pub mod processor;
pub mod resolver;
pub mod scorer;
pub mod tracker;
pub mod types;

pub use alerts::{AlertAggregator, AlertDisposition, AlertEvent};
pub use catalog::SourceCatalog;
pub use error::{AlertError, ResolveError, StageError, TrackerError};
pub use processor::{StageDefinition, StageOutcome, StageRunner};
pub use resolver::{extractor_fn, ExtractorSet, FallbackChainResolver, ScoredExtraction};
pub use scorer::QualityScorer;
pub use tracker::{RunCheck, RunStatus, RunTracker, StartOutcome, TriggerMetadata};
pub use types::{ExtractionContext, ExtractionResult, QualityScore, QualityTier, SourceData};
