//! Quality Scorer
//!
//! Pure mapping from an [`ExtractionResult`] to a [`QualityScore`].
//!
//! # Scoring Algorithm
//! - **Base score**:
//!   - Resolved: catalog weight of the source used
//!   - Placeholder: `scoring.placeholder_baseline`
//!   - Degraded: `scoring.degraded_baseline` minus the chain penalty,
//!     whichever source (if any) supplied the partial data
//!   - Skipped: 0
//! - **Issue penalties**: each entry of `current_issues` costs its configured
//!   penalty (`scoring.issue_penalties[code]`, else `default_issue_penalty`).
//!   Failures of earlier, unused sources are never charged.
//! - Result clipped to [0, 100], then mapped to a tier by fixed thresholds.

use crate::catalog::SourceCatalog;
use crate::types::{ExtractionOutcome, ExtractionResult, QualityScore};
use statline_common::config::ScoringConfig;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct QualityScorer {
    config: ScoringConfig,
}

impl QualityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score one extraction result
    ///
    /// Has no side effects beyond a debug log; identical input always gives
    /// identical output.
    pub fn score(&self, extraction: &ExtractionResult, catalog: &SourceCatalog) -> QualityScore {
        let base = self.base_score(&extraction.outcome, catalog);

        let mut charged_issues = Vec::with_capacity(extraction.current_issues.len());
        let mut total_penalty: i32 = 0;
        if !matches!(extraction.outcome, ExtractionOutcome::Skipped) {
            for issue in &extraction.current_issues {
                let penalty = self.config.penalty_for(issue);
                total_penalty += i32::from(penalty);
                charged_issues.push((issue.clone(), penalty));
            }
        }

        let score = (base - total_penalty).clamp(0, 100) as u8;
        let quality = QualityScore::from_score(score, charged_issues);

        debug!(
            chain = %extraction.chain,
            data_unit_key = %extraction.data_unit_key,
            base,
            total_penalty,
            score = quality.score,
            tier = %quality.tier,
            "Quality scored"
        );

        quality
    }

    fn base_score(&self, outcome: &ExtractionOutcome, catalog: &SourceCatalog) -> i32 {
        match outcome {
            ExtractionOutcome::Resolved { source, weight } => {
                i32::from(catalog.weight(source).unwrap_or(*weight))
            }
            ExtractionOutcome::Placeholder => i32::from(self.config.placeholder_baseline),
            ExtractionOutcome::Degraded { penalty, .. } => {
                i32::from(self.config.degraded_baseline) - i32::from(*penalty)
            }
            ExtractionOutcome::Skipped => 0,
        }
    }
}
