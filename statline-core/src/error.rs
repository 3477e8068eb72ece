//! Error types for the pipeline core
//!
//! One enum per component. Soft failures (an extractor erroring, a source
//! timing out) never surface here; they are recorded on the result instead.

use thiserror::Error;

/// Hard failures of chain resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    /// Configuration error, raised before any source is attempted
    #[error("Chain '{chain}' has no extractor for source '{source_id}'")]
    MissingExtractor { chain: String, source_id: String },

    /// Every source failed and the chain's policy is `fail`
    #[error("Chain '{chain}' exhausted for '{data_unit_key}': {issues:?}")]
    ChainExhausted {
        chain: String,
        data_unit_key: String,
        issues: Vec<String>,
    },
}

impl ResolveError {
    /// True for errors caused by the configuration rather than the data
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ResolveError::UnknownChain(_) | ResolveError::MissingExtractor { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    /// The `running` record could not be persisted; the attempt must not proceed
    #[error("Run log append failed for {processor}/{data_unit_key}: {source}")]
    AppendFailed {
        processor: String,
        data_unit_key: String,
        #[source]
        source: statline_common::Error,
    },

    #[error("Run log query failed: {0}")]
    QueryFailed(#[source] statline_common::Error),

    #[error("Status '{0}' is not terminal")]
    NonTerminalStatus(String),

    #[error("Run log error: {0}")]
    Log(#[from] statline_common::Error),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Delivery via '{sink}' failed: {message}")]
    DeliveryFailed { sink: String, message: String },

    #[error("Could not set up '{sink}' sink: {message}")]
    SinkSetup { sink: String, message: String },
}

/// Failure of one pipeline-stage invocation
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Downstream write failed: {0}")]
    Write(String),
}
