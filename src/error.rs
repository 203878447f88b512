//! Error types for low-precision transformations

use crate::config::ConfigError;
use thiserror::Error;

/// Result type for transformation operations
pub type Result<T> = std::result::Result<T, LptError>;

/// Errors raised while transforming a graph
///
/// Every variant except [`LptError::Subgraph`] aborts the whole run: the graph
/// is mutated in place and there is no rollback.
#[derive(Debug, Error)]
pub enum LptError {
    #[error("Unexpected {limit} values count {count} for {channels} channels in {node}")]
    LimitCardinality {
        node: String,
        limit: &'static str,
        count: usize,
        channels: usize,
    },

    #[error("Unexpected dimensions count {rank} in {node}")]
    UnexpectedRank { node: String, rank: usize },

    #[error("FakeQuantize transformation was not found")]
    MissingFakeQuantizeTransformation,

    #[error("Not possible to update precision for {0}: operation does not support precision override")]
    PrecisionOverrideUnsupported(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Dequantization values are not found for {0}")]
    DequantizationNotFound(String),

    #[error("Unexpected operation: {0}")]
    UnexpectedOperation(String),

    /// Structural failure while collecting a concat subgraph; callers skip the match.
    #[error("Subgraph discovery failed: {0}")]
    Subgraph(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl LptError {
    /// Whether the error only aborts the current transformation invocation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LptError::Subgraph(_))
    }
}

impl From<anyhow::Error> for LptError {
    fn from(err: anyhow::Error) -> Self {
        LptError::Graph(err.to_string())
    }
}
