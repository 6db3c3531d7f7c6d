//! Error types for sharded kNN search

use crate::distance::DistanceType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KnnError>;

#[derive(Error, Debug)]
pub enum KnnError {
    #[error("Unsupported metric: {0:?} (only L2Unexpanded and L2SqrtUnexpanded are supported)")]
    UnsupportedMetric(DistanceType),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid memory for shard {shard}: {reason}")]
    InvalidShardMemory { shard: usize, reason: String },

    #[error("Search primitive failed on shard {shard}: {reason}")]
    PrimitiveFailure { shard: usize, reason: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl KnnError {
    /// Per-shard errors are isolated by the dispatcher; everything else aborts the call.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KnnError::InvalidShardMemory { .. }
                | KnnError::PrimitiveFailure { .. }
                | KnnError::ResourceExhausted(_)
        )
    }
}

impl From<serde_json::Error> for KnnError {
    fn from(err: serde_json::Error) -> Self {
        KnnError::Config(err.to_string())
    }
}

impl From<std::io::Error> for KnnError {
    fn from(err: std::io::Error) -> Self {
        KnnError::Config(err.to_string())
    }
}
