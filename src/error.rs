//! Error types for the Leela Zero trainer.

use thiserror::Error;

/// Result type for trainer operations.
pub type LeelazResult<T> = Result<T, LeelazError>;

/// Errors that can occur while building, training or exporting the network.
///
/// None of these are retried: the trainer is an offline batch job and every
/// variant aborts the run when it reaches the top level.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeelazError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch between a batch (or layer) and the network contract
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Checkpoint metadata (de)serialization failed
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A registry entry points at a normalization stage that does not exist
    #[error("Unresolved statistics reference: {0}")]
    UnresolvedReference(String),

    /// A registry entry has a rank the weights format cannot express
    #[error("Unsupported tensor rank {rank} for {role}")]
    UnsupportedRank { rank: usize, role: String },

    /// Missing or corrupt checkpoint
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Batch producer error
    #[error("Data error: {0}")]
    Data(String),
}

impl LeelazError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}
