//! Error type for the contrastive objective.
//!
//! # Error Categories
//!
//! | Category | Variants | Remedy |
//! |----------|----------|--------|
//! | Configuration | UnsupportedConfig, ConfigError | Fix configuration |
//! | Validation | InvalidInput, DimensionMismatch | Fix caller input |
//! | Computation | TensorError | Inspect the wrapped candle error |
//! | Distributed | Collective | Fix process group wiring |
//! | Infrastructure | IoError | Fix file paths / permissions |
//!
//! Nothing in this crate retries. Every failure is either a caller contract
//! violation or a configuration mistake.

use thiserror::Error;

/// Every failure the contrastive objective can report.
#[derive(Debug, Error)]
pub enum RankCseError {
    // === Configuration Errors ===
    /// A selector (pooler type, combination policy, metric) or a combination
    /// of options that this objective does not implement.
    #[error("Unsupported configuration: {message}")]
    UnsupportedConfig { message: String },

    /// Configuration file unreadable, unparsable, or out of range.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    // === Validation Errors ===
    /// Input tensor has the wrong rank, view count, or is missing entirely.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Two inputs that must agree on a dimension do not.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    // === Computation Errors ===
    /// Wrapped tensor backend failure.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    // === Distributed Errors ===
    /// Collective gather violated its protocol (shard count, poisoned group).
    #[error("Collective error: {message}")]
    Collective { message: String },

    // === Infrastructure Errors ===
    /// File I/O error (config files).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result alias for every fallible operation in this crate.
pub type RankCseResult<T> = Result<T, RankCseError>;

impl RankCseError {
    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedConfig {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Wrap a candle error with the operation that produced it.
    pub(crate) fn tensor(context: &str, e: candle_core::Error) -> Self {
        Self::TensorError {
            message: format!("{}: {}", context, e),
        }
    }

    /// Whether this error stems from configuration rather than input data.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedConfig { .. } | Self::ConfigError { .. }
        )
    }
}
