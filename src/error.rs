//! Error types for the control plane

use thiserror::Error;

/// Result type for control-plane operations
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors that can occur anywhere in the control plane
#[derive(Error, Debug)]
pub enum GovernorError {
    /// Metrics aggregator error
    #[error("aggregator error: {0}")]
    Aggregator(String),

    /// Intelligent cache error
    #[error("cache error: {0}")]
    Cache(String),

    /// Correlation engine error
    #[error("correlation error: {0}")]
    Correlation(String),

    /// Predictor error
    #[error("predictor error: {0}")]
    Predictor(String),

    /// Burn-rate governor error
    #[error("governor error: {0}")]
    Governor(String),

    /// Degradation ladder error
    #[error("ladder error: {0}")]
    Ladder(String),

    /// Adaptive scaler error
    #[error("scaler error: {0}")]
    Scaler(String),

    /// Dashboard stream error
    #[error("dashboard error: {0}")]
    Dashboard(String),

    /// Event bus error
    #[error("bus error: {0}")]
    Bus(String),

    /// Expression language parse/eval error
    #[error("expression error: {0}")]
    Expression(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation / bad input (never mutates state)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invariant violation — fatal, the owning ticker halts
    #[error("invariant violation in {component}: {detail}")]
    InvariantViolation {
        /// Component that detected the violation
        component: String,
        /// Description of what invariant was broken
        detail: String,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error, used at the binary boundary
    #[error("control plane error: {0}")]
    Other(#[from] anyhow::Error),
}

impl GovernorError {
    /// True for capacity/contention failures that are handled locally
    /// (eviction, rotation, skipping an action) rather than propagated.
    pub fn is_capacity(&self) -> bool {
        matches!(self, GovernorError::Cache(_))
    }
}
