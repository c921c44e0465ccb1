//! Crate-wide error type.
//!
//! Mirrors the error-kind taxonomy in the coordinator design: transient
//! worker errors and validation errors are recoverable and handled by the
//! caller; round failures halt only the current round; configuration and
//! invariant errors are fatal.

use thiserror::Error;

/// Result alias used throughout the library surface.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    /// A single worker's interaction failed; the round proceeds without it.
    #[error("transient worker error ({worker}): {reason}")]
    Transient { worker: String, reason: String },

    /// A gradient submission failed validation (NaN/Inf, shape mismatch,
    /// duplicate, or unexpected worker).
    #[error("validation error: {0}")]
    Validation(String),

    /// A round could not produce a valid aggregate.
    #[error("round failure: {0}")]
    RoundFailure(String),

    /// Inconsistent configuration detected at startup or reload.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The checkpoint or contribution/reward sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// A validation predicate caught an impossible internal state.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Sink(format!("serialization: {err}"))
    }
}

impl From<toml::de::Error> for CoordinatorError {
    fn from(err: toml::de::Error) -> Self {
        CoordinatorError::Configuration(err.to_string())
    }
}

impl From<bincode::Error> for CoordinatorError {
    fn from(err: bincode::Error) -> Self {
        CoordinatorError::Sink(format!("serialization: {err}"))
    }
}
