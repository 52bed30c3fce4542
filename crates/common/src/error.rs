//! Central error types for the pipeline (thiserror-based).

use thiserror::Error;

/// Frame pool errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Frame pool is closed")]
    Closed,
}

/// Encoder session errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Invalid or unsupported format parameters, surfaced from `configure`.
    #[error("Invalid encoder config: {0}")]
    InvalidConfig(String),

    /// Codec-internal fault reported by the hardware.
    #[error("Hardware codec error: {0}")]
    Hardware(String),

    /// Operation not legal in the session's current state.
    #[error("Cannot {op} while {state}")]
    IllegalState { op: &'static str, state: String },

    /// Operation on a released session.
    #[error("Encoder session is released")]
    Released,

    /// Operation not supported by this kind of session.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Frame pool error: {0}")]
    Pool(#[from] PoolError),
}

impl EncodeError {
    /// Hardware errors signalling the instance was already torn down.
    pub fn is_already_reset(&self) -> bool {
        matches!(self, Self::Hardware(reason) if reason.contains("already reset"))
    }
}

/// Output sink errors.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink is not open")]
    NotOpen,

    #[error("Sink is closed")]
    Closed,
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Convenience Result type for encoder operations.
pub type EncodeResult<T> = Result<T, EncodeError>;
