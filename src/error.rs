//! Error types for the Tiergate rate limiter.

use thiserror::Error;

/// Main error type for Tiergate operations.
///
/// "Over limit" is never an error: the evaluator reports it through a
/// [`Decision`](crate::ratelimit::Decision). Only invalid input,
/// infrastructure faults and bad configuration use this type.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// An identifier or action could not be turned into a counter key
    #[error("Invalid key input: {0}")]
    InvalidKeyInput(String),

    /// The counter store could not answer within its timeout
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid rule definitions or service settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Redis protocol or connection errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error means the counting infrastructure could not be reached.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, LimiterError::StoreUnavailable(_) | LimiterError::Redis(_))
    }
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Configuration(err.to_string())
    }
}

/// Result type alias for Tiergate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
