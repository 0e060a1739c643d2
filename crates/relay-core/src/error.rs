//! Error taxonomy shared by every Relay component

use std::time::Duration;
use thiserror::Error;

/// Result type alias for Relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the resilience layer
#[derive(Error, Debug)]
pub enum RelayError {
    /// The circuit for this key is open; the call was rejected without running
    #[error("Circuit open for key '{key}'")]
    CircuitOpen { key: String },

    /// No pooled resource became available before the deadline
    #[error("Timed out after {timeout:?} waiting for a pooled resource")]
    AcquireTimeout { timeout: Duration },

    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded for '{identifier}', retry after {retry_after:?}")]
    RateLimited {
        identifier: String,
        retry_after: Duration,
    },

    /// Input or output contract violation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The operation failed on every attempt
    #[error("Execution failed after {attempts} attempt(s) in {elapsed:?}: {message}")]
    Execution {
        message: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// A pooled resource failed its validity check
    #[error("Resource {id} failed validation and was disposed")]
    ResourceInvalid { id: u64 },

    /// The pool has been closed
    #[error("Resource pool is closed")]
    PoolClosed,

    /// The resource factory could not build a new resource
    #[error("Failed to create resource: {0}")]
    ResourceCreation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Stable machine-readable code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            RelayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            RelayError::AcquireTimeout { .. } => "ACQUIRE_TIMEOUT",
            RelayError::RateLimited { .. } => "RATE_LIMITED",
            RelayError::Validation(_) => "VALIDATION_FAILED",
            RelayError::Execution { .. } => "EXECUTION_FAILED",
            RelayError::ResourceInvalid { .. } => "RESOURCE_INVALID",
            RelayError::PoolClosed => "POOL_CLOSED",
            RelayError::ResourceCreation(_) => "RESOURCE_CREATION_FAILED",
            RelayError::Configuration(_) => "CONFIGURATION_ERROR",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether a caller may reasonably try the same call again later.
    ///
    /// Circuit-open and validation failures are never retried by the
    /// dispatcher; this only describes what an outer caller could do.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::AcquireTimeout { .. }
            | RelayError::RateLimited { .. }
            | RelayError::Execution { .. }
            | RelayError::ResourceCreation(_) => true,
            RelayError::CircuitOpen { .. }
            | RelayError::Validation(_)
            | RelayError::ResourceInvalid { .. }
            | RelayError::PoolClosed
            | RelayError::Configuration(_)
            | RelayError::Serialization(_) => false,
        }
    }
}
