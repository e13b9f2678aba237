//! Error types for the exploration core
//!
//! Failure taxonomy:
//! - Input-bounded errors (unknown task/claim ids) surface as `ok=false`
//!   results at the action layer, never through this type.
//! - Transient external failures are logged and skipped by the callers.
//! - Rate-limit signals are control signals, not errors; only acquire
//!   timeouts reach this type.

use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Error types for exploration core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limit slot could not be acquired within the timeout
    #[error("failed to acquire rate limit slot for '{provider}' within {timeout_secs}s (effective_max_parallel={effective_max})")]
    RateLimitAcquireTimeout {
        provider: String,
        timeout_secs: u64,
        effective_max: usize,
    },

    /// Browser tab could not be acquired within the timeout
    #[error("failed to acquire tab within {timeout_secs}s (effective_max_tabs={effective_max})")]
    TabAcquireTimeout {
        timeout_secs: u64,
        effective_max: usize,
    },

    /// Tab pool has been closed
    #[error("tab pool is closed")]
    TabPoolClosed,

    /// A collaborator call failed
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for CoreError {
    fn from(error: anyhow::Error) -> Self {
        CoreError::Other(error.to_string())
    }
}

impl CoreError {
    /// Check if the error is transient: callers may retry or degrade the
    /// current unit of work rather than failing the whole pipeline.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimitAcquireTimeout { .. }
                | CoreError::TabAcquireTimeout { .. }
                | CoreError::Collaborator(_)
        )
    }
}
