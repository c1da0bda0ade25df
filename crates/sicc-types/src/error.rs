//! Shared error types for the SICC core.

use crate::learning::ReviewFailure;
use thiserror::Error;

/// Top-level error type for the SICC core.
#[derive(Error, Debug)]
pub enum SiccError {
    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity (memory chunk, pattern, learning, ...).
        entity: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// A write would violate a data-model invariant. Rejected before any write.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Duplicate key or a state transition that is not allowed.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The agent's soft memory quota was hit. Informational; the write succeeded.
    #[error("Memory quota exceeded for agent {agent_id}: {active} active chunks (quota {quota})")]
    QuotaSoft {
        /// The agent over quota.
        agent_id: String,
        /// Active chunk count after the write.
        active: u64,
        /// Configured quota.
        quota: u64,
    },

    /// The embedding model or the durable store is unreachable.
    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    /// An approval or rejection could not go through.
    #[error("Review failed: {0}")]
    ReviewFailed(ReviewFailure),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A SQLite / storage error occurred.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SiccError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable snake_case label of the error kind, used in API payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::QuotaSoft { .. } => "quota_soft",
            Self::Upstream(_) | Self::Storage(_) => "upstream",
            Self::Cancelled => "cancelled",
            Self::ReviewFailed(ReviewFailure::NotFound) => "not_found",
            Self::ReviewFailed(ReviewFailure::Upstream) => "upstream",
            Self::ReviewFailed(_) => "conflict",
            Self::Serialization(_) | Self::Config(_) | Self::Internal(_) => "internal",
        }
    }

    /// True when a hot read path should degrade instead of failing.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Storage(_))
    }
}

impl From<serde_json::Error> for SiccError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Alias for Result with SiccError.
pub type SiccResult<T> = Result<T, SiccError>;
