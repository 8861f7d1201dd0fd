//! Error taxonomy and exit codes shared by every component

use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by coordination operations.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Network/busy errors from the document or lock store that survived
    /// local retries.
    #[error("Transient store error: {0}")]
    TransientStore(#[source] StorageError),

    #[error("Store error: {0}")]
    Storage(#[source] StorageError),

    /// The optimistic transaction lost every race it entered. The outcome is
    /// unknown; retrying the (idempotent) operation is always safe.
    #[error("Conflict retries exhausted for {namespace}/{key} after {attempts} attempts")]
    ConflictExhausted {
        namespace: String,
        key: String,
        attempts: u32,
    },

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// A batch is already active and incomplete on this coordinator.
    #[error("Batch {batch_key} is still active ({completed}/{expected} completed)")]
    BatchConflict {
        batch_key: String,
        completed: usize,
        expected: usize,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Handoff blocked for {batch_key}: {}", .issues.join("; "))]
    ValidationBlocked {
        batch_key: String,
        issues: Vec<String>,
    },

    #[error("Timeout detected for: {}", .entities.join(", "))]
    TimeoutDetected { entities: Vec<String> },

    #[error("Max retries exceeded for {item_id} ({check_count}/{max_checks} checks): {last_error}")]
    MaxRetriesExceeded {
        item_id: String,
        check_count: u32,
        max_checks: u32,
        last_error: String,
    },

    /// A collaborator outside this crate (readiness check, re-run step,
    /// data source) failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for CoordinationError {
    fn from(e: StorageError) -> Self {
        if e.is_transient() {
            Self::TransientStore(e)
        } else {
            Self::Storage(e)
        }
    }
}

impl CoordinationError {
    /// Whether the caller can simply retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::ConflictExhausted { .. })
    }

    /// Status code used when the error answers an inbound request.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BatchNotFound(_) => 404,
            Self::BatchConflict { .. } => 409,
            Self::InvalidInput(_) => 400,
            Self::ValidationBlocked { .. } => 422,
            Self::TransientStore(_) | Self::ConflictExhausted { .. } => 503,
            _ => 500,
        }
    }
}

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Process exit status used by every monitoring entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitStatus {
    Healthy = 0,
    Warning = 1,
    Critical = 2,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: ExitStatus) -> ExitStatus {
        self.max(other)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
