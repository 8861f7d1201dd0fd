//! Storage trait definitions

use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    /// The backend did not answer within its bounded timeout.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Errors worth retrying locally: lock contention and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Condition a write must satisfy to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Unconditional write.
    None,
    /// Only create; fail if the key exists.
    DoesNotExist,
    /// Only replace the record currently at this version.
    MatchesVersion(u64),
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The write was applied; `version` is the record's new version.
    Success { version: u64 },
    /// The precondition did not hold. `current_version` is `None` when the
    /// key does not exist.
    PreconditionFailed { current_version: Option<u64> },
}

impl WriteResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A stored document together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub key: String,
    /// JSON-encoded document body
    pub value: String,
    /// Starts at 1 on first create and increments on every successful write.
    /// A key re-created after a delete continues from its last version.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Versioned key-value store with compare-and-swap.
///
/// Keys are grouped into namespaces (one per document kind). Every write
/// bumps the record version; conditional writes are atomic with respect to
/// every other writer of the same store, including other processes sharing
/// a persistent backend.
///
/// Implementations must be thread-safe (Send + Sync) to support
/// concurrent access from multiple threads.
pub trait VersionedStore: Send + Sync {
    /// Load a record
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<VersionedRecord>>;

    /// Write a record if the precondition holds
    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        precondition: WritePrecondition,
    ) -> StorageResult<WriteResult>;

    /// Delete a record if the precondition holds.
    ///
    /// On success the returned version is the version that was deleted.
    fn delete(
        &self,
        namespace: &str,
        key: &str,
        precondition: WritePrecondition,
    ) -> StorageResult<WriteResult>;

    /// All records in a namespace, ordered by key
    fn list(&self, namespace: &str) -> StorageResult<Vec<VersionedRecord>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: VersionedStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
