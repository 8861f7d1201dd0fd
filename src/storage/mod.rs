//! Storage backends
//!
//! Every persisted coordination document lives in a `VersionedStore`: a
//! key-value store with per-record versions and compare-and-swap writes.
//! `MemoryStore` serves single-node deployments and tests, `SqliteStore`
//! persists to a database file shared between processes.

mod memory;
mod sqlite;
mod traits;
pub mod transaction;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, DEFAULT_BUSY_TIMEOUT};
pub use traits::{
    OpenStore, StorageError, StorageResult, VersionedRecord, VersionedStore, WritePrecondition,
    WriteResult,
};
pub use transaction::{Mutation, RetryPolicy, TransactionRunner, Versioned};
