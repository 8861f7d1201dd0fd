//! Atomic read-modify-write over versioned documents
//!
//! A transaction reads the current document, hands it to a closure that
//! decides what the new document should be, and writes it back with a
//! version precondition. When another writer got there first the whole
//! read-decide-write cycle starts over, up to the policy's attempt bound.

use super::traits::{VersionedStore, WritePrecondition, WriteResult};
use crate::error::{CoordinationError, CoordinationResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Bounds for optimistic retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based), capped,
    /// plus up to 50% random jitter so colliding writers spread out.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        let jitter_cap = (capped.as_millis() as u64 / 2).max(1);
        capped + Duration::from_millis(jitter_millis(jitter_cap))
    }
}

/// Random value in `0..cap` from the OS RNG; falls back to the clock's
/// sub-second nanos if the RNG is unavailable.
pub(crate) fn jitter_millis(cap: u64) -> u64 {
    if cap == 0 {
        return 0;
    }
    let mut buf = [0u8; 8];
    let seed = match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => u64::from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos(),
        ),
    };
    seed % cap
}

/// A decoded document and the store version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// What a transaction closure wants done.
#[derive(Debug)]
pub enum Mutation<T, R> {
    /// Write `T` (conditional on the version read) and return `R`.
    Write(T, R),
    /// Leave the document as it is and return `R`.
    Keep(R),
}

/// Runs read-modify-write cycles against one namespace of a store.
pub struct TransactionRunner<S: VersionedStore + ?Sized> {
    store: Arc<S>,
    namespace: String,
    policy: RetryPolicy,
}

impl<S: VersionedStore + ?Sized> Clone for TransactionRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            policy: self.policy,
        }
    }
}

impl<S: VersionedStore + ?Sized> TransactionRunner<S> {
    pub fn new(store: Arc<S>, namespace: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            policy,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Read and decode a document without modifying it.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> CoordinationResult<Option<Versioned<T>>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.get(&self.namespace, key) {
                Ok(Some(record)) => {
                    return Ok(Some(Versioned {
                        value: serde_json::from_str(&record.value)?,
                        version: record.version,
                    }))
                }
                Ok(None) => return Ok(None),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    tracing::debug!(namespace = %self.namespace, key, attempt, error = %e, "transient read error, retrying");
                    std::thread::sleep(self.policy.backoff(attempt));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Decode every document in the namespace.
    pub fn load_all<T: DeserializeOwned>(&self) -> CoordinationResult<Vec<Versioned<T>>> {
        self.store
            .list(&self.namespace)?
            .into_iter()
            .map(|record| {
                Ok(Versioned {
                    value: serde_json::from_str(&record.value)?,
                    version: record.version,
                })
            })
            .collect()
    }

    /// Atomically apply `decide` to the document at `key`.
    ///
    /// `decide` sees the current document (or `None` if absent) and may be
    /// called several times: it must be free of side effects. Version
    /// conflicts and transient store errors restart the cycle from the read;
    /// after `max_attempts` the call fails with `ConflictExhausted`.
    pub fn run<T, R, F>(&self, key: &str, mut decide: F) -> CoordinationResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<Versioned<T>>) -> CoordinationResult<Mutation<T, R>>,
    {
        let mut attempt = 0;
        while attempt < self.policy.max_attempts {
            attempt += 1;

            let current = match self.load::<T>(key) {
                Ok(current) => current,
                Err(CoordinationError::TransientStore(e)) => {
                    tracing::debug!(namespace = %self.namespace, key, attempt, error = %e, "read failed, retrying transaction");
                    self.pause(attempt);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let precondition = match &current {
                Some(doc) => WritePrecondition::MatchesVersion(doc.version),
                None => WritePrecondition::DoesNotExist,
            };

            let (next, result) = match decide(current)? {
                Mutation::Keep(result) => return Ok(result),
                Mutation::Write(next, result) => (next, result),
            };
            let body = serde_json::to_string(&next)?;

            match self.store.put(&self.namespace, key, &body, precondition) {
                Ok(WriteResult::Success { .. }) => return Ok(result),
                Ok(WriteResult::PreconditionFailed { current_version }) => {
                    tracing::debug!(
                        namespace = %self.namespace,
                        key,
                        attempt,
                        ?current_version,
                        "version conflict, retrying transaction"
                    );
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(namespace = %self.namespace, key, attempt, error = %e, "transient write error, retrying transaction");
                }
                Err(e) => return Err(e.into()),
            }
            self.pause(attempt);
        }

        tracing::error!(
            namespace = %self.namespace,
            key,
            attempts = self.policy.max_attempts,
            "transaction retries exhausted"
        );
        Err(CoordinationError::ConflictExhausted {
            namespace: self.namespace.clone(),
            key: key.to_string(),
            attempts: self.policy.max_attempts,
        })
    }

    fn pause(&self, attempt: u32) {
        if attempt < self.policy.max_attempts {
            std::thread::sleep(self.policy.backoff(attempt));
        }
    }
}
