//! Distributed lock over a versioned store
//!
//! Serializes sensitive operations (consolidation, re-runs) across
//! processes that share a store. It uses:
//! - **Conditional create**: acquisition writes the lock record with a
//!   `DoesNotExist` precondition, so only one writer can succeed
//! - **TTL**: every record carries `expires_at`; an expired record may be
//!   taken over by anyone, which recovers locks held by crashed processes
//! - **Compare-and-swap takeover**: replacing an expired record is
//!   conditional on the version that was observed expired
//! - **Re-entrant extension**: the current holder acquiring again pushes
//!   `expires_at` out and keeps its fencing token
//!
//! Callers should hold the lock through a [`LockGuard`] (or
//! [`DistributedLock::with_lock`]) so it is released on every exit path.

use crate::clock::{checked_after, Clock};
use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::normalize_key;
use crate::storage::{RetryPolicy, VersionedStore, WritePrecondition, WriteResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Namespace holding lock records.
pub const LOCK_NAMESPACE: &str = "locks";

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Longest TTL a lock may be taken for.
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(30 * 86_400);

/// Stored lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Incremented on every acquisition of this key; usable as a fencing token.
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining TTL at `now`, or zero if expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Mutual exclusion over named keys in a shared store.
pub struct DistributedLock<S: VersionedStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

// Manual Clone: Arc<S> is cloneable whether or not S is
impl<S: VersionedStore + ?Sized> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: VersionedStore + ?Sized> DistributedLock<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Try once to take `lock_key` for `holder_id`.
    ///
    /// Returns `true` when the caller now holds the lock. When `holder_id`
    /// already holds it, the expiry moves to `now + ttl`. Prefer
    /// [`acquire_guard`](Self::acquire_guard), which releases automatically.
    pub fn acquire(&self, lock_key: &str, holder_id: &str, ttl: Duration) -> CoordinationResult<bool> {
        Ok(self.try_acquire(lock_key, holder_id, ttl, None)?.is_some())
    }

    /// Try once to take the lock, returning a guard that releases on drop.
    pub fn acquire_guard(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> CoordinationResult<Option<LockGuard<S>>> {
        self.acquire_guard_for(lock_key, holder_id, ttl, None)
    }

    /// Like [`acquire_guard`](Self::acquire_guard), recording what the lock
    /// is held for.
    pub fn acquire_guard_for(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        operation: Option<&str>,
    ) -> CoordinationResult<Option<LockGuard<S>>> {
        Ok(self
            .try_acquire(lock_key, holder_id, ttl, operation)?
            .map(|info| LockGuard {
                lock: self.clone(),
                info,
                released: false,
            }))
    }

    /// Retry acquisition with backoff while another holder has the lock.
    ///
    /// Gives up after `policy.max_attempts` and returns `None`.
    pub fn acquire_with_retry(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        policy: RetryPolicy,
    ) -> CoordinationResult<Option<LockGuard<S>>> {
        for attempt in 1..=policy.max_attempts {
            if let Some(guard) = self.acquire_guard(lock_key, holder_id, ttl)? {
                return Ok(Some(guard));
            }
            if attempt < policy.max_attempts {
                std::thread::sleep(policy.backoff(attempt));
            }
        }
        tracing::warn!(lock_key, holder_id, attempts = policy.max_attempts, "lock still held, giving up");
        Ok(None)
    }

    /// Run `f` while holding the lock.
    ///
    /// Returns `Ok(None)` without running `f` when the lock is held by
    /// someone else. The lock is released whether `f` succeeds, fails or
    /// panics.
    pub fn with_lock<R, F>(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        f: F,
    ) -> CoordinationResult<Option<R>>
    where
        F: FnOnce(&LockInfo) -> CoordinationResult<R>,
    {
        let Some(guard) = self.acquire_guard(lock_key, holder_id, ttl)? else {
            return Ok(None);
        };
        let result = f(guard.info());
        guard.release()?;
        result.map(Some)
    }

    /// Release the lock if `holder_id` holds it.
    ///
    /// Releasing a lock you do not hold is a no-op returning `false`.
    pub fn release(&self, lock_key: &str, holder_id: &str) -> CoordinationResult<bool> {
        let key = normalize_key(lock_key);
        let Some(record) = self.store.get(LOCK_NAMESPACE, &key)? else {
            return Ok(false);
        };
        let info: LockInfo = serde_json::from_str(&record.value)?;
        if info.holder_id != holder_id {
            tracing::debug!(lock_key = %key, holder_id, current_holder = %info.holder_id, "release by non-holder ignored");
            return Ok(false);
        }

        let released = self
            .store
            .delete(LOCK_NAMESPACE, &key, WritePrecondition::MatchesVersion(record.version))?
            .is_success();
        if released {
            tracing::info!(lock_key = %key, holder_id, "lock released");
        }
        Ok(released)
    }

    /// Current lock record, expired or not.
    pub fn read(&self, lock_key: &str) -> CoordinationResult<Option<LockInfo>> {
        let key = normalize_key(lock_key);
        match self.store.get(LOCK_NAMESPACE, &key)? {
            Some(record) => Ok(Some(serde_json::from_str(&record.value)?)),
            None => Ok(None),
        }
    }

    /// Whether an unexpired lock exists for the key.
    pub fn is_locked(&self, lock_key: &str) -> CoordinationResult<bool> {
        let now = self.clock.now();
        Ok(self.read(lock_key)?.is_some_and(|info| !info.is_expired_at(now)))
    }

    /// Delete the lock regardless of holder (admin recovery).
    pub fn force_break(&self, lock_key: &str) -> CoordinationResult<bool> {
        let key = normalize_key(lock_key);
        let broken = self
            .store
            .delete(LOCK_NAMESPACE, &key, WritePrecondition::None)?
            .is_success();
        if broken {
            tracing::warn!(lock_key = %key, "lock forcibly broken");
        }
        Ok(broken)
    }

    fn try_acquire(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        operation: Option<&str>,
    ) -> CoordinationResult<Option<LockInfo>> {
        if ttl > MAX_LOCK_TTL {
            return Err(CoordinationError::InvalidInput(format!(
                "lock ttl of {}s exceeds the {}s maximum",
                ttl.as_secs(),
                MAX_LOCK_TTL.as_secs()
            )));
        }
        let key = normalize_key(lock_key);
        let now = self.clock.now();
        let expires_at = checked_after(now, ttl)?;
        let make_info = |sequence_number: u64| LockInfo {
            lock_key: key.clone(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at,
            sequence_number,
            operation: operation.map(str::to_string),
        };

        // Fresh lock: only one creator can win.
        let fresh = make_info(1);
        match self.store.put(
            LOCK_NAMESPACE,
            &key,
            &serde_json::to_string(&fresh)?,
            WritePrecondition::DoesNotExist,
        )? {
            WriteResult::Success { .. } => {
                tracing::info!(lock_key = %key, holder_id, ttl_secs = ttl.as_secs(), "lock acquired");
                return Ok(Some(fresh));
            }
            WriteResult::PreconditionFailed { .. } => {}
        }

        // Existing lock: take it over only if it is expired, and only at the
        // version we saw expired.
        let Some(record) = self.store.get(LOCK_NAMESPACE, &key)? else {
            // Released between our create attempt and this read; next attempt wins or loses cleanly.
            return Ok(None);
        };
        let existing: LockInfo = serde_json::from_str(&record.value)?;
        if !existing.is_expired_at(now) && existing.holder_id == holder_id {
            return self.extend(&key, record.version, existing, expires_at, operation);
        }
        if !existing.is_expired_at(now) {
            tracing::debug!(lock_key = %key, holder_id, current_holder = %existing.holder_id, "lock held");
            return Ok(None);
        }

        let takeover = make_info(existing.sequence_number.saturating_add(1));
        match self.store.put(
            LOCK_NAMESPACE,
            &key,
            &serde_json::to_string(&takeover)?,
            WritePrecondition::MatchesVersion(record.version),
        )? {
            WriteResult::Success { .. } => {
                tracing::info!(
                    lock_key = %key,
                    holder_id,
                    previous_holder = %existing.holder_id,
                    sequence_number = takeover.sequence_number,
                    "expired lock taken over"
                );
                Ok(Some(takeover))
            }
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    fn extend(
        &self,
        key: &str,
        version: u64,
        existing: LockInfo,
        expires_at: DateTime<Utc>,
        operation: Option<&str>,
    ) -> CoordinationResult<Option<LockInfo>> {
        let extended = LockInfo {
            expires_at,
            operation: operation.map(str::to_string).or(existing.operation),
            ..existing
        };
        match self.store.put(
            LOCK_NAMESPACE,
            key,
            &serde_json::to_string(&extended)?,
            WritePrecondition::MatchesVersion(version),
        )? {
            WriteResult::Success { .. } => {
                tracing::debug!(lock_key = %key, holder_id = %extended.holder_id, expires_at = %expires_at, "lock extended");
                Ok(Some(extended))
            }
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }
}

/// RAII guard for a held lock.
///
/// The lock is released when the guard is dropped; call
/// [`release`](Self::release) to observe release errors.
pub struct LockGuard<S: VersionedStore + ?Sized> {
    lock: DistributedLock<S>,
    info: LockInfo,
    released: bool,
}

impl<S: VersionedStore + ?Sized> LockGuard<S> {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn fencing_token(&self) -> u64 {
        self.info.sequence_number
    }

    /// Push the expiry out to `now + ttl`.
    ///
    /// Returns `false` when the lock was lost (expired and taken over).
    pub fn extend(&mut self, ttl: Duration) -> CoordinationResult<bool> {
        match self
            .lock
            .try_acquire(&self.info.lock_key, &self.info.holder_id, ttl, self.info.operation.as_deref())?
        {
            Some(info) if info.sequence_number == self.info.sequence_number => {
                self.info = info;
                Ok(true)
            }
            Some(info) => {
                // Ours had expired; the new acquisition has a new fencing token.
                self.info = info;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Keep the lock past this guard; it is then held until its TTL
    /// expires or someone calls [`DistributedLock::release`].
    pub fn persist(mut self) -> LockInfo {
        self.released = true;
        self.info.clone()
    }

    /// Explicitly release the lock.
    pub fn release(mut self) -> CoordinationResult<bool> {
        self.released = true;
        self.lock.release(&self.info.lock_key, &self.info.holder_id)
    }
}

impl<S: VersionedStore + ?Sized> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.release(&self.info.lock_key, &self.info.holder_id) {
            tracing::warn!(
                lock_key = %self.info.lock_key,
                holder_id = %self.info.holder_id,
                error = %e,
                "failed to release lock on drop; it will expire at its TTL"
            );
        }
    }
}
