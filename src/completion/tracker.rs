//! StageCompletionTracker: cross-process completion accounting for a stage

use super::document::{CompletionChange, HandoffState, StageCompletionDocument};
use crate::clock::{to_chrono, Clock};
use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::{BatchKey, WorkerId};
use crate::storage::{
    Mutation, RetryPolicy, TransactionRunner, Versioned, VersionedStore, WritePrecondition,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Namespace prefix for completion documents; the stage name is appended.
pub const COMPLETION_NAMESPACE: &str = "stage_completion";

/// Result of one completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReceipt {
    /// This report flipped the batch to triggered. True for exactly one
    /// report per batch.
    pub triggered_now: bool,
    /// The worker had already been recorded.
    pub duplicate: bool,
    pub completed: usize,
    pub expected: usize,
    /// The batch is triggered but its transition has not been published.
    pub awaiting_handoff: bool,
}

/// Persisted per-batch completion state machine for one stage.
///
/// Every mutation is a single optimistic transaction over the batch's
/// document, so any number of processes may report into the same batch.
pub struct StageCompletionTracker<S: VersionedStore + ?Sized> {
    stage: String,
    runner: TransactionRunner<S>,
    clock: Arc<dyn Clock>,
}

impl<S: VersionedStore + ?Sized> Clone for StageCompletionTracker<S> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            runner: self.runner.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: VersionedStore + ?Sized> StageCompletionTracker<S> {
    pub fn new(store: Arc<S>, stage: &str, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        let stage = crate::keys::normalize_key(stage);
        let namespace = format!("{}/{}", COMPLETION_NAMESPACE, stage);
        Self {
            stage,
            runner: TransactionRunner::new(store, namespace, policy),
            clock,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Create the batch document if it does not exist yet.
    ///
    /// Re-registering returns the stored document unchanged, even when
    /// `expected_count` differs (the first registration wins).
    pub fn register_batch(
        &self,
        batch_key: &BatchKey,
        expected_count: usize,
    ) -> CoordinationResult<StageCompletionDocument> {
        if expected_count == 0 {
            return Err(CoordinationError::InvalidInput(format!(
                "batch {} must expect at least one worker",
                batch_key
            )));
        }
        let now = self.clock.now();

        let (doc, created) = self.runner.run(batch_key.as_str(), |current: Option<Versioned<StageCompletionDocument>>| {
            Ok(match current {
                Some(existing) => Mutation::Keep((existing.value, false)),
                None => {
                    let doc = StageCompletionDocument::new(batch_key.clone(), expected_count, now);
                    Mutation::Write(doc.clone(), (doc, true))
                }
            })
        })?;

        if created {
            tracing::info!(stage = %self.stage, batch_key = %batch_key, expected_count, "batch registered");
            // A key re-created after a purge does not start at version 1.
            return self.require(batch_key);
        } else if doc.expected_count != expected_count {
            tracing::warn!(
                stage = %self.stage,
                batch_key = %batch_key,
                stored = doc.expected_count,
                requested = expected_count,
                "batch already registered with a different expected count; keeping stored value"
            );
        }
        Ok(doc)
    }

    /// Record that `worker_id` finished.
    ///
    /// Idempotent per worker. The insert and the threshold check-and-flip
    /// commit in one transaction; on repeated version conflicts the call
    /// fails with `ConflictExhausted` and is safe to retry.
    pub fn report_completion(
        &self,
        batch_key: &BatchKey,
        worker_id: &WorkerId,
        item_count: u64,
    ) -> CoordinationResult<CompletionReceipt> {
        let now = self.clock.now();

        let (change, doc) = self.runner.run(batch_key.as_str(), |current: Option<Versioned<StageCompletionDocument>>| {
            let Some(Versioned { value: mut doc, version }) = current else {
                return Err(CoordinationError::BatchNotFound(batch_key.to_string()));
            };
            match doc.apply_completion(worker_id, item_count, now) {
                CompletionChange::Duplicate => Ok(Mutation::Keep((CompletionChange::Duplicate, doc))),
                change => {
                    doc.version = version + 1;
                    Ok(Mutation::Write(doc.clone(), (change, doc)))
                }
            }
        })?;

        let receipt = CompletionReceipt {
            triggered_now: change == CompletionChange::Triggered,
            duplicate: change == CompletionChange::Duplicate,
            completed: doc.completed_count(),
            expected: doc.expected_count,
            awaiting_handoff: doc.awaiting_handoff(),
        };

        match change {
            CompletionChange::Duplicate => tracing::debug!(
                stage = %self.stage,
                batch_key = %batch_key,
                worker_id = %worker_id,
                "duplicate completion ignored"
            ),
            CompletionChange::Recorded => tracing::debug!(
                stage = %self.stage,
                batch_key = %batch_key,
                worker_id = %worker_id,
                completed = receipt.completed,
                expected = receipt.expected,
                "completion recorded"
            ),
            CompletionChange::Triggered => tracing::info!(
                stage = %self.stage,
                batch_key = %batch_key,
                worker_id = %worker_id,
                completed = receipt.completed,
                expected = receipt.expected,
                total_items = doc.total_items(),
                "completion threshold reached, batch triggered"
            ),
        }
        Ok(receipt)
    }

    /// Record that `worker_id` failed. Returns whether the document changed.
    pub fn report_failure(
        &self,
        batch_key: &BatchKey,
        worker_id: &WorkerId,
        reason: &str,
    ) -> CoordinationResult<bool> {
        let now = self.clock.now();

        let changed = self.runner.run(batch_key.as_str(), |current: Option<Versioned<StageCompletionDocument>>| {
            let Some(Versioned { value: mut doc, version }) = current else {
                return Err(CoordinationError::BatchNotFound(batch_key.to_string()));
            };
            if doc.apply_failure(worker_id, reason, now) {
                doc.version = version + 1;
                Ok(Mutation::Write(doc, true))
            } else {
                Ok(Mutation::Keep(false))
            }
        })?;

        if changed {
            tracing::warn!(stage = %self.stage, batch_key = %batch_key, worker_id = %worker_id, reason, "worker failure recorded");
        }
        Ok(changed)
    }

    /// Record a worker's quality score for `table`.
    ///
    /// The first score per worker and table wins. Returns whether the
    /// document changed.
    pub fn report_quality(
        &self,
        batch_key: &BatchKey,
        worker_id: &WorkerId,
        table: &str,
        score: f64,
    ) -> CoordinationResult<bool> {
        let table = table.trim();
        if table.is_empty() || !score.is_finite() {
            return Err(CoordinationError::InvalidInput(format!(
                "quality score '{}={}' needs a table name and a finite score",
                table, score
            )));
        }
        let now = self.clock.now();

        let changed = self.runner.run(batch_key.as_str(), |current: Option<Versioned<StageCompletionDocument>>| {
            let Some(Versioned { value: mut doc, version }) = current else {
                return Err(CoordinationError::BatchNotFound(batch_key.to_string()));
            };
            if doc.apply_quality(worker_id, table, score, now) {
                doc.version = version + 1;
                Ok(Mutation::Write(doc, true))
            } else {
                Ok(Mutation::Keep(false))
            }
        })?;

        if changed {
            tracing::debug!(stage = %self.stage, batch_key = %batch_key, worker_id = %worker_id, table, score, "quality score recorded");
        }
        Ok(changed)
    }

    /// Take over an unpublished handoff: a `Pending` one, or a `Publishing`
    /// claim older than `lease`. Returns whether the caller now owns it.
    pub fn claim_handoff(&self, batch_key: &BatchKey, lease: std::time::Duration) -> CoordinationResult<bool> {
        let lease = to_chrono(lease);
        let claimed = self.update_handoff(batch_key, |doc, now| {
            if !doc.handoff_claimable(now, lease) {
                return false;
            }
            doc.claim_handoff(now);
            true
        })?;
        if claimed {
            tracing::warn!(stage = %self.stage, batch_key = %batch_key, "claimed unpublished handoff for retry");
        }
        Ok(claimed)
    }

    /// The transition went out.
    pub fn mark_published(&self, batch_key: &BatchKey) -> CoordinationResult<()> {
        self.update_handoff(batch_key, |doc, now| {
            if doc.handoff == HandoffState::Published {
                return false;
            }
            doc.handoff = HandoffState::Published;
            doc.published_at = Some(now);
            doc.handoff_error = None;
            doc.updated_at = now;
            true
        })?;
        Ok(())
    }

    /// Give a claimed handoff back after a failed attempt so the next
    /// report retries it.
    pub fn release_handoff(&self, batch_key: &BatchKey, error: &str) -> CoordinationResult<()> {
        self.update_handoff(batch_key, |doc, now| {
            if doc.handoff != HandoffState::Publishing {
                return false;
            }
            doc.handoff = HandoffState::Pending;
            doc.handoff_claimed_at = None;
            doc.handoff_error = Some(error.to_string());
            doc.updated_at = now;
            true
        })?;
        Ok(())
    }

    /// Validation withheld the transition.
    pub fn mark_blocked(&self, batch_key: &BatchKey, summary: &str) -> CoordinationResult<()> {
        self.update_handoff(batch_key, |doc, now| {
            if doc.handoff == HandoffState::Published {
                return false;
            }
            doc.handoff = HandoffState::Blocked;
            doc.handoff_claimed_at = None;
            doc.handoff_error = Some(summary.to_string());
            doc.updated_at = now;
            true
        })?;
        Ok(())
    }

    fn update_handoff<F>(&self, batch_key: &BatchKey, mut apply: F) -> CoordinationResult<bool>
    where
        F: FnMut(&mut StageCompletionDocument, DateTime<Utc>) -> bool,
    {
        let now = self.clock.now();
        self.runner.run(batch_key.as_str(), |current: Option<Versioned<StageCompletionDocument>>| {
            let Some(Versioned { value: mut doc, version }) = current else {
                return Err(CoordinationError::BatchNotFound(batch_key.to_string()));
            };
            if apply(&mut doc, now) {
                doc.version = version + 1;
                Ok(Mutation::Write(doc, true))
            } else {
                Ok(Mutation::Keep(false))
            }
        })
    }

    pub fn get(&self, batch_key: &BatchKey) -> CoordinationResult<Option<StageCompletionDocument>> {
        Ok(self
            .runner
            .load::<StageCompletionDocument>(batch_key.as_str())?
            .map(with_store_version))
    }

    /// Like [`get`](Self::get) but a missing batch is an error.
    pub fn require(&self, batch_key: &BatchKey) -> CoordinationResult<StageCompletionDocument> {
        self.get(batch_key)?
            .ok_or_else(|| CoordinationError::BatchNotFound(batch_key.to_string()))
    }

    /// Workers still owed a report: expected minus completed, never negative.
    pub fn missing_count(&self, batch_key: &BatchKey) -> CoordinationResult<usize> {
        Ok(self.require(batch_key)?.remaining())
    }

    /// Every batch document of this stage, ordered by batch key.
    pub fn list(&self) -> CoordinationResult<Vec<StageCompletionDocument>> {
        Ok(self
            .runner
            .load_all::<StageCompletionDocument>()?
            .into_iter()
            .map(with_store_version)
            .collect())
    }

    /// Delete triggered batches whose trigger is older than `cutoff`.
    ///
    /// Incomplete batches are never purged; they stay visible to the stall
    /// monitor.
    pub fn purge_triggered_before(&self, cutoff: DateTime<Utc>) -> CoordinationResult<usize> {
        let mut purged = 0;
        for doc in self.runner.load_all::<StageCompletionDocument>()? {
            let expired = doc.value.triggered && doc.value.triggered_at.is_some_and(|t| t < cutoff);
            if !expired {
                continue;
            }
            let deleted = self
                .runner
                .store()
                .delete(
                    self.runner.namespace(),
                    doc.value.batch_key.as_str(),
                    WritePrecondition::MatchesVersion(doc.version),
                )?
                .is_success();
            if deleted {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(stage = %self.stage, purged, %cutoff, "purged triggered batches");
        }
        Ok(purged)
    }
}

fn with_store_version(v: Versioned<StageCompletionDocument>) -> StageCompletionDocument {
    let mut doc = v.value;
    doc.version = v.version;
    doc
}
