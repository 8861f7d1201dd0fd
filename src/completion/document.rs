//! StageCompletionDocument: persisted completion state of one batch

use crate::keys::{BatchKey, WorkerId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Delivery state of the transition a triggered batch owes downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    /// Not triggered yet, or triggered and waiting for someone to publish
    #[default]
    Pending,
    /// Claimed by a publisher at `handoff_claimed_at`
    Publishing,
    /// Validation withheld the transition; only an operator releases it
    Blocked,
    Published,
}

/// Completion state shared by every worker reporting into one batch.
///
/// Only ever mutated inside a store transaction. `completed_worker_ids`
/// grows monotonically and `triggered` flips to true at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCompletionDocument {
    pub batch_key: BatchKey,
    pub expected_count: usize,
    pub completed_worker_ids: BTreeSet<WorkerId>,
    pub failed_worker_ids: BTreeSet<WorkerId>,
    /// Store version this document was written at
    pub version: u64,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    /// First reported item count per completed worker
    #[serde(default)]
    pub item_counts: BTreeMap<WorkerId, u64>,
    /// Last failure reason per failed worker
    #[serde(default)]
    pub failure_reasons: BTreeMap<WorkerId, String>,
    /// Quality score per table, per reporting worker
    #[serde(default)]
    pub quality_scores: BTreeMap<String, BTreeMap<WorkerId, f64>>,
    #[serde(default)]
    pub handoff: HandoffState,
    #[serde(default)]
    pub handoff_claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// Why the last handoff attempt did not publish
    #[serde(default)]
    pub handoff_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_completion_at: Option<DateTime<Utc>>,
}

/// How a completion report changed a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionChange {
    /// The worker was already completed; nothing changed.
    Duplicate,
    /// The worker was added; the batch is still below its threshold or was
    /// already triggered.
    Recorded,
    /// The worker was added and this report flipped `triggered`.
    Triggered,
}

impl StageCompletionDocument {
    pub fn new(batch_key: BatchKey, expected_count: usize, now: DateTime<Utc>) -> Self {
        Self {
            batch_key,
            expected_count,
            completed_worker_ids: BTreeSet::new(),
            failed_worker_ids: BTreeSet::new(),
            version: 1,
            triggered: false,
            triggered_at: None,
            item_counts: BTreeMap::new(),
            failure_reasons: BTreeMap::new(),
            quality_scores: BTreeMap::new(),
            handoff: HandoffState::Pending,
            handoff_claimed_at: None,
            published_at: None,
            handoff_error: None,
            created_at: now,
            updated_at: now,
            last_completion_at: None,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.completed_worker_ids.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_worker_ids.len()
    }

    /// Workers still owed before the threshold is reached.
    pub fn remaining(&self) -> usize {
        self.expected_count.saturating_sub(self.completed_count())
    }

    pub fn threshold_reached(&self) -> bool {
        self.completed_count() >= self.expected_count
    }

    /// Sum of recorded item counts.
    pub fn total_items(&self) -> u64 {
        self.item_counts.values().sum()
    }

    /// Triggered, but the transition has not gone out and is not held by
    /// validation.
    pub fn awaiting_handoff(&self) -> bool {
        self.triggered && matches!(self.handoff, HandoffState::Pending | HandoffState::Publishing)
    }

    /// Whether a publisher may claim the handoff at `now`.
    ///
    /// A `Publishing` claim older than `lease` is presumed abandoned by a
    /// crashed publisher.
    pub fn handoff_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        if !self.triggered {
            return false;
        }
        match self.handoff {
            HandoffState::Pending => true,
            HandoffState::Publishing => self
                .handoff_claimed_at
                .and_then(|at| at.checked_add_signed(lease))
                .is_some_and(|expiry| now >= expiry),
            HandoffState::Blocked | HandoffState::Published => false,
        }
    }

    /// Claim the handoff for a publisher.
    pub fn claim_handoff(&mut self, now: DateTime<Utc>) {
        self.handoff = HandoffState::Publishing;
        self.handoff_claimed_at = Some(now);
        self.updated_at = now;
    }

    /// Average quality score reported for `table`, if any worker reported one.
    pub fn quality_score(&self, table: &str) -> Option<f64> {
        let scores = self.quality_scores.get(table)?;
        if scores.is_empty() {
            return None;
        }
        Some(scores.values().sum::<f64>() / scores.len() as f64)
    }

    /// Record a worker's quality score for a table. The first score a worker
    /// reports for a table wins; returns false when nothing changed.
    pub fn apply_quality(&mut self, worker_id: &WorkerId, table: &str, score: f64, now: DateTime<Utc>) -> bool {
        let scores = self.quality_scores.entry(table.to_string()).or_default();
        if scores.contains_key(worker_id) {
            return false;
        }
        scores.insert(worker_id.clone(), score);
        self.updated_at = now;
        true
    }

    /// Apply one completion report.
    ///
    /// Insert, recount and the conditional trigger flip happen together so
    /// the caller can persist them as one write. The report that triggers
    /// also claims the handoff, so exactly one caller owns the first publish.
    pub fn apply_completion(&mut self, worker_id: &WorkerId, item_count: u64, now: DateTime<Utc>) -> CompletionChange {
        if self.completed_worker_ids.contains(worker_id) {
            return CompletionChange::Duplicate;
        }

        self.completed_worker_ids.insert(worker_id.clone());
        self.item_counts.insert(worker_id.clone(), item_count);
        // A bus retry that succeeded after a reported failure.
        self.failed_worker_ids.remove(worker_id);
        self.failure_reasons.remove(worker_id);
        self.last_completion_at = Some(now);
        self.updated_at = now;

        if !self.triggered && self.threshold_reached() {
            self.triggered = true;
            self.triggered_at = Some(now);
            self.claim_handoff(now);
            CompletionChange::Triggered
        } else {
            CompletionChange::Recorded
        }
    }

    /// Record a failure. Returns false when nothing changed (the worker
    /// already completed, or the same reason was already recorded).
    pub fn apply_failure(&mut self, worker_id: &WorkerId, reason: &str, now: DateTime<Utc>) -> bool {
        if self.completed_worker_ids.contains(worker_id) {
            return false;
        }
        let newly_failed = self.failed_worker_ids.insert(worker_id.clone());
        let previous = self.failure_reasons.insert(worker_id.clone(), reason.to_string());
        if !newly_failed && previous.as_deref() == Some(reason) {
            return false;
        }
        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str) -> WorkerId {
        WorkerId::parse(id).unwrap()
    }

    fn doc(expected: usize) -> StageCompletionDocument {
        StageCompletionDocument::new(BatchKey::parse("2024-01-15").unwrap(), expected, Utc::now())
    }

    #[test]
    fn duplicate_completion_changes_nothing() {
        let mut d = doc(3);
        let now = Utc::now();
        assert_eq!(d.apply_completion(&worker("w-17"), 12, now), CompletionChange::Recorded);
        let before = d.clone();
        assert_eq!(d.apply_completion(&worker("w-17"), 99, now), CompletionChange::Duplicate);
        assert_eq!(d, before);
        assert_eq!(d.item_counts[&worker("w-17")], 12);
    }

    #[test]
    fn trigger_flips_once_at_threshold() {
        let mut d = doc(2);
        let now = Utc::now();
        assert_eq!(d.apply_completion(&worker("a"), 1, now), CompletionChange::Recorded);
        assert_eq!(d.apply_completion(&worker("b"), 1, now), CompletionChange::Triggered);
        assert!(d.triggered);
        assert_eq!(d.triggered_at, Some(now));
        assert_eq!(d.handoff, HandoffState::Publishing);
        // Extra workers past the threshold never re-trigger.
        assert_eq!(d.apply_completion(&worker("c"), 1, now), CompletionChange::Recorded);
    }

    #[test]
    fn completion_after_failure_moves_worker() {
        let mut d = doc(1);
        let now = Utc::now();
        assert!(d.apply_failure(&worker("a"), "timeout", now));
        assert_eq!(d.failed_count(), 1);

        assert_eq!(d.apply_completion(&worker("a"), 4, now), CompletionChange::Triggered);
        assert_eq!(d.failed_count(), 0);
        assert!(d.failure_reasons.is_empty());
    }

    #[test]
    fn failure_after_completion_is_ignored() {
        let mut d = doc(2);
        let now = Utc::now();
        d.apply_completion(&worker("a"), 1, now);
        assert!(!d.apply_failure(&worker("a"), "late failure", now));
        assert_eq!(d.failed_count(), 0);
    }

    #[test]
    fn handoff_claim_expires_after_lease() {
        let mut d = doc(1);
        let now = Utc::now();
        let lease = Duration::seconds(60);
        assert!(!d.handoff_claimable(now, lease), "untriggered batches owe nothing");

        d.apply_completion(&worker("a"), 1, now);
        assert!(d.awaiting_handoff());
        assert!(!d.handoff_claimable(now + Duration::seconds(59), lease));
        assert!(d.handoff_claimable(now + Duration::seconds(60), lease));

        d.handoff = HandoffState::Pending;
        assert!(d.handoff_claimable(now, lease));

        d.handoff = HandoffState::Blocked;
        assert!(!d.awaiting_handoff());
        assert!(!d.handoff_claimable(now + Duration::days(1), lease));
    }

    #[test]
    fn documents_without_handoff_fields_still_load() {
        let mut value = serde_json::to_value(doc(2)).unwrap();
        let fields = value.as_object_mut().unwrap();
        for name in ["quality_scores", "handoff", "handoff_claimed_at", "published_at", "handoff_error"] {
            fields.remove(name);
        }
        let loaded: StageCompletionDocument = serde_json::from_value(value).unwrap();
        assert_eq!(loaded.handoff, HandoffState::Pending);
        assert!(loaded.quality_scores.is_empty());
    }

    #[test]
    fn quality_scores_average_per_table() {
        let mut d = doc(3);
        let now = Utc::now();
        assert!(d.apply_quality(&worker("a"), "props", 0.9, now));
        assert!(d.apply_quality(&worker("b"), "props", 0.7, now));
        assert!(!d.apply_quality(&worker("a"), "props", 0.1, now));
        assert!((d.quality_score("props").unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(d.quality_score("lines"), None);
    }

    #[test]
    fn repeated_identical_failure_is_noop() {
        let mut d = doc(2);
        let now = Utc::now();
        assert!(d.apply_failure(&worker("a"), "oom", now));
        assert!(!d.apply_failure(&worker("a"), "oom", now));
        assert!(d.apply_failure(&worker("a"), "timeout", now));
        assert_eq!(d.failure_reasons[&worker("a")], "timeout");
    }
}
