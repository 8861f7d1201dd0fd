//! In-process progress tracking for one active batch
//!
//! A coordinator process keeps one `ProgressTracker` per active batch for
//! live status and ETA. All state sits behind a single mutex: callbacks
//! arrive at single-digit rates and every critical section is a handful of
//! set operations, so one lock is cheap and keeps "insert" and "check
//! threshold" from ever being observed apart.

use crate::clock::{to_chrono, Clock};
use crate::keys::{BatchKey, WorkerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct ProgressState {
    completed: HashSet<WorkerId>,
    failed: HashMap<WorkerId, String>,
    completion_times: Vec<DateTime<Utc>>,
    item_counts: HashMap<WorkerId, u64>,
    total_item_count: u64,
    is_complete: bool,
    completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time progress with derived rate and ETA.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub expected: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub percentage: f64,
    pub elapsed_seconds: f64,
    /// Completions per second since the batch started
    pub rate: f64,
    /// `None` while nothing has completed yet
    pub eta_seconds: Option<f64>,
    pub is_complete: bool,
}

/// End-of-batch summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_key: BatchKey,
    pub expected_players: usize,
    pub completed_players: usize,
    pub failed_players: usize,
    /// Sum of the first reported item count of every completed worker
    pub total_predictions: u64,
    pub is_complete: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
}

/// Thread-safe live tracker for one batch.
#[derive(Debug)]
pub struct ProgressTracker {
    batch_key: BatchKey,
    expected: usize,
    start_time: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(batch_key: BatchKey, expected: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            batch_key,
            expected,
            start_time: clock.now(),
            clock,
            state: Mutex::new(ProgressState::default()),
        }
    }

    pub fn batch_key(&self) -> &BatchKey {
        &self.batch_key
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // Every critical section leaves the state consistent before it can
        // panic, so a poisoned lock still guards valid data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a completion. Returns true only for the call that reaches the
    /// expected count; duplicates are no-ops returning false.
    ///
    /// A completion from a worker previously marked failed (a retry that
    /// succeeded) clears the failure, matching the persisted document.
    pub fn process_completion_event(&self, worker_id: &WorkerId, item_count: u64) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();

        if state.completed.contains(worker_id) {
            return false;
        }
        state.failed.remove(worker_id);

        state.completed.insert(worker_id.clone());
        state.completion_times.push(now);
        state.item_counts.insert(worker_id.clone(), item_count);
        state.total_item_count += item_count;

        if state.completed.len() >= self.expected && !state.is_complete {
            state.is_complete = true;
            state.completed_at = Some(now);
            return true;
        }
        false
    }

    /// Record a failure. Returns false when the worker already completed or
    /// failed; a failure never undoes a completion.
    pub fn mark_failed(&self, worker_id: &WorkerId, reason: &str) -> bool {
        let mut state = self.lock();
        if state.completed.contains(worker_id) || state.failed.contains_key(worker_id) {
            return false;
        }
        state.failed.insert(worker_id.clone(), reason.to_string());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.lock().is_complete
    }

    /// Item count recorded for a worker (its first report).
    pub fn item_count(&self, worker_id: &WorkerId) -> Option<u64> {
        self.lock().item_counts.get(worker_id).copied()
    }

    /// Failure reason recorded for a worker.
    pub fn failure_reason(&self, worker_id: &WorkerId) -> Option<String> {
        self.lock().failed.get(worker_id).cloned()
    }

    /// Snapshot counters under the lock; derive rate and ETA outside it.
    pub fn get_progress(&self) -> Progress {
        let (completed, failed, is_complete) = {
            let state = self.lock();
            (state.completed.len(), state.failed.len(), state.is_complete)
        };

        let now = self.clock.now();
        let elapsed_seconds = ((now - self.start_time).num_milliseconds().max(0) as f64) / 1000.0;
        let remaining = self.expected.saturating_sub(completed);
        let rate = if elapsed_seconds > 0.0 {
            completed as f64 / elapsed_seconds
        } else {
            0.0
        };
        let eta_seconds = if remaining == 0 {
            Some(0.0)
        } else if rate > 0.0 {
            Some(remaining as f64 / rate)
        } else {
            None
        };
        let percentage = if self.expected == 0 {
            100.0
        } else {
            (completed as f64 / self.expected as f64 * 100.0).min(100.0)
        };

        Progress {
            expected: self.expected,
            completed,
            failed,
            remaining,
            percentage,
            elapsed_seconds,
            rate,
            eta_seconds,
            is_complete,
        }
    }

    /// True when the batch is incomplete and nothing has completed for more
    /// than `threshold` (measured from the start when nothing completed yet).
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last_activity = {
            let state = self.lock();
            if state.is_complete {
                return false;
            }
            state.completion_times.iter().max().copied()
        };
        let last_activity = last_activity.unwrap_or(self.start_time);
        self.clock.now() - last_activity > to_chrono(threshold)
    }

    /// Workers from `all_worker_ids` that neither completed nor failed, sorted.
    pub fn get_missing<'a, I>(&self, all_worker_ids: I) -> Vec<WorkerId>
    where
        I: IntoIterator<Item = &'a WorkerId>,
    {
        let (completed, failed): (HashSet<WorkerId>, HashSet<WorkerId>) = {
            let state = self.lock();
            (state.completed.clone(), state.failed.keys().cloned().collect())
        };
        all_worker_ids
            .into_iter()
            .filter(|w| !completed.contains(*w) && !failed.contains(*w))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Failed workers, sorted.
    pub fn failed_workers(&self) -> Vec<WorkerId> {
        let failed: BTreeSet<WorkerId> = self.lock().failed.keys().cloned().collect();
        failed.into_iter().collect()
    }

    pub fn get_summary(&self) -> BatchSummary {
        let (completed, failed, total, is_complete, completed_at) = {
            let state = self.lock();
            (
                state.completed.len(),
                state.failed.len(),
                state.total_item_count,
                state.is_complete,
                state.completed_at,
            )
        };
        let end = completed_at.unwrap_or_else(|| self.clock.now());

        BatchSummary {
            batch_key: self.batch_key.clone(),
            expected_players: self.expected,
            completed_players: completed,
            failed_players: failed,
            total_predictions: total,
            is_complete,
            started_at: self.start_time,
            completed_at,
            duration_seconds: ((end - self.start_time).num_milliseconds().max(0) as f64) / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn worker(id: &str) -> WorkerId {
        WorkerId::parse(id).unwrap()
    }

    fn tracker(expected: usize) -> (ProgressTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let t = ProgressTracker::new(BatchKey::parse("2024-01-15").unwrap(), expected, clock.clone());
        (t, clock)
    }

    #[test]
    fn duplicate_event_is_noop() {
        let (t, _) = tracker(3);
        assert!(!t.process_completion_event(&worker("w-17"), 10));
        assert!(!t.process_completion_event(&worker("w-17"), 25));

        assert_eq!(t.item_count(&worker("w-17")), Some(10));
        assert_eq!(t.get_summary().total_predictions, 10);
        assert_eq!(t.get_progress().completed, 1);
    }

    #[test]
    fn threshold_event_returns_true_once() {
        let (t, _) = tracker(2);
        assert!(!t.process_completion_event(&worker("a"), 1));
        assert!(t.process_completion_event(&worker("b"), 1));
        assert!(!t.process_completion_event(&worker("c"), 1));
        assert!(t.is_complete());
        assert!(t.get_summary().completed_at.is_some());
    }

    #[test]
    fn completed_and_failed_are_exclusive() {
        let (t, _) = tracker(3);
        assert!(t.mark_failed(&worker("a"), "crashed"));
        assert!(!t.mark_failed(&worker("a"), "again"));
        assert_eq!(t.failure_reason(&worker("a")).as_deref(), Some("crashed"));

        assert!(!t.process_completion_event(&worker("b"), 5));
        assert!(!t.mark_failed(&worker("b"), "late"));

        let p = t.get_progress();
        assert_eq!((p.completed, p.failed), (1, 1));
    }

    #[test]
    fn retried_worker_completion_supersedes_failure() {
        let (t, _) = tracker(2);
        assert!(t.mark_failed(&worker("a"), "crashed"));
        assert!(!t.process_completion_event(&worker("a"), 5));
        assert_eq!(t.failure_reason(&worker("a")), None);
        assert!(t.failed_workers().is_empty());

        assert!(t.process_completion_event(&worker("b"), 5));
        assert!(t.is_complete());
        let summary = t.get_summary();
        assert_eq!((summary.completed_players, summary.failed_players), (2, 0));
        assert_eq!(summary.total_predictions, 10);
    }

    #[test]
    fn progress_rate_and_eta() {
        let (t, clock) = tracker(10);
        let p = t.get_progress();
        assert_eq!(p.eta_seconds, None);
        assert_eq!(p.rate, 0.0);

        clock.advance_secs(10);
        for i in 0..5 {
            t.process_completion_event(&worker(&format!("w-{i}")), 1);
        }
        let p = t.get_progress();
        assert_eq!(p.remaining, 5);
        assert!((p.rate - 0.5).abs() < 1e-9);
        assert_eq!(p.eta_seconds, Some(10.0));
        assert!((p.percentage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stall_boundary_is_exclusive() {
        let (t, clock) = tracker(3);
        let threshold = Duration::from_secs(60);

        clock.advance_secs(60);
        assert!(!t.is_stalled(threshold), "exactly the threshold is not stalled");
        clock.advance_secs(1);
        assert!(t.is_stalled(threshold));

        t.process_completion_event(&worker("a"), 1);
        assert!(!t.is_stalled(threshold));
        clock.advance_secs(60);
        assert!(!t.is_stalled(threshold));
        clock.advance_secs(1);
        assert!(t.is_stalled(threshold));
    }

    #[test]
    fn complete_batch_is_never_stalled() {
        let (t, clock) = tracker(1);
        t.process_completion_event(&worker("a"), 1);
        clock.advance_secs(10_000);
        assert!(!t.is_stalled(Duration::from_secs(1)));
    }

    #[test]
    fn missing_excludes_completed_and_failed() {
        let (t, _) = tracker(4);
        let all: Vec<_> = ["d", "a", "c", "b"].iter().map(|w| worker(w)).collect();
        t.process_completion_event(&worker("a"), 1);
        t.mark_failed(&worker("c"), "oom");

        assert_eq!(t.get_missing(&all), vec![worker("b"), worker("d")]);
        assert_eq!(t.failed_workers(), vec![worker("c")]);
    }

    #[test]
    fn concurrent_completions_trigger_once() {
        let (t, _) = tracker(200);
        let t = Arc::new(t);
        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    let mut fired = 0;
                    // Every thread delivers every worker: heavy duplication.
                    for i in 0..200 {
                        let id = WorkerId::parse(&format!("w-{}", (i + thread * 25) % 200)).unwrap();
                        if t.process_completion_event(&id, 2) {
                            fired += 1;
                        }
                    }
                    fired
                })
            })
            .collect();
        let fired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(fired, 1);
        let summary = t.get_summary();
        assert_eq!(summary.completed_players, 200);
        assert_eq!(summary.total_predictions, 400);
    }
}
