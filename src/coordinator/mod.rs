//! Coordinator: the transport-independent entry point of a stage
//!
//! Binds the persisted completion tracker, one in-process progress tracker
//! per active batch, the optional handoff validator and the transition
//! publisher. Each batch gets its own [`BatchContext`]; there is no
//! process-wide "current batch".
//!
//! Inbound handlers answer with the status codes of the callback API:
//! every successful completion or failure callback is a 204, a status
//! query for an inactive batch is a 404 and starting a batch while another
//! is still running is a 409 (see [`CoordinationError::status_code`]).

mod publisher;

pub use publisher::{ChannelPublisher, LogPublisher, TransitionEvent, TransitionPublisher};

use crate::clock::Clock;
use crate::completion::StageCompletionTracker;
use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::{BatchKey, WorkerId};
use crate::progress::{BatchSummary, ProgressTracker};
use crate::storage::VersionedStore;
use crate::validation::{CompletionDataSource, HandoffChecks, HandoffValidator, ValidationReport};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Incomplete batches allowed at once on this coordinator
    pub max_active_batches: usize,
    /// Status queries report a batch as stalled past this
    pub stall_threshold: Duration,
    /// A publisher that claimed a handoff and has not finished it after
    /// this long is presumed dead; the next report retries the handoff
    pub handoff_lease: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_active_batches: 1,
            stall_threshold: Duration::from_secs(30 * 60),
            handoff_lease: Duration::from_secs(60),
        }
    }
}

/// Request to start tracking a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub batch_key: BatchKey,
    /// Defaults to the number of listed workers
    pub expected: Option<usize>,
    pub workers: Option<Vec<WorkerId>>,
}

impl StartRequest {
    pub fn new(batch_key: BatchKey, expected: usize) -> Self {
        Self {
            batch_key,
            expected: Some(expected),
            workers: None,
        }
    }

    pub fn with_workers(batch_key: BatchKey, workers: Vec<WorkerId>) -> Self {
        Self {
            batch_key,
            expected: None,
            workers: Some(workers),
        }
    }
}

/// Per-batch state held by one coordinator.
#[derive(Debug)]
pub struct BatchContext {
    pub batch_key: BatchKey,
    pub progress: ProgressTracker,
    /// Known worker roster, when the start request listed one
    pub workers: Option<BTreeSet<WorkerId>>,
}

impl BatchContext {
    pub fn missing(&self) -> Vec<WorkerId> {
        match &self.workers {
            Some(all) => self.progress.get_missing(all),
            None => Vec::new(),
        }
    }
}

/// What a completion callback did.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Recorded { completed: usize, expected: usize },
    Duplicate,
    /// This completion finished the stage and the transition was published.
    Triggered(TransitionEvent),
    /// This completion finished the stage but handoff validation withheld
    /// the transition.
    Blocked(ValidationReport),
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub batch_key: BatchKey,
    pub expected: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub percentage: f64,
    pub eta_seconds: Option<f64>,
    pub is_stalled: bool,
    pub is_complete: bool,
    pub started_at: DateTime<Utc>,
    pub missing_workers: Vec<WorkerId>,
    pub failed_workers: Vec<WorkerId>,
}

pub struct Coordinator<S: VersionedStore + ?Sized> {
    tracker: StageCompletionTracker<S>,
    batches: DashMap<BatchKey, Arc<BatchContext>>,
    publisher: Arc<dyn TransitionPublisher>,
    validator: Option<(HandoffValidator, HandoffChecks)>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    start_lock: Mutex<()>,
}

impl<S: VersionedStore + ?Sized> Coordinator<S> {
    pub fn new(
        tracker: StageCompletionTracker<S>,
        publisher: Arc<dyn TransitionPublisher>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            tracker,
            batches: DashMap::new(),
            publisher,
            validator: None,
            clock,
            settings,
            start_lock: Mutex::new(()),
        }
    }

    /// Validate every finished batch before publishing its transition.
    pub fn with_validator(mut self, validator: HandoffValidator, checks: HandoffChecks) -> Self {
        self.validator = Some((validator, checks));
        self
    }

    pub fn tracker(&self) -> &StageCompletionTracker<S> {
        &self.tracker
    }

    pub fn context(&self, batch_key: &BatchKey) -> Option<Arc<BatchContext>> {
        self.batches.get(batch_key).map(|r| Arc::clone(r.value()))
    }

    /// Active batch keys, sorted.
    pub fn active_batches(&self) -> Vec<BatchKey> {
        let mut keys: Vec<BatchKey> = self.batches.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Start tracking a batch.
    ///
    /// Fails with `BatchConflict` when the same batch, or as many other
    /// batches as allowed, are active and incomplete. A batch counts as
    /// finished once either its local progress or its persisted document
    /// says so; finished contexts are dropped here.
    pub fn start_stage(&self, request: StartRequest) -> CoordinationResult<Arc<BatchContext>> {
        let workers: Option<BTreeSet<WorkerId>> = request.workers.map(|w| w.into_iter().collect());
        let expected = request
            .expected
            .or_else(|| workers.as_ref().map(|w| w.len()))
            .ok_or_else(|| {
                CoordinationError::InvalidInput(format!(
                    "batch {} needs an expected count or a worker list",
                    request.batch_key
                ))
            })?;

        let _guard = self.start_lock.lock().unwrap_or_else(|e| e.into_inner());

        let contexts: Vec<Arc<BatchContext>> = self.batches.iter().map(|r| Arc::clone(r.value())).collect();
        let mut running = Vec::new();
        for context in contexts {
            if self.is_finished(&context)? {
                self.batches.remove(&context.batch_key);
            } else {
                running.push(context);
            }
        }
        let blocking = running.iter().find(|c| c.batch_key == request.batch_key).or_else(|| {
            if running.len() >= self.settings.max_active_batches {
                running.first()
            } else {
                None
            }
        });
        if let Some(active) = blocking {
            let progress = active.progress.get_progress();
            return Err(CoordinationError::BatchConflict {
                batch_key: active.batch_key.to_string(),
                completed: progress.completed,
                expected: progress.expected,
            });
        }

        let doc = self.tracker.register_batch(&request.batch_key, expected)?;
        let context = Arc::new(BatchContext {
            batch_key: request.batch_key.clone(),
            progress: ProgressTracker::new(request.batch_key.clone(), doc.expected_count, Arc::clone(&self.clock)),
            workers,
        });
        self.batches.insert(request.batch_key.clone(), Arc::clone(&context));

        tracing::info!(
            stage = %self.tracker.stage(),
            batch_key = %request.batch_key,
            expected = doc.expected_count,
            "stage started"
        );
        Ok(context)
    }

    fn is_finished(&self, context: &BatchContext) -> CoordinationResult<bool> {
        if context.progress.is_complete() {
            return Ok(true);
        }
        Ok(self.tracker.get(&context.batch_key)?.is_some_and(|doc| doc.triggered))
    }

    /// Completion callback. Safe to call any number of times with the same
    /// payload; only the completion that finishes the stage publishes.
    ///
    /// When an earlier handoff failed (validator or publisher error, or a
    /// publisher that died mid-handoff), the next report for the batch,
    /// duplicate or not, retries it.
    pub fn handle_completion(
        &self,
        batch_key: &BatchKey,
        worker_id: &WorkerId,
        item_count: u64,
    ) -> CoordinationResult<CompletionOutcome> {
        let receipt = self.tracker.report_completion(batch_key, worker_id, item_count)?;
        if let Some(context) = self.context(batch_key) {
            context.progress.process_completion_event(worker_id, item_count);
        }

        if receipt.triggered_now {
            return self.hand_off(batch_key, receipt.expected);
        }
        if receipt.awaiting_handoff && self.tracker.claim_handoff(batch_key, self.settings.handoff_lease)? {
            return self.hand_off(batch_key, receipt.expected);
        }

        if receipt.duplicate {
            return Ok(CompletionOutcome::Duplicate);
        }
        Ok(CompletionOutcome::Recorded {
            completed: receipt.completed,
            expected: receipt.expected,
        })
    }

    /// Validate and publish a batch whose handoff this caller has claimed.
    /// Any error hands the claim back so a later report can retry.
    fn hand_off(&self, batch_key: &BatchKey, expected: usize) -> CoordinationResult<CompletionOutcome> {
        let result = self.validate_and_publish(batch_key, expected);
        if let Err(e) = &result {
            if let Err(release_err) = self.tracker.release_handoff(batch_key, &e.to_string()) {
                tracing::error!(
                    stage = %self.tracker.stage(),
                    batch_key = %batch_key,
                    error = %release_err,
                    "could not release handoff claim; it is retried once the lease runs out"
                );
            }
        }
        result
    }

    fn validate_and_publish(&self, batch_key: &BatchKey, expected: usize) -> CoordinationResult<CompletionOutcome> {
        if let Some((validator, checks)) = &self.validator {
            let source = CompletionDataSource::new(&self.tracker);
            let report = validator.validate(&source, batch_key, checks)?;
            if !report.is_valid {
                tracing::error!(
                    stage = %self.tracker.stage(),
                    batch_key = %batch_key,
                    issues = report.issues.len(),
                    "stage complete but handoff blocked; transition withheld"
                );
                let summary = report.issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ");
                self.tracker.mark_blocked(batch_key, &summary)?;
                return Ok(CompletionOutcome::Blocked(report));
            }
        }

        let reason = format!("all {} workers completed", expected);
        let event = self.publish_transition(batch_key, &reason)?;
        Ok(CompletionOutcome::Triggered(event))
    }

    /// Record a worker's quality score for one table of the batch.
    pub fn record_quality(
        &self,
        batch_key: &BatchKey,
        worker_id: &WorkerId,
        table: &str,
        score: f64,
    ) -> CoordinationResult<bool> {
        self.tracker.report_quality(batch_key, worker_id, table, score)
    }

    /// Failure callback. Returns whether anything changed.
    pub fn handle_failure(&self, batch_key: &BatchKey, worker_id: &WorkerId, reason: &str) -> CoordinationResult<bool> {
        let changed = self.tracker.report_failure(batch_key, worker_id, reason)?;
        if let Some(context) = self.context(batch_key) {
            context.progress.mark_failed(worker_id, reason);
        }
        Ok(changed)
    }

    /// Publish the transition for a batch and mark its handoff published.
    /// Used for the automatic trigger and by operators releasing a blocked
    /// handoff.
    pub fn publish_transition(&self, batch_key: &BatchKey, reason: &str) -> CoordinationResult<TransitionEvent> {
        let event = TransitionEvent::new(batch_key.clone(), self.tracker.stage(), reason, self.clock.now());
        if let Err(e) = self.publisher.publish(&event) {
            tracing::error!(
                stage = %event.stage,
                batch_key = %batch_key,
                correlation_id = %event.correlation_id,
                error = %e,
                "transition publish failed; batch is already triggered"
            );
            return Err(e);
        }
        tracing::info!(
            stage = %event.stage,
            batch_key = %batch_key,
            correlation_id = %event.correlation_id,
            "transition published"
        );
        // The event is out; failing to record that only risks a republish
        // after the lease, so it is not an error for the caller.
        if let Err(e) = self.tracker.mark_published(batch_key) {
            tracing::error!(
                stage = %event.stage,
                batch_key = %batch_key,
                correlation_id = %event.correlation_id,
                error = %e,
                "transition published but not recorded"
            );
        }
        Ok(event)
    }

    /// Live status of an active batch; `BatchNotFound` (404) otherwise.
    pub fn status(&self, batch_key: &BatchKey) -> CoordinationResult<StatusView> {
        let context = self
            .context(batch_key)
            .ok_or_else(|| CoordinationError::BatchNotFound(batch_key.to_string()))?;
        let progress = context.progress.get_progress();

        Ok(StatusView {
            batch_key: batch_key.clone(),
            expected: progress.expected,
            completed: progress.completed,
            failed: progress.failed,
            remaining: progress.remaining,
            percentage: progress.percentage,
            eta_seconds: progress.eta_seconds,
            is_stalled: context.progress.is_stalled(self.settings.stall_threshold),
            is_complete: progress.is_complete,
            started_at: context.progress.start_time(),
            missing_workers: context.missing(),
            failed_workers: context.progress.failed_workers(),
        })
    }

    pub fn summary(&self, batch_key: &BatchKey) -> CoordinationResult<BatchSummary> {
        self.context(batch_key)
            .map(|c| c.progress.get_summary())
            .ok_or_else(|| CoordinationError::BatchNotFound(batch_key.to_string()))
    }

    /// Stop tracking a batch locally. The persisted document is kept.
    pub fn close_batch(&self, batch_key: &BatchKey) -> Option<Arc<BatchContext>> {
        self.batches.remove(batch_key).map(|(_, c)| c)
    }
}
