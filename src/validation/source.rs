//! Data sources the handoff validator reads from

use crate::completion::StageCompletionTracker;
use crate::error::CoordinationResult;
use crate::keys::{BatchKey, WorkerId};
use crate::storage::VersionedStore;
use std::collections::{BTreeMap, BTreeSet};

/// Read-only view of what a stage produced for a batch.
pub trait HandoffDataSource {
    /// Total items produced for the batch
    fn actual_volume(&self, batch_key: &BatchKey) -> CoordinationResult<u64>;

    /// Workers that completed the batch
    fn completed_workers(&self, batch_key: &BatchKey) -> CoordinationResult<BTreeSet<WorkerId>>;

    /// Quality scores recorded for one table; empty when none exist
    fn quality_scores(&self, batch_key: &BatchKey, table: &str) -> CoordinationResult<Vec<f64>>;
}

/// Source backed by the persisted completion documents of one stage.
///
/// Volume is the sum of reported item counts; quality scores are the ones
/// workers reported alongside their completions.
pub struct CompletionDataSource<'a, S: VersionedStore + ?Sized> {
    tracker: &'a StageCompletionTracker<S>,
}

impl<'a, S: VersionedStore + ?Sized> CompletionDataSource<'a, S> {
    pub fn new(tracker: &'a StageCompletionTracker<S>) -> Self {
        Self { tracker }
    }
}

impl<S: VersionedStore + ?Sized> HandoffDataSource for CompletionDataSource<'_, S> {
    fn actual_volume(&self, batch_key: &BatchKey) -> CoordinationResult<u64> {
        Ok(self.tracker.require(batch_key)?.total_items())
    }

    fn completed_workers(&self, batch_key: &BatchKey) -> CoordinationResult<BTreeSet<WorkerId>> {
        Ok(self.tracker.require(batch_key)?.completed_worker_ids)
    }

    fn quality_scores(&self, batch_key: &BatchKey, table: &str) -> CoordinationResult<Vec<f64>> {
        Ok(self
            .tracker
            .require(batch_key)?
            .quality_scores
            .get(table)
            .map(|scores| scores.values().copied().collect())
            .unwrap_or_default())
    }
}

/// Fixed values, for callers that already computed their metrics.
#[derive(Debug, Clone, Default)]
pub struct StaticDataSource {
    volume: u64,
    workers: BTreeSet<WorkerId>,
    quality: BTreeMap<String, Vec<f64>>,
}

impl StaticDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_volume(mut self, volume: u64) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_workers(mut self, workers: impl IntoIterator<Item = WorkerId>) -> Self {
        self.workers = workers.into_iter().collect();
        self
    }

    pub fn with_quality(mut self, table: impl Into<String>, scores: Vec<f64>) -> Self {
        self.quality.insert(table.into(), scores);
        self
    }
}

impl HandoffDataSource for StaticDataSource {
    fn actual_volume(&self, _batch_key: &BatchKey) -> CoordinationResult<u64> {
        Ok(self.volume)
    }

    fn completed_workers(&self, _batch_key: &BatchKey) -> CoordinationResult<BTreeSet<WorkerId>> {
        Ok(self.workers.clone())
    }

    fn quality_scores(&self, _batch_key: &BatchKey, table: &str) -> CoordinationResult<Vec<f64>> {
        Ok(self.quality.get(table).cloned().unwrap_or_default())
    }
}
