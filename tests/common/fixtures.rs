//! Fixture builders

use stagegate::{
    BatchKey, ChannelPublisher, Coordinator, CoordinatorSettings, ManualClock, MemoryStore, RetryPolicy,
    StageCompletionTracker, TransitionEvent, WorkerId,
};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn batch(raw: &str) -> BatchKey {
    BatchKey::parse(raw).unwrap()
}

pub fn worker(raw: &str) -> WorkerId {
    WorkerId::parse(raw).unwrap()
}

/// Generous retry bounds for tests that pile many writers onto one
/// document.
pub fn contention_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 50,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
    }
}

/// A coordinator over an in-memory store, with its event receiver and
/// clock.
pub struct Harness {
    pub coordinator: Arc<Coordinator<MemoryStore>>,
    pub events: Receiver<TransitionEvent>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
}

pub fn memory_coordinator(stage: &str, settings: CoordinatorSettings) -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new());
    let tracker = StageCompletionTracker::new(store.clone(), stage, clock.clone(), contention_policy());
    let (publisher, events) = ChannelPublisher::new();
    let coordinator = Coordinator::new(tracker, Arc::new(publisher), clock.clone(), settings);
    Harness {
        coordinator: Arc::new(coordinator),
        events,
        clock,
        store,
    }
}

/// A temporary directory holding a database path; the directory is removed
/// when the `TempDir` drops.
pub fn temp_db() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stagegate.db");
    (dir, path)
}
