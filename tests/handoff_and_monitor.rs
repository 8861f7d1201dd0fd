//! Handoff validation and stall detection over a live stage
//!
//! Drives a coordinator with a validator attached through a full batch, then
//! points the monitor at the same completion documents.
//!
//! Run with: `cargo test --test handoff_and_monitor`

mod common;

use common::{batch, contention_policy, worker};
use stagegate::monitor::MonitorThresholds;
use stagegate::validation::VolumeCheck;
use stagegate::{
    ChannelPublisher, CompletionOutcome, CoordinationError, CoordinationResult, Coordinator, CoordinatorSettings,
    EntityState, ExitStatus, HandoffChecks, HandoffState, HandoffValidator, ManualClock, MemoryStore, Severity,
    StageCompletionTracker, StallMonitor, StartRequest, TransitionEvent, TransitionPublisher, ValidationMode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// A bus that can be taken down and brought back.
struct SwitchablePublisher {
    down: AtomicBool,
    inner: ChannelPublisher,
}

impl TransitionPublisher for SwitchablePublisher {
    fn publish(&self, event: &TransitionEvent) -> CoordinationResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CoordinationError::Upstream("bus unavailable".into()));
        }
        self.inner.publish(event)
    }
}

fn validated(mode: ValidationMode) -> (Coordinator<MemoryStore>, Receiver<TransitionEvent>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let tracker = StageCompletionTracker::new(
        Arc::new(MemoryStore::new()),
        "predictions",
        clock.clone(),
        contention_policy(),
    );
    let (publisher, events) = ChannelPublisher::new();
    let checks = HandoffChecks::new().with_volume(VolumeCheck::new(100));
    let coordinator = Coordinator::new(tracker, Arc::new(publisher), clock.clone(), CoordinatorSettings::default())
        .with_validator(HandoffValidator::new(mode), checks);
    (coordinator, events, clock)
}

/// Five workers reporting 15 items each: 75 of an expected 100.
fn finish_short_batch(coordinator: &Coordinator<MemoryStore>) -> CompletionOutcome {
    let key = batch("2024-01-15");
    coordinator.start_stage(StartRequest::new(key.clone(), 5)).unwrap();
    let mut last = None;
    for i in 1..=5 {
        last = Some(
            coordinator
                .handle_completion(&key, &worker(&format!("w-{}", i)), 15)
                .unwrap(),
        );
    }
    last.unwrap()
}

// ============================================================================
// Handoff
// ============================================================================

#[test]
fn short_volume_warns_but_hands_off_in_warning_mode() {
    let (coordinator, events, _) = validated(ValidationMode::Warning);
    let outcome = finish_short_batch(&coordinator);
    assert!(matches!(outcome, CompletionOutcome::Triggered(_)));
    assert_eq!(events.try_iter().count(), 1);
}

#[test]
fn short_volume_blocks_in_blocking_mode() {
    let (coordinator, events, _) = validated(ValidationMode::Blocking);
    let report = match finish_short_batch(&coordinator) {
        CompletionOutcome::Blocked(report) => report,
        other => panic!("expected a blocked handoff, got {:?}", other),
    };
    assert!(!report.is_valid);
    assert_eq!(report.warnings().count(), 1);
    assert_eq!(report.errors().count(), 0);
    assert_eq!(report.exit_status(), ExitStatus::Warning);
    assert!(matches!(
        report.clone().into_result(),
        Err(CoordinationError::ValidationBlocked { .. })
    ));
    assert_eq!(events.try_iter().count(), 0);

    // The trigger already fired; an operator releases the handoff by hand.
    let key = batch("2024-01-15");
    assert!(coordinator.tracker().require(&key).unwrap().triggered);
    coordinator.publish_transition(&key, "released by operator").unwrap();
    assert_eq!(events.try_iter().count(), 1);
}

#[test]
fn blocking_on_errors_lets_a_warning_through() {
    let clock = Arc::new(ManualClock::starting_now());
    let tracker = StageCompletionTracker::new(
        Arc::new(MemoryStore::new()),
        "predictions",
        clock.clone(),
        contention_policy(),
    );
    let (publisher, events) = ChannelPublisher::new();
    let coordinator = Coordinator::new(tracker, Arc::new(publisher), clock, CoordinatorSettings::default())
        .with_validator(
            HandoffValidator::new(ValidationMode::Blocking).with_block_on(Severity::Error),
            HandoffChecks::new().with_volume(VolumeCheck::new(100)),
        );
    assert!(matches!(
        finish_short_batch(&coordinator),
        CompletionOutcome::Triggered(_)
    ));
    assert_eq!(events.try_iter().count(), 1);
}

#[test]
fn missing_workers_are_named_when_a_roster_is_checked() {
    let clock = Arc::new(ManualClock::starting_now());
    let tracker = StageCompletionTracker::new(
        Arc::new(MemoryStore::new()),
        "features",
        clock.clone(),
        contention_policy(),
    );
    let (publisher, _events) = ChannelPublisher::new();
    // Roster expects a worker that is never part of the batch.
    let checks = HandoffChecks::new().with_workers(vec![worker("w-1"), worker("w-2"), worker("w-9")]);
    let coordinator = Coordinator::new(tracker, Arc::new(publisher), clock, CoordinatorSettings::default())
        .with_validator(HandoffValidator::new(ValidationMode::Blocking), checks);

    let key = batch("2024-01-15");
    coordinator
        .start_stage(StartRequest::with_workers(key.clone(), vec![worker("w-1"), worker("w-2")]))
        .unwrap();
    coordinator.handle_completion(&key, &worker("w-1"), 3).unwrap();
    let report = match coordinator.handle_completion(&key, &worker("w-2"), 3).unwrap() {
        CompletionOutcome::Blocked(report) => report,
        other => panic!("expected a blocked handoff, got {:?}", other),
    };
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("w-9"));
}

// ============================================================================
// Monitor
// ============================================================================

#[test]
fn monitor_flags_quiet_then_stuck_batch() {
    let (coordinator, _events, clock) = validated(ValidationMode::Disabled);
    let monitor = StallMonitor::new(clock.clone(), MonitorThresholds::default());
    let key = batch("2024-01-15");
    coordinator.start_stage(StartRequest::new(key.clone(), 3)).unwrap();
    coordinator.handle_completion(&key, &worker("w-1"), 1).unwrap();

    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    assert_eq!(report.entities[0].state, EntityState::Running);
    assert_eq!(report.exit_status(), ExitStatus::Healthy);

    clock.advance_secs(31 * 60);
    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    assert_eq!(report.quiet().count(), 1);
    assert_eq!(report.exit_status(), ExitStatus::Warning);

    clock.advance_secs(4 * 3600);
    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    assert_eq!(report.exit_status(), ExitStatus::Critical);
    match report.into_result() {
        Err(CoordinationError::TimeoutDetected { entities }) => {
            assert_eq!(entities, vec!["predictions:2024-01-15".to_string()]);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
}

#[test]
fn triggered_batch_is_never_stuck() {
    let (coordinator, _events, clock) = validated(ValidationMode::Disabled);
    let monitor = StallMonitor::new(clock.clone(), MonitorThresholds::default());
    let key = batch("2024-01-15");
    coordinator.start_stage(StartRequest::new(key.clone(), 1)).unwrap();
    coordinator.handle_completion(&key, &worker("w-1"), 1).unwrap();

    clock.advance_secs(24 * 3600);
    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    assert_eq!(report.entities[0].state, EntityState::Completed);
    assert_eq!(report.exit_status(), ExitStatus::Healthy);
}

#[test]
fn publisher_outage_is_reported_until_redelivery_publishes() {
    let clock = Arc::new(ManualClock::starting_now());
    let tracker = StageCompletionTracker::new(
        Arc::new(MemoryStore::new()),
        "predictions",
        clock.clone(),
        contention_policy(),
    );
    let (inner, events) = ChannelPublisher::new();
    let publisher = Arc::new(SwitchablePublisher {
        down: AtomicBool::new(true),
        inner,
    });
    let coordinator = Coordinator::new(tracker, publisher.clone(), clock.clone(), CoordinatorSettings::default());
    let monitor = StallMonitor::new(clock.clone(), MonitorThresholds::default());
    let key = batch("2024-01-15");
    coordinator.start_stage(StartRequest::new(key.clone(), 2)).unwrap();
    coordinator.handle_completion(&key, &worker("w-1"), 5).unwrap();
    assert!(coordinator.handle_completion(&key, &worker("w-2"), 5).is_err());
    assert_eq!(events.try_iter().count(), 0);

    clock.advance_secs(6 * 60);
    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    let lost: Vec<_> = report.unpublished().map(|e| e.name.clone()).collect();
    assert_eq!(lost, vec!["predictions:2024-01-15".to_string()]);
    assert_eq!(report.exit_status(), ExitStatus::Critical);

    // Still down: the redelivered completion fails again and keeps the batch owed.
    assert!(coordinator.handle_completion(&key, &worker("w-2"), 5).is_err());
    assert_eq!(coordinator.tracker().require(&key).unwrap().handoff, HandoffState::Pending);

    publisher.down.store(false, Ordering::SeqCst);
    assert!(matches!(
        coordinator.handle_completion(&key, &worker("w-2"), 5).unwrap(),
        CompletionOutcome::Triggered(_)
    ));
    assert_eq!(events.try_iter().count(), 1);

    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    assert_eq!(report.unpublished().count(), 0);
    assert_eq!(report.exit_status(), ExitStatus::Healthy);
}

#[test]
fn blocked_batch_stays_visible_to_the_monitor() {
    let (coordinator, _events, clock) = validated(ValidationMode::Blocking);
    let monitor = StallMonitor::new(clock.clone(), MonitorThresholds::default());
    assert!(matches!(finish_short_batch(&coordinator), CompletionOutcome::Blocked(_)));

    clock.advance_secs(6 * 60);
    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    assert_eq!(report.unpublished().count(), 1);

    coordinator.publish_transition(&batch("2024-01-15"), "released by operator").unwrap();
    let report = monitor.scan_stage(coordinator.tracker()).unwrap();
    assert_eq!(report.unpublished().count(), 0);
}

#[test]
fn progress_stall_uses_strict_threshold() {
    let (coordinator, _events, clock) = validated(ValidationMode::Disabled);
    let key = batch("2024-01-15");
    let context = coordinator.start_stage(StartRequest::new(key.clone(), 2)).unwrap();
    coordinator.handle_completion(&key, &worker("w-1"), 4).unwrap();

    let threshold = Duration::from_secs(600);
    clock.advance_secs(600);
    assert!(!context.progress.is_stalled(threshold));
    clock.advance_secs(1);
    assert!(context.progress.is_stalled(threshold));

    coordinator.handle_completion(&key, &worker("w-2"), 4).unwrap();
    assert!(!context.progress.is_stalled(threshold));
}
