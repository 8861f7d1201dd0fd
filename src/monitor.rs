//! Timeout and stall detection
//!
//! The monitor classifies entities (usually batches of one stage) as
//! not started, running, completed or stuck, and reports running entities
//! that went quiet and completed ones whose transition never went out. It
//! never touches the entities it observes: remediation
//! belongs to the self-heal agent or an operator.

use crate::clock::{to_chrono, Clock};
use crate::completion::{HandoffState, StageCompletionDocument, StageCompletionTracker};
use crate::error::{CoordinationError, CoordinationResult, ExitStatus};
use crate::storage::VersionedStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    NotStarted,
    Running,
    Completed,
    Stuck,
}

/// Time signals for one observed entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredEntity {
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent progress; falls back to `started_at` when absent
    pub last_progress_at: Option<DateTime<Utc>>,
    /// Completed and expected units, for the report
    pub progress: Option<(usize, usize)>,
    /// Completed, but the downstream transition has not been published
    pub unpublished_since: Option<DateTime<Utc>>,
}

impl MonitoredEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: None,
            completed_at: None,
            last_progress_at: None,
            progress: None,
            unpublished_since: None,
        }
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn progressed(mut self, at: DateTime<Utc>) -> Self {
        self.last_progress_at = Some(at);
        self
    }

    pub fn unpublished_since(mut self, at: DateTime<Utc>) -> Self {
        self.unpublished_since = Some(at);
        self
    }

    /// A batch is running from registration until it triggers, and owes a
    /// transition from its trigger until that transition is published.
    pub fn from_document(stage: &str, doc: &StageCompletionDocument) -> Self {
        Self {
            name: format!("{}:{}", stage, doc.batch_key),
            started_at: Some(doc.created_at),
            completed_at: doc.triggered_at,
            last_progress_at: doc.last_completion_at,
            progress: Some((doc.completed_count(), doc.expected_count)),
            unpublished_since: doc.triggered_at.filter(|_| doc.handoff != HandoffState::Published),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorThresholds {
    /// Running longer than this is stuck
    pub max_duration: Duration,
    /// No progress for longer than this is quiet
    pub stall_threshold: Duration,
    /// Completed but unpublished for longer than this is a lost transition
    pub handoff_grace: Duration,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(4 * 3600),
            stall_threshold: Duration::from_secs(30 * 60),
            handoff_grace: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStatus {
    pub name: String,
    pub state: EntityState,
    /// Running, not stuck, and without progress past the stall threshold
    pub quiet: bool,
    /// Completed, with its transition unpublished past the handoff grace
    pub unpublished: bool,
    pub elapsed_seconds: Option<i64>,
    pub idle_seconds: Option<i64>,
    pub progress: Option<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    pub checked_at: DateTime<Utc>,
    pub entities: Vec<EntityStatus>,
}

impl MonitorReport {
    pub fn stuck(&self) -> impl Iterator<Item = &EntityStatus> {
        self.entities.iter().filter(|e| e.state == EntityState::Stuck)
    }

    pub fn quiet(&self) -> impl Iterator<Item = &EntityStatus> {
        self.entities.iter().filter(|e| e.quiet)
    }

    pub fn unpublished(&self) -> impl Iterator<Item = &EntityStatus> {
        self.entities.iter().filter(|e| e.unpublished)
    }

    /// Critical when anything is stuck or lost its transition, warning
    /// when something went quiet.
    pub fn exit_status(&self) -> ExitStatus {
        if self.stuck().next().is_some() || self.unpublished().next().is_some() {
            ExitStatus::Critical
        } else if self.quiet().next().is_some() {
            ExitStatus::Warning
        } else {
            ExitStatus::Healthy
        }
    }

    /// `TimeoutDetected` naming every stuck entity, if any.
    pub fn into_result(self) -> CoordinationResult<MonitorReport> {
        let entities: Vec<String> = self.stuck().map(|e| e.name.clone()).collect();
        if entities.is_empty() {
            Ok(self)
        } else {
            Err(CoordinationError::TimeoutDetected { entities })
        }
    }
}

/// Detect-only timeout monitor.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    clock: Arc<dyn Clock>,
    thresholds: MonitorThresholds,
}

impl StallMonitor {
    pub fn new(clock: Arc<dyn Clock>, thresholds: MonitorThresholds) -> Self {
        Self { clock, thresholds }
    }

    pub fn thresholds(&self) -> MonitorThresholds {
        self.thresholds
    }

    pub fn classify(&self, entity: &MonitoredEntity, now: DateTime<Utc>) -> EntityStatus {
        let elapsed = entity.started_at.map(|s| now - s);
        let idle = entity.last_progress_at.or(entity.started_at).map(|p| now - p);

        let state = match (entity.started_at, entity.completed_at) {
            (_, Some(_)) => EntityState::Completed,
            (None, None) => EntityState::NotStarted,
            (Some(_), None) => match elapsed {
                Some(e) if e > to_chrono(self.thresholds.max_duration) => EntityState::Stuck,
                _ => EntityState::Running,
            },
        };
        let quiet = state == EntityState::Running
            && idle.is_some_and(|i| i > to_chrono(self.thresholds.stall_threshold));
        let unpublished = state == EntityState::Completed
            && entity
                .unpublished_since
                .is_some_and(|since| now - since > to_chrono(self.thresholds.handoff_grace));

        EntityStatus {
            name: entity.name.clone(),
            state,
            quiet,
            unpublished,
            elapsed_seconds: elapsed.map(|e| e.num_seconds()),
            idle_seconds: idle.map(|i| i.num_seconds()),
            progress: entity.progress,
        }
    }

    pub fn scan<I>(&self, entities: I) -> MonitorReport
    where
        I: IntoIterator<Item = MonitoredEntity>,
    {
        let now = self.clock.now();
        let entities: Vec<EntityStatus> = entities.into_iter().map(|e| self.classify(&e, now)).collect();

        for status in &entities {
            if status.state == EntityState::Stuck {
                tracing::error!(
                    entity = %status.name,
                    elapsed_seconds = status.elapsed_seconds,
                    progress = ?status.progress,
                    "entity exceeded max duration"
                );
            } else if status.unpublished {
                tracing::error!(
                    entity = %status.name,
                    progress = ?status.progress,
                    "entity completed but its transition was never published"
                );
            } else if status.quiet {
                tracing::warn!(
                    entity = %status.name,
                    idle_seconds = status.idle_seconds,
                    progress = ?status.progress,
                    "entity has gone quiet"
                );
            }
        }
        tracing::debug!(checked = entities.len(), "monitor scan finished");

        MonitorReport { checked_at: now, entities }
    }

    /// Scan every batch the tracker knows about.
    pub fn scan_stage<S: VersionedStore + ?Sized>(
        &self,
        tracker: &StageCompletionTracker<S>,
    ) -> CoordinationResult<MonitorReport> {
        let docs = tracker.list()?;
        Ok(self.scan(docs.iter().map(|d| MonitoredEntity::from_document(tracker.stage(), d))))
    }
}
