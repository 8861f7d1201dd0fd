//! SelfHealAgent: bounded polling retry of deferred work

use super::item::{ItemStatus, RetryableWorkItem};
use crate::clock::{checked_before, Clock};
use crate::error::{CoordinationError, CoordinationResult, ExitStatus};
use crate::keys::normalize_key;
use crate::storage::{
    Mutation, RetryPolicy, TransactionRunner, Versioned, VersionedStore, WritePrecondition, WriteResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Namespace holding retryable work items.
pub const HEAL_NAMESPACE: &str = "self_heal";

/// Side-effect-free check whether upstream data for an item is now present.
pub trait ReadinessCheck: Send + Sync {
    fn is_ready(&self, item: &RetryableWorkItem) -> CoordinationResult<bool>;
}

/// One downstream step re-run after an item becomes ready.
pub trait RerunStep: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, item: &RetryableWorkItem) -> CoordinationResult<()>;
}

/// How a cycle with failed re-run steps is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialFailurePolicy {
    /// Partial re-runs count as success.
    Success,
    /// Partial re-runs are a warning (exit 1).
    #[default]
    Warn,
    /// Partial re-runs are a failure (exit 2).
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealSettings {
    pub default_max_checks: u32,
    /// Only items younger than this are polled
    pub lookback: Duration,
    /// Terminal items older than this are purged
    pub retention: Duration,
    pub partial_failure: PartialFailurePolicy,
}

impl Default for HealSettings {
    fn default() -> Self {
        Self {
            default_max_checks: 12,
            lookback: Duration::from_secs(48 * 3600),
            retention: Duration::from_secs(7 * 86_400),
            partial_failure: PartialFailurePolicy::default(),
        }
    }
}

/// Per-cycle overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOptions {
    /// Evaluate readiness without writing or running steps
    pub dry_run: bool,
    pub lookback: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealAction {
    /// Ready; steps ran (or would have, in a dry run)
    Completed,
    /// Not ready; check counted, item stays pending
    StillPending,
    /// Not ready for the last allowed time
    Failed,
    /// Another cycle changed the item first
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub item_id: String,
    pub action: HealAction,
    pub check_count: u32,
    pub max_checks: u32,
    /// Re-run steps that returned an error
    pub failed_steps: Vec<String>,
    pub last_error: Option<String>,
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealCycleReport {
    pub dry_run: bool,
    pub examined: usize,
    pub results: Vec<ItemResult>,
    #[serde(skip)]
    pub policy: PartialFailurePolicy,
}

impl HealCycleReport {
    pub fn count(&self, action: HealAction) -> usize {
        self.results.iter().filter(|r| r.action == action).count()
    }

    /// Completed items with at least one failed step.
    pub fn partial(&self) -> impl Iterator<Item = &ItemResult> {
        self.results
            .iter()
            .filter(|r| r.action == HealAction::Completed && !r.failed_steps.is_empty())
    }

    /// `MaxRetriesExceeded` for every item that failed this cycle.
    pub fn alerts(&self) -> Vec<CoordinationError> {
        self.results
            .iter()
            .filter(|r| r.action == HealAction::Failed)
            .map(|r| CoordinationError::MaxRetriesExceeded {
                item_id: r.item_id.clone(),
                check_count: r.check_count,
                max_checks: r.max_checks,
                last_error: r.last_error.clone().unwrap_or_else(|| "condition never met".to_string()),
            })
            .collect()
    }

    pub fn exit_status(&self) -> ExitStatus {
        let partial = match (self.partial().next().is_some(), self.policy) {
            (false, _) | (true, PartialFailurePolicy::Success) => ExitStatus::Healthy,
            (true, PartialFailurePolicy::Warn) => ExitStatus::Warning,
            (true, PartialFailurePolicy::Failure) => ExitStatus::Critical,
        };
        let failed = if self.count(HealAction::Failed) > 0 {
            ExitStatus::Critical
        } else {
            ExitStatus::Healthy
        };
        partial.worst(failed)
    }
}

/// Polls pending items, re-drives the pipeline when they become ready and
/// gives up after a bounded number of checks.
pub struct SelfHealAgent<S: VersionedStore + ?Sized> {
    runner: TransactionRunner<S>,
    clock: Arc<dyn Clock>,
    readiness: Arc<dyn ReadinessCheck>,
    steps: Vec<Arc<dyn RerunStep>>,
    settings: HealSettings,
}

impl<S: VersionedStore + ?Sized> SelfHealAgent<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        readiness: Arc<dyn ReadinessCheck>,
        settings: HealSettings,
    ) -> Self {
        Self {
            runner: TransactionRunner::new(store, HEAL_NAMESPACE, RetryPolicy::default()),
            clock,
            readiness,
            steps: Vec::new(),
            settings,
        }
    }

    /// Append a re-run step; steps run in insertion order.
    pub fn with_step(mut self, step: Arc<dyn RerunStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn settings(&self) -> HealSettings {
        self.settings
    }

    /// Create a pending item unless one with the same id exists.
    pub fn enqueue(
        &self,
        item_id: &str,
        max_checks: Option<u32>,
        context: BTreeMap<String, String>,
    ) -> CoordinationResult<RetryableWorkItem> {
        let item_id = normalize_key(item_id);
        if item_id.is_empty() {
            return Err(CoordinationError::InvalidInput("item id is empty".to_string()));
        }
        let max_checks = max_checks.unwrap_or(self.settings.default_max_checks);
        if max_checks == 0 {
            return Err(CoordinationError::InvalidInput(format!(
                "item {} needs at least one check",
                item_id
            )));
        }
        let now = self.clock.now();

        let (item, created) = self.runner.run(&item_id, |current: Option<Versioned<RetryableWorkItem>>| {
            Ok(match current {
                Some(existing) => Mutation::Keep((existing.value, false)),
                None => {
                    let item = RetryableWorkItem::new(item_id.clone(), max_checks, context.clone(), now);
                    Mutation::Write(item.clone(), (item, true))
                }
            })
        })?;
        if created {
            tracing::info!(item_id = %item.item_id, max_checks, "work item enqueued");
        }
        Ok(item)
    }

    pub fn get(&self, item_id: &str) -> CoordinationResult<Option<RetryableWorkItem>> {
        Ok(self
            .runner
            .load::<RetryableWorkItem>(&normalize_key(item_id))?
            .map(|v| v.value))
    }

    pub fn list(&self) -> CoordinationResult<Vec<RetryableWorkItem>> {
        Ok(self
            .runner
            .load_all::<RetryableWorkItem>()?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// One poll cycle over pending items inside the lookback window.
    pub fn run_cycle(&self, options: CycleOptions) -> CoordinationResult<HealCycleReport> {
        let now = self.clock.now();
        let lookback = options.lookback.unwrap_or(self.settings.lookback);
        let since = checked_before(now, lookback)?;

        let pending: Vec<Versioned<RetryableWorkItem>> = self
            .runner
            .load_all::<RetryableWorkItem>()?
            .into_iter()
            .filter(|v| v.value.status == ItemStatus::Pending && v.value.created_at >= since)
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for Versioned { value: item, version } in pending {
            results.push(self.process(item, version, options.dry_run)?);
        }

        let report = HealCycleReport {
            dry_run: options.dry_run,
            examined: results.len(),
            results,
            policy: self.settings.partial_failure,
        };
        tracing::info!(
            dry_run = report.dry_run,
            examined = report.examined,
            completed = report.count(HealAction::Completed),
            pending = report.count(HealAction::StillPending),
            failed = report.count(HealAction::Failed),
            skipped = report.count(HealAction::Skipped),
            "self-heal cycle finished"
        );
        Ok(report)
    }

    fn process(&self, item: RetryableWorkItem, version: u64, dry_run: bool) -> CoordinationResult<ItemResult> {
        let now = self.clock.now();
        let (ready, check_error) = match self.readiness.is_ready(&item) {
            Ok(ready) => (ready, None),
            Err(e) => {
                tracing::warn!(item_id = %item.item_id, error = %e, "readiness check failed");
                (false, Some(e.to_string()))
            }
        };

        let mut next = item.clone();
        let action = if ready {
            next.record_ready(now);
            HealAction::Completed
        } else {
            match next.record_miss(check_error, now) {
                ItemStatus::Failed => HealAction::Failed,
                _ => HealAction::StillPending,
            }
        };

        let mut result = ItemResult {
            item_id: next.item_id.clone(),
            action,
            check_count: next.check_count,
            max_checks: next.max_checks,
            failed_steps: Vec::new(),
            last_error: next.last_error.clone(),
            context: next.context.clone(),
        };
        if dry_run {
            tracing::info!(item_id = %item.item_id, action = ?action, "dry run: no changes written");
            return Ok(result);
        }

        // Claim the transition against the version we read. Losing the race
        // means another cycle already handled this check.
        let body = serde_json::to_string(&next)?;
        let written = match self.runner.store().put(
            HEAL_NAMESPACE,
            &item.item_id,
            &body,
            WritePrecondition::MatchesVersion(version),
        ) {
            Ok(WriteResult::Success { .. }) => true,
            Ok(WriteResult::PreconditionFailed { .. }) => false,
            Err(e) if e.is_transient() => {
                tracing::warn!(item_id = %item.item_id, error = %e, "transient store error, skipping item this cycle");
                false
            }
            Err(e) => return Err(e.into()),
        };
        if !written {
            tracing::debug!(item_id = %item.item_id, "item changed concurrently, skipped");
            result.action = HealAction::Skipped;
            return Ok(result);
        }

        match action {
            HealAction::Completed => {
                tracing::info!(item_id = %next.item_id, check_count = next.check_count, "upstream ready, re-running downstream steps");
                for step in &self.steps {
                    if let Err(e) = step.run(&next) {
                        tracing::warn!(item_id = %next.item_id, step = step.name(), error = %e, "re-run step failed, continuing");
                        result.failed_steps.push(step.name().to_string());
                    }
                }
            }
            HealAction::Failed => tracing::error!(
                item_id = %next.item_id,
                check_count = next.check_count,
                max_checks = next.max_checks,
                last_error = ?next.last_error,
                context = ?next.context,
                "max retries exceeded, item failed"
            ),
            _ => tracing::debug!(
                item_id = %next.item_id,
                check_count = next.check_count,
                max_checks = next.max_checks,
                "upstream not ready yet"
            ),
        }
        Ok(result)
    }

    /// Delete terminal items that finished before the retention window.
    pub fn purge_terminal(&self, retention: Option<Duration>) -> CoordinationResult<usize> {
        let cutoff = checked_before(self.clock.now(), retention.unwrap_or(self.settings.retention))?;
        let mut purged = 0;
        for Versioned { value: item, version } in self.runner.load_all::<RetryableWorkItem>()? {
            let expired = item.is_terminal() && item.finished_at.is_some_and(|t| t < cutoff);
            if !expired {
                continue;
            }
            let deleted = self
                .runner
                .store()
                .delete(HEAL_NAMESPACE, &item.item_id, WritePrecondition::MatchesVersion(version))?
                .is_success();
            if deleted {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, %cutoff, "purged terminal work items");
        }
        Ok(purged)
    }
}
