//! Configuration file (YAML)
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are whole seconds (or milliseconds where noted).

use crate::coordinator::CoordinatorSettings;
use crate::error::{CoordinationError, CoordinationResult};
use crate::heal::{HealSettings, PartialFailurePolicy, ShellCommand};
use crate::keys::WorkerId;
use crate::lock::{DEFAULT_LOCK_TTL, MAX_LOCK_TTL};
use crate::monitor::MonitorThresholds;
use crate::storage::{RetryPolicy, DEFAULT_BUSY_TIMEOUT};
use crate::validation::{
    HandoffChecks, QualityCheck, Severity, ValidationMode, VolumeCheck, DEFAULT_VOLUME_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest lookback or retention window accepted, in seconds (100 years).
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 86_400;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagegateConfig {
    pub stage: StageConfig,
    pub store: StoreConfig,
    pub transaction: TransactionConfig,
    pub progress: ProgressConfig,
    pub monitor: MonitorConfig,
    pub lock: LockConfig,
    pub handoff: HandoffConfig,
    pub self_heal: SelfHealConfig,
    pub coordinator: CoordinatorConfig,
}

impl StagegateConfig {
    pub fn from_file(path: &Path) -> CoordinationResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoordinationError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate.
    pub fn from_yaml(content: &str) -> CoordinationResult<Self> {
        // An empty document deserializes to null rather than an empty map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| CoordinationError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> CoordinationResult<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        let fail = |msg: &str| Err(CoordinationError::Config(msg.to_string()));

        if self.stage.name.trim().is_empty() {
            return fail("stage.name must not be empty");
        }
        if self.transaction.max_attempts == 0 {
            return fail("transaction.max_attempts must be at least 1");
        }
        if self.transaction.base_backoff_ms > self.transaction.max_backoff_ms {
            return fail("transaction.base_backoff_ms must not exceed max_backoff_ms");
        }
        if self.monitor.max_duration_secs == 0 {
            return fail("monitor.max_duration_secs must be positive");
        }
        if self.lock.ttl_secs == 0 {
            return fail("lock.ttl_secs must be positive");
        }
        if self.lock.ttl_secs > MAX_LOCK_TTL.as_secs() {
            return fail("lock.ttl_secs exceeds the maximum lock ttl");
        }
        if self.lock.acquire_attempts == 0 {
            return fail("lock.acquire_attempts must be at least 1");
        }
        if !(self.handoff.volume_threshold > 0.0 && self.handoff.volume_threshold <= 1.0) {
            return fail("handoff.volume_threshold must be in (0, 1]");
        }
        if self.handoff.quality_min_score < 0.0 {
            return fail("handoff.quality_min_score must not be negative");
        }
        if self.self_heal.max_checks == 0 {
            return fail("self_heal.max_checks must be at least 1");
        }
        if self.self_heal.poll_interval_secs == 0 {
            return fail("self_heal.poll_interval_secs must be positive");
        }
        if self.self_heal.command_timeout_secs == 0 {
            return fail("self_heal.command_timeout_secs must be positive");
        }
        if self.coordinator.max_active_batches == 0 {
            return fail("coordinator.max_active_batches must be at least 1");
        }
        if self.coordinator.handoff_lease_secs == 0 {
            return fail("coordinator.handoff_lease_secs must be positive");
        }
        let within_window = |value: u64, unit_secs: u64| {
            value.checked_mul(unit_secs).is_some_and(|secs| secs <= MAX_WINDOW_SECS)
        };
        if !within_window(self.self_heal.lookback_hours, 3600) {
            return fail("self_heal.lookback_hours is out of range");
        }
        if !within_window(self.self_heal.retention_days, 86_400) {
            return fail("self_heal.retention_days is out of range");
        }
        if !within_window(self.coordinator.retention_days, 86_400) {
            return fail("coordinator.retention_days is out of range");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Stage whose batches this process coordinates
    pub name: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database; the platform data directory when unset
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_BUSY_TIMEOUT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_backoff_ms: policy.base_delay.as_millis() as u64,
            max_backoff_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl TransactionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub stall_threshold_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: CoordinatorSettings::default().stall_threshold.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub max_duration_secs: u64,
    pub stall_threshold_secs: u64,
    /// Triggered batches unpublished for longer than this are reported
    pub handoff_grace_secs: u64,
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let thresholds = MonitorThresholds::default();
        Self {
            max_duration_secs: thresholds.max_duration.as_secs(),
            stall_threshold_secs: thresholds.stall_threshold.as_secs(),
            handoff_grace_secs: thresholds.handoff_grace.as_secs(),
            interval_secs: 300,
        }
    }
}

impl MonitorConfig {
    pub fn thresholds(&self) -> MonitorThresholds {
        MonitorThresholds {
            max_duration: Duration::from_secs(self.max_duration_secs),
            stall_threshold: Duration::from_secs(self.stall_threshold_secs),
            handoff_grace: Duration::from_secs(self.handoff_grace_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
    pub acquire_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LOCK_TTL.as_secs(),
            acquire_attempts: 5,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Backoff used while waiting for a held lock.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.acquire_attempts,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub mode: ValidationMode,
    pub block_on: Severity,
    pub volume_threshold: f64,
    /// Volume check runs only when set
    pub expected_volume: Option<u64>,
    /// Worker check runs only when non-empty
    pub expected_workers: Vec<String>,
    /// Quality check runs only when non-empty
    pub quality_tables: Vec<String>,
    pub quality_min_score: f64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::default(),
            block_on: Severity::Warning,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            expected_volume: None,
            expected_workers: Vec::new(),
            quality_tables: Vec::new(),
            quality_min_score: 0.7,
        }
    }
}

impl HandoffConfig {
    pub fn checks(&self) -> CoordinationResult<HandoffChecks> {
        let mut checks = HandoffChecks::new();
        if let Some(expected) = self.expected_volume {
            checks = checks.with_volume(VolumeCheck::new(expected).with_threshold(self.volume_threshold));
        }
        if !self.expected_workers.is_empty() {
            let workers = self
                .expected_workers
                .iter()
                .map(|w| WorkerId::parse(w))
                .collect::<CoordinationResult<Vec<_>>>()?;
            checks = checks.with_workers(workers);
        }
        if !self.quality_tables.is_empty() {
            checks = checks.with_quality(QualityCheck {
                tables: self.quality_tables.clone(),
                min_score: self.quality_min_score,
            });
        }
        Ok(checks)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfHealConfig {
    pub max_checks: u32,
    pub lookback_hours: u64,
    pub retention_days: u64,
    pub poll_interval_secs: u64,
    pub partial_failure: PartialFailurePolicy,
    /// Shell command; exit status 0 means upstream data is ready
    pub readiness_command: Option<String>,
    pub rerun_steps: Vec<RerunStepConfig>,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerunStepConfig {
    pub name: String,
    pub command: String,
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        let settings = HealSettings::default();
        Self {
            max_checks: settings.default_max_checks,
            lookback_hours: settings.lookback.as_secs() / 3600,
            retention_days: settings.retention.as_secs() / 86_400,
            poll_interval_secs: 900,
            partial_failure: settings.partial_failure,
            readiness_command: None,
            rerun_steps: Vec::new(),
            command_timeout_secs: 300,
        }
    }
}

impl SelfHealConfig {
    pub fn settings(&self) -> HealSettings {
        HealSettings {
            default_max_checks: self.max_checks,
            lookback: Duration::from_secs(self.lookback_hours.saturating_mul(3600)),
            retention: Duration::from_secs(self.retention_days.saturating_mul(86_400)),
            partial_failure: self.partial_failure,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// TTL for the lock held across one heal cycle: `base` plus the worst
    /// case of every pending item running its readiness check and every
    /// re-run step to the command timeout. Capped at the maximum lock TTL.
    pub fn cycle_lock_ttl(&self, base: Duration, pending_items: usize) -> Duration {
        let commands_per_item = self.rerun_steps.len() as u64 + 1;
        let worst_case = self
            .command_timeout_secs
            .saturating_mul(commands_per_item)
            .saturating_mul(pending_items as u64);
        Duration::from_secs(base.as_secs().saturating_add(worst_case)).min(MAX_LOCK_TTL)
    }

    /// The readiness command, or `None` when self-heal is not configured.
    pub fn readiness(&self) -> Option<ShellCommand> {
        self.readiness_command
            .as_ref()
            .map(|c| ShellCommand::new("readiness", c.clone()).with_timeout(self.command_timeout()))
    }

    pub fn steps(&self) -> Vec<ShellCommand> {
        self.rerun_steps
            .iter()
            .map(|s| ShellCommand::new(s.name.clone(), s.command.clone()).with_timeout(self.command_timeout()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_active_batches: usize,
    /// Cleanup removes triggered batches older than this
    pub retention_days: u64,
    /// An unfinished handoff claim older than this may be retried
    pub handoff_lease_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let settings = CoordinatorSettings::default();
        Self {
            max_active_batches: settings.max_active_batches,
            retention_days: 30,
            handoff_lease_secs: settings.handoff_lease.as_secs(),
        }
    }
}

impl CoordinatorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(86_400))
    }
}

impl StagegateConfig {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_active_batches: self.coordinator.max_active_batches,
            stall_threshold: Duration::from_secs(self.progress.stall_threshold_secs),
            handoff_lease: Duration::from_secs(self.coordinator.handoff_lease_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        assert_eq!(StagegateConfig::from_yaml("").unwrap(), StagegateConfig::default());
        assert!(StagegateConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
stage:
  name: predictions
handoff:
  mode: blocking
  block_on: error
  expected_volume: 100
self_heal:
  partial_failure: failure
  max_checks: 4
  rerun_steps:
    - name: features
      command: make features
"#;
        let config = StagegateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.stage.name, "predictions");
        assert_eq!(config.handoff.mode, ValidationMode::Blocking);
        assert_eq!(config.handoff.block_on, Severity::Error);
        assert_eq!(config.handoff.volume_threshold, DEFAULT_VOLUME_THRESHOLD);
        assert_eq!(config.self_heal.partial_failure, PartialFailurePolicy::Failure);
        assert_eq!(config.self_heal.steps().len(), 1);
        assert_eq!(config.transaction, TransactionConfig::default());

        let checks = config.handoff.checks().unwrap();
        assert_eq!(checks.volume.unwrap().expected, 100);
        assert!(checks.workers.is_none());
    }

    #[test]
    fn nonsense_values_are_rejected() {
        for yaml in [
            "transaction:\n  max_attempts: 0\n",
            "handoff:\n  volume_threshold: 1.5\n",
            "coordinator:\n  max_active_batches: 0\n",
            "stage:\n  name: '  '\n",
        ] {
            let err = StagegateConfig::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, CoordinationError::Config(_)), "{yaml}");
        }
    }

    #[test]
    fn windows_that_overflow_are_rejected() {
        for yaml in [
            "self_heal:\n  lookback_hours: 18446744073709551615\n",
            "self_heal:\n  retention_days: 5124095576030431\n",
            "coordinator:\n  retention_days: 36501\n",
            "lock:\n  ttl_secs: 18446744073709551615\n",
            "coordinator:\n  handoff_lease_secs: 0\n",
        ] {
            let err = StagegateConfig::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, CoordinationError::Config(_)), "{yaml}");
        }
        let config = StagegateConfig::from_yaml("self_heal:\n  lookback_hours: 876000\n").unwrap();
        assert_eq!(config.self_heal.settings().lookback, Duration::from_secs(876_000 * 3600));
    }

    #[test]
    fn settings_saturate_instead_of_overflowing() {
        let heal = SelfHealConfig {
            lookback_hours: u64::MAX,
            retention_days: u64::MAX,
            ..Default::default()
        };
        assert_eq!(heal.settings().lookback, Duration::from_secs(u64::MAX));
        let coordinator = CoordinatorConfig {
            retention_days: u64::MAX,
            ..Default::default()
        };
        assert_eq!(coordinator.retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn cycle_lock_covers_every_pending_command() {
        let heal = SelfHealConfig {
            command_timeout_secs: 60,
            rerun_steps: vec![
                RerunStepConfig { name: "a".into(), command: "true".into() },
                RerunStepConfig { name: "b".into(), command: "true".into() },
            ],
            ..Default::default()
        };
        let base = Duration::from_secs(300);
        assert_eq!(heal.cycle_lock_ttl(base, 0), base);
        // 4 items, each up to readiness + 2 steps at 60s
        assert_eq!(heal.cycle_lock_ttl(base, 4), Duration::from_secs(300 + 4 * 3 * 60));
        assert_eq!(heal.cycle_lock_ttl(base, usize::MAX), MAX_LOCK_TTL);
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        assert!(StagegateConfig::from_yaml("handoff:\n  mode: sometimes\n").is_err());
    }

    #[test]
    fn retry_policy_from_transaction_section() {
        let config = StagegateConfig::from_yaml("transaction:\n  max_attempts: 8\n  base_backoff_ms: 20\n").unwrap();
        let policy = config.transaction.retry_policy();
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(policy.base_delay, Duration::from_millis(20));
    }
}
