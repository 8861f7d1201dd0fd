//! Handoff validation
//!
//! Before a stage is declared healthy and handed to the next one, the
//! validator checks that enough data actually arrived:
//! - volume: actual vs expected item count
//! - workers: every expected worker completed
//! - quality: per-table average quality score
//!
//! Whether issues block the handoff is decided by [`ValidationMode`], which
//! comes from configuration.

mod source;

pub use source::{CompletionDataSource, HandoffDataSource, StaticDataSource};

use crate::error::{CoordinationError, CoordinationResult, ExitStatus};
use crate::keys::{BatchKey, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default minimum actual/expected volume ratio.
pub const DEFAULT_VOLUME_THRESHOLD: f64 = 0.8;

/// How validation results affect the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// No checks run; always valid.
    Disabled,
    /// Issues are logged but never block.
    #[default]
    Warning,
    /// Issues at or above the blocking severity make the result invalid.
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Volume,
    Workers,
    Quality,
}

/// One finding of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub check: CheckKind,
    pub severity: Severity,
    /// What the issue is about: a worker id or table name, when there is one
    pub subject: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        write!(f, "[{}] {}", severity, self.message)
    }
}

/// Expected volume and the minimum acceptable ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeCheck {
    pub expected: u64,
    pub threshold: f64,
}

impl VolumeCheck {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            threshold: DEFAULT_VOLUME_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Tables whose average quality score must reach `min_score`.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityCheck {
    pub tables: Vec<String>,
    pub min_score: f64,
}

/// Which checks to run for one validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffChecks {
    pub volume: Option<VolumeCheck>,
    pub workers: Option<BTreeSet<WorkerId>>,
    pub quality: Option<QualityCheck>,
}

impl HandoffChecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_volume(mut self, check: VolumeCheck) -> Self {
        self.volume = Some(check);
        self
    }

    pub fn with_workers(mut self, expected: impl IntoIterator<Item = WorkerId>) -> Self {
        self.workers = Some(expected.into_iter().collect());
        self
    }

    pub fn with_quality(mut self, check: QualityCheck) -> Self {
        self.quality = Some(check);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.volume.is_none() && self.workers.is_none() && self.quality.is_none()
    }
}

/// Outcome of one validation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub batch_key: BatchKey,
    pub mode: ValidationMode,
    pub is_valid: bool,
    /// Any issue has ERROR severity, regardless of mode
    pub has_errors: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    /// 0 when clean, 1 when issues exist but the handoff may proceed, 2
    /// when the handoff is blocked.
    pub fn exit_status(&self) -> ExitStatus {
        if !self.is_valid {
            ExitStatus::Critical
        } else if self.issues.is_empty() {
            ExitStatus::Healthy
        } else {
            ExitStatus::Warning
        }
    }

    /// Turn an invalid report into `ValidationBlocked`.
    pub fn into_result(self) -> CoordinationResult<ValidationReport> {
        if self.is_valid {
            return Ok(self);
        }
        Err(CoordinationError::ValidationBlocked {
            batch_key: self.batch_key.to_string(),
            issues: self.issues.iter().map(|i| i.to_string()).collect(),
        })
    }
}

/// Runs handoff checks against a data source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandoffValidator {
    mode: ValidationMode,
    block_on: Severity,
}

impl Default for HandoffValidator {
    fn default() -> Self {
        Self::new(ValidationMode::default())
    }
}

impl HandoffValidator {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            block_on: Severity::Warning,
        }
    }

    /// Lowest severity that invalidates a result in blocking mode.
    pub fn with_block_on(mut self, severity: Severity) -> Self {
        self.block_on = severity;
        self
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn validate(
        &self,
        source: &dyn HandoffDataSource,
        batch_key: &BatchKey,
        checks: &HandoffChecks,
    ) -> CoordinationResult<ValidationReport> {
        if self.mode == ValidationMode::Disabled {
            return Ok(ValidationReport {
                batch_key: batch_key.clone(),
                mode: self.mode,
                is_valid: true,
                has_errors: false,
                issues: Vec::new(),
            });
        }

        let mut issues = Vec::new();
        if let Some(volume) = &checks.volume {
            let actual = source.actual_volume(batch_key)?;
            issues.extend(check_volume(volume, actual));
        }
        if let Some(expected) = &checks.workers {
            let completed = source.completed_workers(batch_key)?;
            issues.extend(check_workers(expected, &completed));
        }
        if let Some(quality) = &checks.quality {
            for table in &quality.tables {
                let scores = source.quality_scores(batch_key, table)?;
                issues.extend(check_quality(table, &scores, quality.min_score));
            }
        }

        let has_errors = issues.iter().any(|i| i.severity == Severity::Error);
        let is_valid = match self.mode {
            ValidationMode::Blocking => !issues.iter().any(|i| i.severity >= self.block_on),
            _ => true,
        };

        for issue in &issues {
            match issue.severity {
                Severity::Warning => tracing::warn!(batch_key = %batch_key, check = ?issue.check, "{}", issue.message),
                Severity::Error => tracing::error!(batch_key = %batch_key, check = ?issue.check, "{}", issue.message),
            }
        }
        if !is_valid {
            tracing::error!(batch_key = %batch_key, issues = issues.len(), "handoff blocked");
        }

        Ok(ValidationReport {
            batch_key: batch_key.clone(),
            mode: self.mode,
            is_valid,
            has_errors,
            issues,
        })
    }
}

fn check_volume(check: &VolumeCheck, actual: u64) -> Option<ValidationIssue> {
    if check.expected == 0 {
        return None;
    }
    let ratio = actual as f64 / check.expected as f64;
    let severity = if ratio < check.threshold / 2.0 {
        Severity::Error
    } else if ratio < check.threshold {
        Severity::Warning
    } else {
        return None;
    };
    Some(ValidationIssue {
        check: CheckKind::Volume,
        severity,
        subject: None,
        message: format!(
            "volume {} of expected {} (ratio {:.2}, threshold {:.2})",
            actual, check.expected, ratio, check.threshold
        ),
    })
}

fn check_workers(expected: &BTreeSet<WorkerId>, completed: &BTreeSet<WorkerId>) -> Vec<ValidationIssue> {
    expected
        .difference(completed)
        .map(|worker| ValidationIssue {
            check: CheckKind::Workers,
            severity: Severity::Error,
            subject: Some(worker.to_string()),
            message: format!("worker {} did not complete", worker),
        })
        .collect()
}

fn check_quality(table: &str, scores: &[f64], min_score: f64) -> Option<ValidationIssue> {
    if scores.is_empty() {
        return Some(ValidationIssue {
            check: CheckKind::Quality,
            severity: Severity::Warning,
            subject: Some(table.to_string()),
            message: format!("table {} has no quality metrics", table),
        });
    }
    let average = scores.iter().sum::<f64>() / scores.len() as f64;
    let severity = if average < min_score / 2.0 {
        Severity::Error
    } else if average < min_score {
        Severity::Warning
    } else {
        return None;
    };
    Some(ValidationIssue {
        check: CheckKind::Quality,
        severity,
        subject: Some(table.to_string()),
        message: format!(
            "table {} average quality {:.2} below minimum {:.2}",
            table, average, min_score
        ),
    })
}
