//! RetryableWorkItem: a unit of deferred work waiting on upstream data

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Work known to be incomplete because upstream data was missing.
///
/// `check_count` only grows. The item is terminal once COMPLETED or FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryableWorkItem {
    pub item_id: String,
    pub status: ItemStatus,
    pub check_count: u32,
    pub max_checks: u32,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Free-form labels passed to readiness checks and re-run steps
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl RetryableWorkItem {
    pub fn new(
        item_id: impl Into<String>,
        max_checks: u32,
        context: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            status: ItemStatus::Pending,
            check_count: 0,
            max_checks,
            created_at: now,
            last_checked_at: None,
            finished_at: None,
            last_error: None,
            context,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The readiness condition held.
    pub fn record_ready(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Completed;
        self.last_checked_at = Some(now);
        self.finished_at = Some(now);
    }

    /// The readiness condition did not hold. Counts the check and fails the
    /// item once `max_checks` evaluations have missed.
    pub fn record_miss(&mut self, error: Option<String>, now: DateTime<Utc>) -> ItemStatus {
        self.check_count += 1;
        self.last_checked_at = Some(now);
        if error.is_some() {
            self.last_error = error;
        }
        if self.check_count >= self.max_checks {
            self.status = ItemStatus::Failed;
            self.finished_at = Some(now);
        }
        self.status
    }
}
