//! Key normalization
//!
//! Completion records arrive from many sources (workers, schedulers, admin
//! tooling) which disagree on casing, whitespace and date formats. Every
//! identifier is canonicalized once, at construction, so the same logical
//! batch or worker always maps to the same stored key.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

/// Separator between the parts of a composite key.
pub const COMPOSITE_SEPARATOR: char = ':';

/// Date formats accepted for date-like key segments.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d", "%Y.%m.%d", "%m/%d/%Y"];

/// Canonicalize one key segment.
///
/// - surrounding whitespace is trimmed
/// - ASCII letters are lowercased
/// - runs of whitespace, underscores and dashes become a single `-`, and
///   separators at either end are dropped
/// - date-like segments are rewritten to ISO-8601 (`YYYY-MM-DD`)
pub fn normalize_segment(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(date) = parse_date(trimmed) {
        return date.format("%Y-%m-%d").to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut pending_dash = false;
    for ch in trimmed.chars() {
        if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_dash = !out.is_empty();
            continue;
        }
        if pending_dash {
            out.push('-');
            pending_dash = false;
        }
        out.push(ch.to_ascii_lowercase());
    }
    out
}

/// Canonicalize a possibly composite key (`date:entity:...`).
///
/// Each segment is normalized independently; empty segments are dropped.
pub fn normalize_key(raw: &str) -> String {
    raw.split(COMPOSITE_SEPARATOR)
        .map(normalize_segment)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(&COMPOSITE_SEPARATOR.to_string())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if s.len() < 8 || !s.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Identifier for one pipeline run of a stage (typically a date).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchKey(String);

impl BatchKey {
    /// Normalize and wrap a raw batch key.
    pub fn parse(raw: &str) -> CoordinationResult<Self> {
        let key = normalize_key(raw);
        if key.is_empty() {
            return Err(CoordinationError::InvalidInput(format!(
                "batch key '{}' is empty after normalization",
                raw
            )));
        }
        Ok(Self(key))
    }

    /// Build a composite key from a date and an entity (e.g. a slate or region).
    pub fn composite(date: NaiveDate, entity: &str) -> CoordinationResult<Self> {
        Self::parse(&format!("{}{}{}", date.format("%Y-%m-%d"), COMPOSITE_SEPARATOR, entity))
    }

    /// Build a key from a calendar date.
    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m-%d").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading date segment, when the key starts with one.
    pub fn date(&self) -> Option<NaiveDate> {
        self.0
            .split(COMPOSITE_SEPARATOR)
            .next()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BatchKey {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier of one unit of work within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn parse(raw: &str) -> CoordinationResult<Self> {
        let id = normalize_key(raw);
        if id.is_empty() {
            return Err(CoordinationError::InvalidInput(format!(
                "worker id '{}' is empty after normalization",
                raw
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
