//! Time sources
//!
//! Everything that compares timestamps (lock expiry, stall detection,
//! retention windows) reads the time through a [`Clock`] so tests can
//! drive it deterministically.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

use crate::error::{CoordinationError, CoordinationResult};

/// A source of wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::MAX)
}

/// `at + d`, or `InvalidInput` when the result is not a representable time.
pub fn checked_after(at: DateTime<Utc>, d: std::time::Duration) -> CoordinationResult<DateTime<Utc>> {
    Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| out_of_range(d))
}

/// `at - d`, or `InvalidInput` when the result is not a representable time.
pub fn checked_before(at: DateTime<Utc>, d: std::time::Duration) -> CoordinationResult<DateTime<Utc>> {
    Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .ok_or_else(|| out_of_range(d))
}

fn out_of_range(d: std::time::Duration) -> CoordinationError {
    CoordinationError::InvalidInput(format!("duration of {}s is out of range", d.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance_secs(30);
        assert_eq!(clock.now() - t0, Duration::seconds(30));
    }

    #[test]
    fn to_chrono_saturates() {
        assert_eq!(to_chrono(std::time::Duration::from_secs(5)), Duration::seconds(5));
        assert_eq!(to_chrono(std::time::Duration::MAX), Duration::MAX);
    }

    #[test]
    fn checked_offsets_reject_unrepresentable_times() {
        let now = Utc::now();
        let hour = std::time::Duration::from_secs(3600);
        assert_eq!(checked_after(now, hour).unwrap() - now, Duration::hours(1));
        assert_eq!(now - checked_before(now, hour).unwrap(), Duration::hours(1));

        let huge = std::time::Duration::from_secs(u64::MAX);
        assert!(matches!(checked_after(now, huge), Err(CoordinationError::InvalidInput(_))));
        assert!(matches!(checked_before(now, huge), Err(CoordinationError::InvalidInput(_))));
        // representable as a chrono duration, but not as a date
        let far = std::time::Duration::from_secs(i64::MAX as u64 / 1000);
        assert!(checked_after(now, far).is_err());
    }
}
