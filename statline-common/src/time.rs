//! Timestamp utilities
//!
//! Staleness checks and rate-limit windows read time through [`Clock`] so
//! that tests can drive them with a [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Mutex;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a stored millisecond timestamp back to UTC.
///
/// Out-of-range values clamp to the Unix epoch rather than failing a read.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// Source of "now" for time-dependent decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests and replays
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Clock frozen at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward by `delta`
    pub fn advance(&self, delta: ChronoDuration) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current += delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[test]
    fn test_from_millis_roundtrips_stored_value() {
        let at = Utc.with_ymd_and_hms(2025, 11, 28, 18, 30, 0).unwrap();
        assert_eq!(from_millis(at.timestamp_millis()), at);
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 11, 28, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(ChronoDuration::minutes(130));
        assert_eq!(clock.now(), start + ChronoDuration::minutes(130));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_system_clock_successive_calls_advance() {
        let clock = SystemClock;
        let time1 = clock.now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let time2 = clock.now();
        assert!(time2 > time1);
    }
}
