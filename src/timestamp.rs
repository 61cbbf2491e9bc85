//! Microsecond-precision timestamp, the concrete representation spec.md
//! leaves abstract ("absolute expiration timestamp (microsecond precision)").

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROSECONDS_PER_SECOND: i64 = 1_000_000;

/// Microseconds since the Unix epoch.
///
/// Ordered and equality-compared as a plain integer, matching muduo's
/// `Timestamp` (a wrapped `int64_t microSecondsSinceEpoch_`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// An invalid/sentinel timestamp, used the way muduo uses `Timestamp::invalid()`
    /// to mark a one-shot timer that should not be rearmed.
    pub const INVALID: Timestamp = Timestamp(0);

    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp(since_epoch.as_micros() as i64)
    }

    pub fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    pub fn micros_since_epoch(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// `self + Duration`, saturating rather than overflowing.
    pub fn add(self, duration: Duration) -> Timestamp {
        let delta = duration.as_micros() as i64;
        Timestamp(self.0.saturating_add(delta))
    }

    /// Signed microsecond difference `self - other`.
    pub fn diff_micros(self, other: Timestamp) -> i64 {
        self.0 - other.0
    }
}

impl Default for Timestamp {
    fn default() -> Timestamp {
        Timestamp::INVALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_valid_and_monotone_ish() {
        let t0 = Timestamp::now();
        let t1 = Timestamp::now();
        assert!(t0.is_valid());
        assert!(t1 >= t0);
    }

    #[test]
    fn invalid_sentinel() {
        assert!(!Timestamp::INVALID.is_valid());
        assert!(!Timestamp::default().is_valid());
    }

    #[test]
    fn add_duration() {
        let t = Timestamp::from_micros(1_000_000);
        let t2 = t.add(Duration::from_millis(500));
        assert_eq!(t2.diff_micros(t), 500_000);
    }
}
