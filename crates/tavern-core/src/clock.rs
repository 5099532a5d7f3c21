//! Clock abstraction so ledger, journal, and log timestamps stay
//! deterministic under test.

use chrono::{DateTime, SecondsFormat, Utc};

/// Abstraction over wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time as an RFC 3339 string with second precision.
    fn timestamp(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Frozen(DateTime<Utc>);

    impl Clock for Frozen {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn test_timestamp_uses_second_precision_utc() {
        let clock = Frozen(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());

        assert_eq!(clock.timestamp(), "2026-01-15T10:00:00Z");
    }
}
