//! Wall-clock helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Current wall-clock time in UTC.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Time left until `at`, or zero if `at` is already in the past.
#[must_use]
pub fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_past_is_zero() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(until(past), Duration::ZERO);
    }

    #[test]
    fn until_future_is_positive() {
        let future = Utc::now() + chrono::Duration::seconds(5);
        assert!(until(future) > Duration::from_secs(3));
    }
}
