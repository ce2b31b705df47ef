//! Wall-clock timestamps.
//!
//! Events are stamped with wall-clock time so they can be correlated with the
//! recorded video and with other sessions. Wall-clock time can jump when the
//! system clock is adjusted, so ordering is only meaningful within one
//! uninterrupted session.

use chrono::Utc;

/// Returns the current wall-clock time as seconds since the Unix epoch,
/// with microsecond resolution.
#[must_use]
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_seconds_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(epoch_seconds() > 1_577_836_800.0);
    }

    #[test]
    fn test_epoch_seconds_has_sub_second_precision() {
        let a = epoch_seconds();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = epoch_seconds();
        assert!(b - a >= 0.004, "expected ms resolution, got {a} -> {b}");
    }
}
