//! Wall-clock helpers.
//!
//! Lifecycle timestamps are unix epoch seconds persisted as decimal strings.
//! Timeouts are logical: stored stamps are compared against "now" on every
//! tick, so a stamp that fails to parse must surface as an error the caller
//! can log and skip.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A persisted timestamp that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed timestamp '{0}'")]
pub struct TimestampError(pub String);

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn parse_timestamp(raw: &str) -> Result<u64, TimestampError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| TimestampError(raw.to_string()))
}

/// Elapsed seconds with two decimals, the format used for timing samples.
pub fn format_secs(elapsed: Duration) -> String {
    format!("{:.2}", elapsed.as_secs_f64())
}

/// UTC date used to bucket daily timing samples.
pub fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_epoch_seconds() {
        assert_eq!(parse_timestamp("1700000000"), Ok(1_700_000_000));
        assert_eq!(parse_timestamp(" 42 "), Ok(42));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            parse_timestamp("yesterday"),
            Err(TimestampError("yesterday".to_string()))
        );
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("-5").is_err());
    }

    #[test]
    fn format_secs_two_decimals() {
        assert_eq!(format_secs(Duration::from_millis(1234)), "1.23");
        assert_eq!(format_secs(Duration::ZERO), "0.00");
    }

    #[test]
    fn today_is_iso_date() {
        let day = today();
        assert_eq!(day.len(), 10);
        assert_eq!(day.as_bytes()[4], b'-');
    }

    #[test]
    fn epoch_secs_returns_reasonable_value() {
        // Should be after 2024-01-01.
        assert!(epoch_secs() > 1_704_067_200);
    }
}
