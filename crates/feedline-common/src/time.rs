//! Timestamp helpers
//!
//! Cursors default to `0001-01-01T00:00:00Z`, the smallest instant both
//! chrono and PostgreSQL `TIMESTAMPTZ` represent without loss. Lease expiry
//! arithmetic saturates instead of panicking on absurd durations.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use std::time::Duration;

use crate::error::{CommonError, Result};

/// Seconds between `0001-01-01T00:00:00Z` and the Unix epoch.
const SECONDS_BEFORE_EPOCH: i64 = 62_135_596_800;

/// The default value of a cursor that has never been written.
pub fn min_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH - TimeDelta::seconds(SECONDS_BEFORE_EPOCH)
}

/// `start + duration`, clamped to the largest representable instant.
pub fn add_duration(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CommonError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Round-trip ("O") formatting used in log lines and CLI output.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
