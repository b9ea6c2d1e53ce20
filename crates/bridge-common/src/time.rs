//! Timestamp handling for the coordination record and BridgeJob status
//!
//! Every timestamp the bridge writes uses [`TIME_FORMAT`]. Remote schedulers
//! report times in their own shapes; [`normalize_timestamp`] folds the ones we
//! know into the canonical format and passes anything else through untouched.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Canonical timestamp layout, e.g. `2024-03-01T12:30:00Z`
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format a UTC instant in the canonical layout
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIME_FORMAT).to_string()
}

/// Current time in the canonical layout
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parse a canonical timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT).map(|naive| naive.and_utc())
}

/// Convert a scheduler-reported time into the canonical layout when possible
///
/// Accepts epoch seconds, RFC 3339 and the canonical layout itself.
pub fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        if let Some(at) = Utc.timestamp_opt(secs, 0).single() {
            return format_timestamp(at);
        }
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return format_timestamp(at.with_timezone(&Utc));
    }
    raw.to_string()
}

/// Elapsed minutes between two canonical timestamps
pub fn minutes_between(start: &str, end: &str) -> Result<f64, chrono::ParseError> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    Ok((end - start).num_seconds() as f64 / 60.0)
}
