//! Nanosecond timestamp helpers
//!
//! All timestamps in EntityDB are nanoseconds since the Unix epoch, stored
//! as `i64`. The representable range ends in April 2262; anything outside
//! it is rejected at parse time.

use chrono::{DateTime, SecondsFormat, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time in nanoseconds since the Unix epoch
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Format a nanosecond timestamp as RFC 3339 with nanosecond precision
pub fn format_rfc3339_nanos(nanos: i64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp_nanos(nanos);
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 timestamp into nanoseconds
///
/// Returns `None` for unparseable input or timestamps outside the `i64`
/// nanosecond range (the year-2262 boundary).
pub fn parse_rfc3339_nanos(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok()?.timestamp_nanos_opt()
}
