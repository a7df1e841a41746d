//! Local-time helpers. Persisted timestamps are ISO-8601 at second
//! granularity; the parser tolerates fractional seconds from older records.

use chrono::{Local, NaiveDateTime};

const ISO_SECONDS: &str = "%Y-%m-%dT%H:%M:%S";

/// Current local time, truncated to whole seconds when formatted.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Current local time as `YYYY-MM-DDTHH:MM:SS`.
pub fn now_iso() -> String {
    Local::now().format(ISO_SECONDS).to_string()
}

/// Current local date as `YYYY-MM-DD`.
pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Format a datetime the way [`now_iso`] does.
pub fn format_iso(value: NaiveDateTime) -> String {
    value.format(ISO_SECONDS).to_string()
}

/// Parse an ISO-8601 timestamp, returning `None` on anything malformed.
pub fn parse_iso(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, ISO_SECONDS)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}
