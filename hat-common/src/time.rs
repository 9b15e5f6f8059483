//! Timestamp utilities

use crate::{Error, Result};
use chrono::{DateTime, Local, NaiveDateTime, Timelike, Utc};

/// Format used for the `time_stamp` column of results tables
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current local wall-clock time truncated to whole seconds
pub fn local_stamp() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn format_stamp(stamp: &NaiveDateTime) -> String {
    stamp.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_stamp(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
        .map_err(|e| Error::Parse(format!("invalid timestamp '{}': {}", text, e)))
}
