//! Calendar arithmetic and the textual date formats accepted on the wire.

use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::limits::LEGACY_STAY_MONTHS;
use crate::model::Timestamp;

pub fn now() -> Timestamp {
    Utc::now()
}

/// Calendar-month addition. Day-of-month is clamped, so Jan 31 + 1 month is the
/// last day of February. `None` only on overflow.
pub fn add_months(at: Timestamp, months: u32) -> Option<Timestamp> {
    at.checked_add_months(Months::new(months))
}

/// End of a stay: the recorded exit date, or a fixed-length stay for rows
/// recorded before exit dates existed.
pub fn effective_exit(joined_at: Timestamp, exit_date: Option<Timestamp>) -> Option<Timestamp> {
    match exit_date {
        Some(exit) => Some(exit),
        None => add_months(joined_at, LEGACY_STAY_MONTHS),
    }
}

/// Accepts RFC 3339 (`2025-07-01T09:30:00Z`), a naive datetime taken as UTC
/// (`2025-07-01 09:30:00`), or a bare date meaning midnight UTC (`2025-07-01`).
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
