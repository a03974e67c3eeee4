//! Trigger evaluation: is a named condition on an entity "reached"?
//!
//! Two value shapes count: a timestamp that lies **in the future**
//! relative to `now` (expected-by semantics — the date has been set
//! and is upcoming, not "already happened"), or the case-insensitive
//! `"ok"` sentinel. Absent or unparseable values are not reached.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use cadence_core::traits::Entity;

/// Truthy sentinel for non-timestamp trigger properties.
pub fn is_ok_sentinel(value: &str) -> bool {
    value.eq_ignore_ascii_case("ok")
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a property value as a UTC timestamp. Accepts RFC 3339, the
/// common naive datetime forms above (read as UTC), and bare dates
/// (read as midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// A start-trigger value that resolved to a point in time.
///
/// Bare dates are kept distinct from datetimes: a date-valued start
/// property anchors the schedule at that date but records midnight as
/// the condition value for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartValue {
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

/// Parse a start property into a [`StartValue`], if it is time-shaped.
pub fn parse_start(raw: &str) -> Option<StartValue> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(StartValue::Date(date));
    }
    parse_timestamp(raw).map(StartValue::Timestamp)
}

/// Whether the condition held in `property` on `entity` is reached.
pub fn condition_reached(entity: &dyn Entity, property: &str, now: DateTime<Utc>) -> bool {
    let Some(raw) = entity.property(property) else {
        return false;
    };
    match parse_timestamp(&raw) {
        Some(ts) => ts > now,
        None => is_ok_sentinel(&raw),
    }
}
