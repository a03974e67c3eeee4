//! Naive timestamp conversion between UTC and a recipient's timezone.
//!
//! Both directions drop the zone after converting: the engine stores
//! UTC moments and does calendar arithmetic on recipient-local naive
//! datetimes. A missing or unresolvable timezone falls back to
//! returning the input unchanged (UTC-as-local), never an error.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

fn parse_tz(tz: Option<&str>) -> Option<Tz> {
    tz.and_then(|name| name.parse::<Tz>().ok())
}

/// Convert a UTC moment to the recipient's local wall-clock time.
pub fn utc_to_local(tz: Option<&str>, timestamp: DateTime<Utc>) -> NaiveDateTime {
    match parse_tz(tz) {
        Some(zone) => timestamp.with_timezone(&zone).naive_local(),
        None => timestamp.naive_utc(),
    }
}

/// Convert a recipient-local wall-clock time to a UTC moment.
///
/// Ambiguous local times (DST fold) take the earlier mapping; local
/// times skipped by a DST gap fall back to the input unchanged.
pub fn local_to_utc(tz: Option<&str>, timestamp: NaiveDateTime) -> DateTime<Utc> {
    let Some(zone) = parse_tz(tz) else {
        return Utc.from_utc_datetime(&timestamp);
    };
    match zone.from_local_datetime(&timestamp).earliest() {
        Some(zoned) => zoned.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&timestamp),
    }
}
