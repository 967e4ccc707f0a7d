//! Timestamp normalization and the server's monotonic update clock.
//!
//! Every timestamp is persisted as a fixed-width RFC 3339 UTC string with
//! microsecond precision, so lexical order in SQL is chronological order.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Local, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};

use crate::error::{Error, Result};

/// Accepted layouts for timestamps that carry no offset. They are read in
/// the caller's local timezone.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// The first-sync watermark.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_timestamp`].
pub fn parse_stored(value: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

/// Parse user or client supplied input, interpreting offset-less values in
/// the process's local timezone.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    parse_timestamp_in(input, &Local)
}

/// Parse input into UTC. Values with an explicit offset (`Z`, `+02:00`) are
/// converted directly; offset-less values are read in `tz`.
pub fn parse_timestamp_in<Tz: TimeZone>(input: &str, tz: &Tz) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::validation("timestamp must not be empty"));
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc).trunc_subsecs(6));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|ts| ts.with_timezone(&Utc).trunc_subsecs(6))
                .ok_or_else(|| {
                    Error::validation(format!("'{input}' does not exist in the local timezone"))
                });
        }
    }

    Err(Error::validation(format!(
        "Invalid timestamp '{input}'. Use ISO 8601 format."
    )))
}

/// Issues strictly increasing timestamps, so a record's `updated_at` always
/// moves forward even when two writes land in the same microsecond or the
/// wall clock steps backwards.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }

    /// Raise the floor so later ticks are after `ts`.
    pub fn observe(&self, ts: DateTime<Utc>) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.is_none_or(|prev| ts > prev) {
            *last = Some(ts);
        }
    }
}
