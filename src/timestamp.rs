//! Fixed-width UTC timestamps and the storage keys derived from them.
//!
//! Every timestamp is rendered as `YYYY-MM-DDTHH:MM:SS.ffffffZ`, so comparing two of them as
//! strings gives the same answer as comparing the instants. Storage keys embed the timestamp
//! with `:` and `-` stripped, which keeps the width fixed and therefore keeps key order equal to
//! capture order.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const RECORD_KEY_SUFFIX: &str = ".json";

static LAST_ISSUED_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(String);

impl Timestamp {
    /// Returns the current time, strictly later than any timestamp previously issued by this
    /// process.
    pub fn now() -> Self {
        let mut candidate = Utc::now().timestamp_micros();
        loop {
            let previous = LAST_ISSUED_MICROS.load(Ordering::Acquire);
            if candidate <= previous {
                candidate = previous + 1;
            }
            if LAST_ISSUED_MICROS
                .compare_exchange(previous, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let instant = DateTime::<Utc>::from_timestamp_micros(candidate).unwrap_or_else(Utc::now);
        Self::from_datetime(instant)
    }

    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        Self(instant.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    /// Parses user or legacy input into canonical form.
    ///
    /// Accepts RFC 3339 with any offset, a naive `YYYY-MM-DDTHH:MM:SS[.f]` (read as UTC) and a
    /// bare `YYYY-MM-DD` (midnight UTC).
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(Self::from_datetime(instant.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(Self::from_datetime(naive.and_utc()));
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self::from_datetime(midnight.and_utc()));
            }
        }
        Err(Error::validation(format!(
            "invalid timestamp `{input}`; expected RFC 3339 (e.g. 2024-01-31T12:00:00Z) or YYYY-MM-DD"
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The timestamp with `:` and `-` removed, as used in storage keys.
    pub fn compact(&self) -> String {
        self.0.replace([':', '-'], "")
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

/// `<compact timestamp>_<id>.json`
pub fn storage_key(timestamp: &Timestamp, id: &str) -> String {
    format!("{}_{id}{RECORD_KEY_SUFFIX}", timestamp.compact())
}

/// Splits a storage key (optionally behind a `prefix/`) into its compact timestamp and id.
pub fn parse_storage_key(key: &str) -> Option<(&str, &str)> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let stem = file_name.strip_suffix(RECORD_KEY_SUFFIX)?;
    let (timestamp, id) = stem.split_once('_')?;
    if !is_compact_timestamp(timestamp) || id.is_empty() {
        return None;
    }
    Some((timestamp, id))
}

/// `YYYYMMDDTHHMMSS.ffffffZ`, the shape [`Timestamp::compact`] produces.
fn is_compact_timestamp(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 23
        && bytes.iter().enumerate().all(|(pos, byte)| match pos {
            8 => *byte == b'T',
            15 => *byte == b'.',
            22 => *byte == b'Z',
            _ => byte.is_ascii_digit(),
        })
}

pub fn id_from_storage_key(key: &str) -> Option<&str> {
    parse_storage_key(key).map(|(_, id)| id)
}

pub fn key_matches_id(key: &str, id: &str) -> bool {
    id_from_storage_key(key) == Some(id)
}

/// Inclusive bounds on record timestamps. Either side may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeRange {
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        let start = start
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(Timestamp::parse)
            .transpose()?;
        let end = end
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(Timestamp::parse)
            .transpose()?;

        if let (Some(start), Some(end)) = (&start, &end) {
            if start > end {
                return Err(Error::validation(format!(
                    "time range start `{start}` is after end `{end}`"
                )));
            }
        }

        Ok(Self { start, end })
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, timestamp: &Timestamp) -> bool {
        self.start.as_ref().is_none_or(|start| timestamp >= start)
            && self.end.as_ref().is_none_or(|end| timestamp <= end)
    }
}
