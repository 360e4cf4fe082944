//! Hour bucketing
//!
//! Every aggregate is keyed by the UTC calendar hour it covers. The canonical
//! string form is `YYYY-MM-DD-HH`; because every field is zero padded and the
//! year has four digits, lexicographic order of the strings equals
//! chronological order of the hours.

use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// One UTC calendar hour
///
/// Always holds an instant aligned to the top of the hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HourKey(DateTime<Utc>);

impl HourKey {
    /// Hour bucket containing `instant`
    pub fn containing(instant: DateTime<Utc>) -> Self {
        let midnight = instant.date_naive().and_time(NaiveTime::MIN);
        let aligned = midnight + Duration::hours(i64::from(instant.hour()));
        Self(Utc.from_utc_datetime(&aligned))
    }

    /// Parse the canonical `YYYY-MM-DD-HH` form
    pub fn parse(key: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("Invalid hour key: {key:?}"));

        let parts: Vec<&str> = key.split('-').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }
        let widths = [4, 2, 2, 2];
        if parts
            .iter()
            .zip(widths)
            .any(|(part, width)| part.len() != width || !part.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid());
        }

        let year: i32 = parts[0].parse().map_err(|_| invalid())?;
        let month: u32 = parts[1].parse().map_err(|_| invalid())?;
        let day: u32 = parts[2].parse().map_err(|_| invalid())?;
        let hour: u32 = parts[3].parse().map_err(|_| invalid())?;

        let naive = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .ok_or_else(invalid)?;
        Ok(Self(Utc.from_utc_datetime(&naive)))
    }

    /// Inclusive start of the hour
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// Exclusive end of the hour
    pub fn end(&self) -> DateTime<Utc> {
        self.0 + Duration::hours(1)
    }

    pub fn next(&self) -> Self {
        Self(self.end())
    }

    pub fn previous(&self) -> Self {
        Self(self.0 - Duration::hours(1))
    }

    /// Signed number of whole hours from `self` to `later`
    pub fn hours_until(&self, later: &HourKey) -> i64 {
        (later.0 - self.0).num_hours()
    }
}

impl fmt::Display for HourKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d-%H"))
    }
}

impl FromStr for HourKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for HourKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HourKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        HourKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Hour key of the hour containing `now`
pub fn current_hour_key(now: DateTime<Utc>) -> HourKey {
    HourKey::containing(now)
}

/// `hours` contiguous hour keys ending at the current hour, newest first
pub fn hour_keys_for_range(now: DateTime<Utc>, hours: usize) -> Vec<HourKey> {
    let mut keys = Vec::with_capacity(hours);
    let mut key = current_hour_key(now);
    for _ in 0..hours {
        keys.push(key);
        key = key.previous();
    }
    keys
}

/// Query bounds covering every key: inclusive start of the oldest hour,
/// exclusive end of the newest hour.
///
/// Returns `None` for an empty slice. Key order in the slice does not matter.
pub fn range_bounds(keys: &[HourKey]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let oldest = keys.iter().min()?;
    let newest = keys.iter().max()?;
    Some((oldest.start(), newest.end()))
}

/// Every hour key from `first` through `last` inclusive, oldest first.
///
/// The arguments may be given in either order.
pub fn hour_keys_between(first: HourKey, last: HourKey) -> Vec<HourKey> {
    let (mut key, last) = if first <= last { (first, last) } else { (last, first) };
    let mut keys = Vec::new();
    while key <= last {
        keys.push(key);
        key = key.next();
    }
    keys
}
