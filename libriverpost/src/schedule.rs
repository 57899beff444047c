//! Weekly quiet-hours schedule
//!
//! A schedule is the set of hours of the week (0..168, Monday 00:00 UTC is
//! hour 0) during which a link may publish. Outside those hours postings are
//! held in the [`Buffer`](crate::buffer::Buffer) until the next allowed hour.
//!
//! The stored form is compact: each hour is two lowercase hex digits, so
//! `{2, 5, 26}` is stored as `"02051a"`.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RiverError};

pub const HOURS_PER_WEEK: u8 = 168;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredSchedule", into = "StoredSchedule")]
pub struct Schedule {
    enabled: bool,
    hours: Vec<u8>,
}

impl Schedule {
    /// Build a schedule; hours are sorted and deduplicated
    pub fn new(enabled: bool, hours: impl IntoIterator<Item = u8>) -> Result<Self> {
        let mut hours: Vec<u8> = hours.into_iter().collect();
        if let Some(bad) = hours.iter().find(|h| **h >= HOURS_PER_WEEK) {
            return Err(RiverError::InvalidInput(format!(
                "hour of week {} out of range 0..{}",
                bad, HOURS_PER_WEEK
            )));
        }
        hours.sort_unstable();
        hours.dedup();
        Ok(Self { enabled, hours })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn hours(&self) -> &[u8] {
        &self.hours
    }

    /// Disabled or empty schedules never hold anything back
    pub fn is_active(&self) -> bool {
        self.enabled && !self.hours.is_empty()
    }

    pub fn contains(&self, hour: u8) -> bool {
        self.hours.binary_search(&hour).is_ok()
    }

    /// Hours from `hour` to the next allowed hour strictly after it
    ///
    /// Wraps around the end of the week. `None` for an empty schedule.
    pub fn hours_to_next_window(&self, hour: u8) -> Option<u32> {
        let first = *self.hours.first()?;
        let idx = self.hours.partition_point(|h| *h <= hour);
        let delta = match self.hours.get(idx) {
            Some(next) => u32::from(*next - hour),
            None => u32::from(HOURS_PER_WEEK) - u32::from(hour) + u32::from(first),
        };
        Some(delta)
    }

    pub fn compact(&self) -> String {
        compact(&self.hours)
    }
}

/// Encode hours as fixed-width lowercase hex pairs
pub fn compact(hours: &[u8]) -> String {
    hours.iter().map(|h| format!("{:02x}", h)).collect()
}

/// Decode the compact form; the result is sorted and deduplicated
pub fn expand(compact: &str) -> Result<Vec<u8>> {
    if compact.len() % 2 != 0 || !compact.is_ascii() {
        return Err(RiverError::InvalidInput(format!(
            "malformed schedule string '{}'",
            compact
        )));
    }
    let mut hours = compact
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .filter(|h| *h < HOURS_PER_WEEK)
                .ok_or_else(|| {
                    RiverError::InvalidInput(format!("bad hour code in schedule '{}'", compact))
                })
        })
        .collect::<Result<Vec<u8>>>()?;
    hours.sort_unstable();
    hours.dedup();
    Ok(hours)
}

/// Hour of the week (Monday 00:00 UTC = 0) for an epoch timestamp
pub fn hour_of_week(epoch: i64) -> Result<u8> {
    let at = DateTime::<Utc>::from_timestamp(epoch, 0)
        .ok_or_else(|| RiverError::InvalidInput(format!("timestamp {} out of range", epoch)))?;
    let hour = at.weekday().num_days_from_monday() * 24 + at.hour();
    // Always below 168
    Ok(hour as u8)
}

/// Persisted shape: `{"on": bool, "s": "<hex pairs>"}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSchedule {
    on: bool,
    s: String,
}

impl TryFrom<StoredSchedule> for Schedule {
    type Error = RiverError;

    fn try_from(stored: StoredSchedule) -> Result<Self> {
        Ok(Self {
            enabled: stored.on,
            hours: expand(&stored.s)?,
        })
    }
}

impl From<Schedule> for StoredSchedule {
    fn from(schedule: Schedule) -> Self {
        Self {
            on: schedule.enabled,
            s: compact(&schedule.hours),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn weekdays(from: u8, to: u8) -> Vec<u8> {
        (0..5u8).flat_map(|d| (from..=to).map(move |h| d * 24 + h)).collect()
    }

    #[test]
    fn test_next_window_wraps() {
        let schedule = Schedule::new(true, [2, 5]).unwrap();
        assert_eq!(schedule.hours_to_next_window(6), Some(164));
        assert_eq!(schedule.hours_to_next_window(2), Some(3));
        assert_eq!(schedule.hours_to_next_window(0), Some(2));
        assert_eq!(schedule.hours_to_next_window(167), Some(3));
    }

    #[test]
    fn test_business_hours_evening() {
        let schedule = Schedule::new(true, weekdays(9, 17)).unwrap();
        // Monday 20:00 -> Tuesday 09:00
        assert!(!schedule.contains(20));
        assert_eq!(schedule.hours_to_next_window(20), Some(13));
        // Friday 18:00 -> Monday 09:00
        assert_eq!(schedule.hours_to_next_window(4 * 24 + 18), Some(63));
    }

    #[test]
    fn test_empty_schedule() {
        let schedule = Schedule::new(true, []).unwrap();
        assert!(!schedule.is_active());
        assert_eq!(schedule.hours_to_next_window(10), None);
        assert!(!Schedule::new(false, [1]).unwrap().is_active());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(Schedule::new(true, [168]).is_err());
        assert!(expand("a8").is_err());
        assert!(expand("0").is_err());
        assert!(expand("zz").is_err());
    }

    #[test]
    fn test_compact_form() {
        let schedule = Schedule::new(true, [26, 2, 5, 2]).unwrap();
        assert_eq!(schedule.compact(), "02051a");
        assert_eq!(expand("1a0205").unwrap(), vec![2, 5, 26]);
    }

    #[test]
    fn test_stored_json_shape() {
        let schedule = Schedule::new(true, [0, 167]).unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, r#"{"on":true,"s":"00a7"}"#);
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
        assert!(serde_json::from_str::<Schedule>(r#"{"on":true,"s":"abc"}"#).is_err());
    }

    #[test]
    fn test_hour_of_week() {
        // 2024-01-01 was a Monday
        let monday = DateTime::parse_from_rfc3339("2024-01-01T00:30:00Z").unwrap();
        assert_eq!(hour_of_week(monday.timestamp()).unwrap(), 0);
        let sunday = DateTime::parse_from_rfc3339("2024-01-07T23:59:00Z").unwrap();
        assert_eq!(hour_of_week(sunday.timestamp()).unwrap(), 167);
        let tuesday = DateTime::parse_from_rfc3339("2024-01-02T20:00:00Z").unwrap();
        assert_eq!(hour_of_week(tuesday.timestamp()).unwrap(), 44);
    }

    proptest! {
        #[test]
        fn compact_expand_round_trips(hours in proptest::collection::btree_set(0u8..168, 0..=168)) {
            let sorted: Vec<u8> = hours.into_iter().collect();
            let encoded = compact(&sorted);
            prop_assert_eq!(encoded.len(), sorted.len() * 2);
            prop_assert_eq!(expand(&encoded).unwrap(), sorted);
        }

        #[test]
        fn next_window_lands_in_schedule(
            hours in proptest::collection::btree_set(0u8..168, 1..40),
            now in 0u8..168,
        ) {
            let schedule = Schedule::new(true, hours).unwrap();
            let delta = schedule.hours_to_next_window(now).unwrap();
            prop_assert!(delta >= 1 && delta <= 168);
            let target = ((u32::from(now) + delta) % 168) as u8;
            prop_assert!(schedule.contains(target));
        }
    }
}
