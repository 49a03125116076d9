//! Time helpers for synchronization windows and due dates.
//!
//! This module provides [`TimeWindow`] for defining query ranges, the sliding
//! sync window used when fetching remote calendars, and end-of-day
//! normalization for due dates.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A time window for querying calendar events.
///
/// Represents a half-open interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start of the window (inclusive).
    pub start: DateTime<Utc>,
    /// End of the window (exclusive).
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a new time window.
    ///
    /// # Panics
    ///
    /// Panics if `start` is after `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start <= end, "TimeWindow start must be <= end");
        Self { start, end }
    }

    /// Creates a time window, returning `None` if `start` is after `end`.
    pub fn try_new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Creates a time window from a start time and duration.
    pub fn from_duration(start: DateTime<Utc>, duration: Duration) -> Self {
        Self::new(start, start + duration)
    }

    /// Returns the sliding window used for remote fetches.
    ///
    /// The window covers the ISO week (Monday to Monday) containing `now`,
    /// padded by two days on each side and extended forward by
    /// `extension_days`.
    pub fn sync_window(now: DateTime<Utc>, extension_days: u32) -> Self {
        let today = now.date_naive();
        let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        let start = start_of_day(week_start - Duration::days(2));
        let end = start_of_day(week_start + Duration::days(7 + 2 + i64::from(extension_days)));
        Self { start, end }
    }

    /// Returns the duration of this time window.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Checks if a datetime falls within this window.
    ///
    /// Uses half-open interval semantics: `[start, end)`.
    pub fn contains(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }

    /// Checks if an event with the given start and end overlaps this window.
    ///
    /// Zero-length events overlap when their start lies inside the window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if start == end {
            return self.contains(start);
        }
        start < self.end && end > self.start
    }

    /// Extends the window by the given duration on both ends.
    pub fn extend(&self, duration: Duration) -> Self {
        Self {
            start: self.start - duration,
            end: self.end + duration,
        }
    }

    /// Returns a stable string key for caching results per window.
    pub fn cache_key(&self) -> String {
        format!("{}..{}", self.start.timestamp_millis(), self.end.timestamp_millis())
    }
}

/// Returns midnight UTC for the given date.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Normalizes a date to 23:59:59.999 on that day (floating local time).
///
/// Due dates mean "due by the end of this day".
pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(end_of_day_time())
}

fn end_of_day_time() -> NaiveTime {
    NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN)
}
