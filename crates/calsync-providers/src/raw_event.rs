//! Events as they come out of a source, before reconciliation.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use calsync_core::{EventContent, EventStatus, start_of_day};

/// A start or end value from an iCalendar document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum RawEventTime {
    /// A timestamp (UTC, or floating treated as UTC).
    DateTime(DateTime<Utc>),
    /// A date-only value.
    Date(NaiveDate),
}

impl RawEventTime {
    /// Returns the instant, placing dates at UTC midnight.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            Self::DateTime(dt) => *dt,
            Self::Date(date) => start_of_day(*date),
        }
    }

    pub fn is_date(&self) -> bool {
        matches!(self, Self::Date(_))
    }
}

/// One VEVENT as parsed from a feed or a CalDAV object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// `UID`, absent for some CalDAV objects.
    pub uid: Option<String>,
    /// `SUMMARY`.
    pub summary: Option<String>,
    /// `DESCRIPTION`, unescaped and HTML-stripped.
    pub description: Option<String>,
    /// `LOCATION`.
    pub location: Option<String>,
    /// `DTSTART`.
    pub start: RawEventTime,
    /// `DTEND`.
    pub end: Option<RawEventTime>,
    /// `STATUS`.
    pub status: Option<String>,
    /// `RECURRENCE-ID` in `YYYYMMDDTHHMMSSZ` form.
    pub recurrence_id: Option<String>,
    /// `RRULE`, for recurring masters.
    pub rrule: Option<String>,
    /// CalDAV object URL.
    pub href: Option<String>,
    /// CalDAV object ETag.
    pub etag: Option<String>,
}

impl RawEvent {
    /// Creates an event with only a start.
    pub fn new(start: RawEventTime) -> Self {
        Self {
            uid: None,
            summary: None,
            description: None,
            location: None,
            start,
            end: None,
            status: None,
            recurrence_id: None,
            rrule: None,
            href: None,
            etag: None,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_end(mut self, end: RawEventTime) -> Self {
        self.end = Some(end);
        self
    }

    /// Returns true if UID, title, start and end are all present.
    pub fn is_complete(&self) -> bool {
        self.uid.as_deref().is_some_and(|u| !u.trim().is_empty())
            && self.summary.as_deref().is_some_and(|s| !s.trim().is_empty())
            && self.end.is_some()
    }

    /// Returns the end instant, defaulting to one day for date starts and
    /// zero length otherwise.
    pub fn end_utc(&self) -> DateTime<Utc> {
        match self.end {
            Some(end) => end.to_utc(),
            None if self.start.is_date() => self.start.to_utc() + Duration::days(1),
            None => self.start.to_utc(),
        }
    }

    /// Converts into the content fields compared during reconciliation.
    ///
    /// All-day is inferred from the span: a positive exact multiple of 24h.
    pub fn to_content(&self) -> EventContent {
        let start = self.start.to_utc();
        let end = self.end_utc();
        EventContent {
            title: self.summary.clone().unwrap_or_default(),
            description: self.description.clone(),
            location: self.location.clone(),
            start,
            end,
            all_day: is_all_day_span(start, end),
            status: self
                .status
                .as_deref()
                .map_or(EventStatus::Confirmed, EventStatus::from_ical),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("CANCELLED"))
    }
}

/// Returns true if the span is a positive whole number of days.
pub fn is_all_day_span(start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    let span = end - start;
    span > Duration::zero() && span.num_milliseconds() % Duration::days(1).num_milliseconds() == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn all_day_inferred_from_span() {
        let start = Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap();
        assert!(is_all_day_span(start, start + Duration::days(1)));
        assert!(is_all_day_span(start, start + Duration::days(3)));
        assert!(!is_all_day_span(start, start + Duration::hours(25)));
        assert!(!is_all_day_span(start, start));
    }

    #[test]
    fn content_conversion() {
        let date = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
        let raw = RawEvent::new(RawEventTime::Date(date))
            .with_uid("holiday-1")
            .with_summary("Company Holiday");
        assert!(!raw.is_complete());

        let content = raw.to_content();
        assert!(content.all_day);
        assert_eq!(content.end - content.start, Duration::days(1));
        assert_eq!(content.status, EventStatus::Confirmed);
    }

    #[test]
    fn cancelled_status() {
        let start = Utc.with_ymd_and_hms(2025, 2, 10, 9, 0, 0).unwrap();
        let mut raw = RawEvent::new(RawEventTime::DateTime(start))
            .with_end(RawEventTime::DateTime(start + Duration::hours(1)));
        raw.status = Some("cancelled".into());
        assert!(raw.is_cancelled());
        assert_eq!(raw.to_content().status, EventStatus::Cancelled);
    }
}
