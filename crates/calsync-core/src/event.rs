//! Event types.
//!
//! - [`CalendarEvent`]: a synced event row belonging to a source
//! - [`LocalEvent`]: a user-originated event, optionally mirrored to CalDAV
//! - [`MergedEvent`]: an entry of the merged, display-level timeline

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::source::SourceType;

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Written locally, remote write not yet confirmed.
    Pending,
    /// In sync with its origin.
    #[default]
    Confirmed,
    /// Soft-deleted or cancelled upstream.
    Cancelled,
    /// The remote write failed; local state still reflects user intent.
    Failed,
}

impl EventStatus {
    /// Returns the storage name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Maps an iCalendar `STATUS` value onto an event status.
    ///
    /// `TENTATIVE` and unknown values are treated as confirmed.
    pub fn from_ical(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("CANCELLED") {
            Self::Cancelled
        } else {
            Self::Confirmed
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// The content fields of an event, compared to detect changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContent {
    /// Event title.
    pub title: String,
    /// Plain-text description.
    pub description: Option<String>,
    /// Location.
    pub location: Option<String>,
    /// Start (UTC).
    pub start: DateTime<Utc>,
    /// End (UTC).
    pub end: DateTime<Utc>,
    /// Whether the event spans whole days.
    pub all_day: bool,
    /// Lifecycle status.
    pub status: EventStatus,
}

impl EventContent {
    /// Creates confirmed, timed content.
    pub fn new(title: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            description: None,
            location: None,
            start,
            end,
            all_day: false,
            status: EventStatus::Confirmed,
        }
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder method to set the location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Builder method to mark the event all-day.
    pub fn with_all_day(mut self, all_day: bool) -> Self {
        self.all_day = all_day;
        self
    }

    /// Builder method to set the status.
    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns the event duration.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// A partial update to an event's content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_day: Option<bool>,
}

impl EventChanges {
    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns a copy of `content` with these changes applied.
    pub fn apply(&self, content: &EventContent) -> EventContent {
        let mut next = content.clone();
        if let Some(ref title) = self.title {
            next.title = title.clone();
        }
        if let Some(ref description) = self.description {
            next.description = Some(description.clone());
        }
        if let Some(ref location) = self.location {
            next.location = Some(location.clone());
        }
        if let Some(start) = self.start {
            next.start = start;
        }
        if let Some(end) = self.end {
            next.end = end;
        }
        if let Some(all_day) = self.all_day {
            next.all_day = all_day;
        }
        next
    }
}

/// A synced event belonging to a source.
///
/// `(source_id, uid, recurrence_id, content.start, content.end)` identifies
/// one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Store row id.
    pub id: i64,
    /// Owning source.
    pub source_id: String,
    /// Remote UID or synthetic hash.
    pub uid: String,
    /// Disambiguates instances of a recurring remote event.
    pub recurrence_id: Option<String>,
    /// Compared content.
    #[serde(flatten)]
    pub content: EventContent,
    /// Incremented on every content change, starting at 1.
    pub version: u32,
    /// Last known remote ETag.
    pub etag: Option<String>,
    /// Remote object URL (CalDAV).
    pub href: Option<String>,
    /// When the row was first stored.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

/// A user-originated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEvent {
    /// Local identifier, also used as the remote UID when mirrored.
    pub id: String,
    /// CalDAV source this event is mirrored to, if any.
    pub source_id: Option<String>,
    /// Event content.
    #[serde(flatten)]
    pub content: EventContent,
    /// Incremented on every content change, starting at 1.
    pub version: u32,
    /// Last known remote ETag.
    pub etag: Option<String>,
    /// Remote object URL.
    pub href: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change time.
    pub updated_at: DateTime<Utc>,
}

/// Where a merged event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Local event store.
    Local,
    /// A CalDAV source.
    #[serde(rename = "caldav")]
    CalDav,
    /// An ICS feed.
    Ics,
}

impl EventOrigin {
    /// Tie-break priority when start times are equal; lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Local => 0,
            Self::CalDav => 1,
            Self::Ics => 2,
        }
    }
}

impl From<SourceType> for EventOrigin {
    fn from(source_type: SourceType) -> Self {
        match source_type {
            SourceType::Ics => Self::Ics,
            SourceType::CalDav => Self::CalDav,
        }
    }
}

/// An entry of the merged timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEvent {
    /// Local id or synced uid.
    pub id: String,
    /// Origin of the event.
    pub origin: EventOrigin,
    /// Owning source, if any.
    pub source_id: Option<String>,
    /// Event content.
    #[serde(flatten)]
    pub content: EventContent,
}

impl From<&LocalEvent> for MergedEvent {
    fn from(event: &LocalEvent) -> Self {
        Self {
            id: event.id.clone(),
            origin: EventOrigin::Local,
            source_id: event.source_id.clone(),
            content: event.content.clone(),
        }
    }
}

/// Computes the synthetic UID for an event without a usable remote UID.
///
/// SHA-1 over title, start, end and location, hex encoded.
pub fn synthetic_uid(
    title: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    location: Option<&str>,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(start.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(end.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(location.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}
