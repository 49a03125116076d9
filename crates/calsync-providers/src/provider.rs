//! Adapter traits.
//!
//! - [`CalendarAdapter`]: read side, one implementation per [`SourceType`]
//! - [`RemoteWriter`]: write side, implemented by adapters that support it
//! - [`Adapters`]: the instance-owned registry the sync service dispatches on

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use calsync_core::{CalendarSource, EventChanges, EventContent, SourceType, TimeWindow};
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};
use crate::raw_event::RawEvent;

/// A boxed future, keeping the adapter traits object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Options for one fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Range to query (CalDAV REPORT time-range).
    pub window: TimeWindow,
    /// ETag from the previous fetch, for a conditional GET.
    pub if_none_match: Option<String>,
}

impl FetchOptions {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            if_none_match: None,
        }
    }

    pub fn with_if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }
}

/// The outcome of a fetch.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub events: Vec<RawEvent>,
    /// Change tokens to persist (feed ETag, collection CTags).
    pub change_tokens: BTreeMap<String, String>,
    /// The remote reported no change since `if_none_match`.
    pub not_modified: bool,
    /// Calendars that failed and were skipped.
    pub skipped: Vec<String>,
}

impl FetchResult {
    pub fn with_events(events: Vec<RawEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn not_modified() -> Self {
        Self {
            not_modified: true,
            ..Default::default()
        }
    }

    pub fn with_change_token(mut self, key: impl Into<String>, token: impl Into<String>) -> Self {
        self.change_tokens.insert(key.into(), token.into());
        self
    }
}

/// Read side of a source type.
pub trait CalendarAdapter: Send + Sync {
    /// Adapter name used in logs and errors.
    fn name(&self) -> &str;

    /// Fetches and normalizes the source's events.
    fn fetch_events<'a>(
        &'a self,
        source: &'a CalendarSource,
        options: FetchOptions,
    ) -> BoxFuture<'a, ProviderResult<FetchResult>>;

    /// Cheap reachability probe. Never errors; failures are `false`.
    fn validate_source<'a>(&'a self, source: &'a CalendarSource) -> BoxFuture<'a, bool>;
}

/// Global write switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFlags {
    /// Master switch for outbound writes.
    pub write_enabled: bool,
    /// Pretend writes succeeded without contacting the server.
    pub dry_run: bool,
}

impl WriteFlags {
    /// Fails with `WriteNotAllowed` unless both the global switch and the
    /// source's policy permit writes.
    pub fn check(&self, source: &CalendarSource) -> ProviderResult<()> {
        if !self.write_enabled {
            return Err(ProviderError::write_not_allowed("outbound writes are disabled"));
        }
        if !source.allows_writes() {
            return Err(ProviderError::write_not_allowed(format!(
                "source {} is read-only",
                source.id
            )));
        }
        Ok(())
    }
}

/// An event as addressed on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub uid: String,
    pub content: EventContent,
    /// Object URL, when already known.
    pub href: Option<String>,
    /// Last known ETag.
    pub etag: Option<String>,
}

/// Result of a successful remote write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub href: Option<String>,
    /// New ETag reported by the server, if any.
    pub etag: Option<String>,
    /// True when nothing was sent because of dry-run.
    pub dry_run: bool,
}

impl WriteOutcome {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }
}

/// Write side of a source type.
pub trait RemoteWriter: Send + Sync {
    fn create_event<'a>(
        &'a self,
        source: &'a CalendarSource,
        flags: WriteFlags,
        event: &'a RemoteEvent,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>>;

    /// Applies `changes` on top of `before`, guarded by `before.etag`.
    fn update_event<'a>(
        &'a self,
        source: &'a CalendarSource,
        flags: WriteFlags,
        before: &'a RemoteEvent,
        changes: &'a EventChanges,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>>;

    /// Deletes the object; an already missing object counts as deleted.
    fn delete_event<'a>(
        &'a self,
        source: &'a CalendarSource,
        flags: WriteFlags,
        event: &'a RemoteEvent,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>>;
}

/// One adapter per source type.
#[derive(Clone)]
pub struct Adapters {
    pub ics: Arc<dyn CalendarAdapter>,
    pub caldav: Arc<dyn CalendarAdapter>,
    /// Write path for CalDAV sources.
    pub caldav_writer: Arc<dyn RemoteWriter>,
}

impl Adapters {
    /// Returns the adapter for a source type.
    pub fn for_type(&self, source_type: SourceType) -> &Arc<dyn CalendarAdapter> {
        match source_type {
            SourceType::Ics => &self.ics,
            SourceType::CalDav => &self.caldav,
        }
    }

    /// Returns the writer for a source type, if writes are supported.
    pub fn writer_for(&self, source_type: SourceType) -> Option<&Arc<dyn RemoteWriter>> {
        match source_type {
            SourceType::Ics => None,
            SourceType::CalDav => Some(&self.caldav_writer),
        }
    }
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters")
            .field("ics", &self.ics.name())
            .field("caldav", &self.caldav.name())
            .finish()
    }
}
