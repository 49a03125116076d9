//! Unified timeline of local and synced events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use calsync_core::{CalendarEvent, EventOrigin, LocalEvent, MergedEvent, SourceType, TimeWindow};

use crate::cache::MergeCache;
use crate::error::ServerResult;
use crate::store::Store;

/// Merges local and synced events and caches the result per window.
#[derive(Debug)]
pub struct EventMerger {
    store: Arc<Store>,
    cache: MergeCache,
}

impl EventMerger {
    pub fn new(store: Arc<Store>, ttl: Duration) -> Self {
        let cache = MergeCache::new(ttl, store.clock().clone());
        Self { store, cache }
    }

    /// Returns the merged, sorted events overlapping `window`.
    pub fn get_merged_events(&self, window: &TimeWindow) -> ServerResult<Vec<MergedEvent>> {
        if let Some(events) = self.cache.get(window) {
            return Ok(events);
        }
        let local = self.store.local_events_in_window(window)?;
        let synced = self.store.events_in_window(window)?;
        let merged = merge(&local, synced);
        debug!(
            local = local.len(),
            merged = merged.len(),
            window = %window.cache_key(),
            "merged timeline rebuilt"
        );
        self.cache.insert(window, merged.clone());
        Ok(merged)
    }

    /// Drops cached timelines; call after any write.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

/// Merges without I/O.
///
/// A local event hides synced events with the same title and start.
/// Synced duplicates (same title, start and source type) collapse to the
/// first one. The result is sorted by start, then local before CalDAV
/// before ICS.
pub fn merge(local: &[LocalEvent], synced: Vec<(CalendarEvent, SourceType)>) -> Vec<MergedEvent> {
    let local_keys: HashSet<(&str, DateTime<Utc>)> = local
        .iter()
        .map(|e| (e.content.title.as_str(), e.content.start))
        .collect();

    let mut seen: HashSet<(String, DateTime<Utc>, SourceType)> = HashSet::new();
    let mut merged: Vec<MergedEvent> = local.iter().map(MergedEvent::from).collect();
    for (event, source_type) in synced {
        let title = event.content.title.as_str();
        let start = event.content.start;
        if local_keys.contains(&(title, start)) {
            continue;
        }
        if !seen.insert((title.to_string(), start, source_type)) {
            continue;
        }
        merged.push(MergedEvent {
            id: event.uid,
            origin: EventOrigin::from(source_type),
            source_id: Some(event.source_id),
            content: event.content,
        });
    }

    merged.sort_by_key(|e| (e.content.start, e.origin.priority()));
    merged
}
