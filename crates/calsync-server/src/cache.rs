//! Merged-window cache with TTL support.
//!
//! Entries are keyed by [`TimeWindow::cache_key`] and expire against the
//! injected [`Clock`], so tests can step time explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use calsync_core::{Clock, MergedEvent, TimeWindow};

#[derive(Debug, Clone)]
struct CacheEntry {
    events: Vec<MergedEvent>,
    expires_at: DateTime<Utc>,
}

/// TTL cache of merged timelines.
pub struct MergeCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MergeCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the cached events for `window` if not expired.
    pub fn get(&self, window: &TimeWindow) -> Option<Vec<MergedEvent>> {
        let key = window.cache_key();
        let now = self.clock.now();
        let mut entries = self.entries();
        match entries.get(&key) {
            Some(entry) if now < entry.expires_at => {
                trace!(key = %key, "merge cache hit");
                Some(entry.events.clone())
            }
            Some(_) => {
                entries.remove(&key);
                debug!(key = %key, "merge cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Stores `events` for `window`, dropping entries that already expired.
    pub fn insert(&self, window: &TimeWindow, events: Vec<MergedEvent>) {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "expired merge cache entries swept");
        }
        entries.insert(
            window.cache_key(),
            CacheEntry {
                events,
                expires_at: now + ttl,
            },
        );
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        if count > 0 {
            debug!(count, "merge cache cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl std::fmt::Debug for MergeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{EventContent, EventOrigin, ManualClock};
    use chrono::TimeZone;

    fn window() -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2025, 2, 3, 0, 0, 0).unwrap();
        TimeWindow::new(start, start + chrono::Duration::days(7))
    }

    fn event() -> MergedEvent {
        let start = Utc.with_ymd_and_hms(2025, 2, 4, 9, 0, 0).unwrap();
        MergedEvent {
            id: "e1".into(),
            origin: EventOrigin::Local,
            source_id: None,
            content: EventContent::new("Review", start, start + chrono::Duration::hours(1)),
        }
    }

    #[test]
    fn expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 3, 8, 0, 0).unwrap()));
        let cache = MergeCache::new(Duration::from_secs(30), clock.clone());

        cache.insert(&window(), vec![event()]);
        assert_eq!(cache.get(&window()).map(|e| e.len()), Some(1));

        clock.advance(chrono::Duration::seconds(29));
        assert!(cache.get(&window()).is_some());

        clock.advance(chrono::Duration::seconds(1));
        assert!(cache.get(&window()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_sweeps_expired_windows() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 3, 8, 0, 0).unwrap()));
        let cache = MergeCache::new(Duration::from_secs(30), clock.clone());
        let stale = window().extend(chrono::Duration::days(1));

        cache.insert(&stale, vec![event()]);
        clock.advance(chrono::Duration::seconds(10));
        cache.insert(&window(), vec![]);
        assert_eq!(cache.len(), 2);

        clock.advance(chrono::Duration::seconds(25));
        let fresh = window().extend(chrono::Duration::days(2));
        cache.insert(&fresh, vec![event()]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&stale).is_none());
        assert!(cache.get(&window()).is_some());
    }

    #[test]
    fn clear_drops_all_windows() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 3, 8, 0, 0).unwrap()));
        let cache = MergeCache::new(Duration::from_secs(30), clock);
        let other = window().extend(chrono::Duration::days(1));

        cache.insert(&window(), vec![]);
        cache.insert(&other, vec![event()]);
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.get(&other).is_none());
    }
}
