//! Per-source token buckets guarding outbound writes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use calsync_core::{Clock, SystemClock};

/// Bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum tokens per source.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_second: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_per_second: 0.5,
        }
    }
}

/// Buckets untouched for this long are dropped by [`QuotaManager::evict_idle`].
const IDLE_EVICTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

impl Bucket {
    fn refill(&mut self, now: DateTime<Utc>, config: &QuotaConfig) {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * config.refill_per_second).min(config.capacity as f64);
        self.last_refill = now;
    }
}

/// Token buckets keyed by source id. Buckets start full.
pub struct QuotaManager {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, Bucket>,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn with_bucket<T>(&self, source_id: &str, f: impl FnOnce(&mut Bucket) -> T) -> T {
        let now = self.clock.now();
        let mut bucket = self.buckets.entry(source_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.config.capacity as f64,
            last_refill: now,
            last_used: now,
        });
        bucket.refill(now, &self.config);
        bucket.last_used = now;
        f(&mut bucket)
    }

    /// Returns true if at least one token is available, without consuming it.
    pub fn can_write(&self, source_id: &str) -> bool {
        self.with_bucket(source_id, |bucket| bucket.tokens >= 1.0)
    }

    /// Takes one token; returns false when the bucket is empty.
    pub fn consume_token(&self, source_id: &str) -> bool {
        let consumed = self.with_bucket(source_id, |bucket| {
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                true
            } else {
                false
            }
        });
        if !consumed {
            debug!(source_id, "Write quota exhausted");
        }
        consumed
    }

    /// Tokens currently available (after refill).
    pub fn available(&self, source_id: &str) -> f64 {
        self.with_bucket(source_id, |bucket| bucket.tokens)
    }

    /// Drops buckets idle for 24 hours. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.clock.now() - Duration::hours(IDLE_EVICTION_HOURS);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_used > cutoff);
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle quota buckets");
        }
        evicted
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl std::fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager")
            .field("config", &self.config)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
