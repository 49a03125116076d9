//! Persistent sync service.
//!
//! One cycle per source: validate, fetch, expand recurring masters, store,
//! then record metadata and an audit entry. A failing source never stops
//! the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use calsync_core::{
    AuditActor, AuditEntry, AuditOperation, CalendarEvent, CalendarSource, SourceType, TimeWindow,
    expand, parse_rule, synthetic_uid,
};
use calsync_providers::feed::ETAG_TOKEN;
use calsync_providers::{Adapters, FetchOptions, RawEvent, RawEventTime};

use crate::error::ServerResult;
use crate::sources::SourceManager;
use crate::store::{EventKey, IncomingEvent, Store, UpsertOutcome};

/// `RECURRENCE-ID` form used for generated instances.
pub const RECURRENCE_ID_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Counts from one `store_events` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl StoreSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.failed
    }
}

/// What happened to one source in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced(StoreSummary),
    NotModified,
    Skipped { reason: String },
    Failed { error: String, needs_reauth: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub source_id: String,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
}

/// Connectivity and bookkeeping for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub name: String,
    pub enabled: bool,
    pub reachable: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub needs_reauth: bool,
}

/// Orchestrates fetch and reconciliation for every source.
#[derive(Debug, Clone)]
pub struct SyncService {
    store: Arc<Store>,
    sources: SourceManager,
    adapters: Adapters,
    window_extension_days: u32,
}

impl SyncService {
    pub fn new(store: Arc<Store>, adapters: Adapters, window_extension_days: u32) -> Self {
        Self {
            sources: SourceManager::new(store.clone()),
            store,
            adapters,
            window_extension_days,
        }
    }

    pub fn sources(&self) -> &SourceManager {
        &self.sources
    }

    pub fn adapters(&self) -> &Adapters {
        &self.adapters
    }

    /// The window fetched in the current cycle.
    pub fn sync_window(&self) -> TimeWindow {
        TimeWindow::sync_window(self.store.clock().now(), self.window_extension_days)
    }

    /// Syncs every enabled source, one after the other.
    pub async fn sync_all(&self) -> ServerResult<Vec<SyncReport>> {
        let sources = self.sources.list_enabled()?;
        let mut reports = Vec::with_capacity(sources.len());
        for source in &sources {
            reports.push(self.sync_source(source).await);
        }
        let failed = reports
            .iter()
            .filter(|r| matches!(r.outcome, SyncOutcome::Failed { .. }))
            .count();
        info!(sources = reports.len(), failed, "sync cycle finished");
        Ok(reports)
    }

    /// Runs one cycle for a source. Failures are recorded, not returned.
    pub async fn sync_source(&self, source: &CalendarSource) -> SyncReport {
        let report = |outcome| SyncReport {
            source_id: source.id.clone(),
            outcome,
        };

        if !source.enabled {
            return report(SyncOutcome::Skipped {
                reason: "source disabled".into(),
            });
        }
        if source.metadata.needs_reauth {
            debug!(source_id = %source.id, "skipping source awaiting re-authentication");
            return report(SyncOutcome::Skipped {
                reason: "source needs re-authentication".into(),
            });
        }

        let adapter = self.adapters.for_type(source.source_type);
        if !adapter.validate_source(source).await {
            warn!(source_id = %source.id, adapter = adapter.name(), "source validation failed");
            return report(self.fail(source, "source validation failed", false));
        }

        let window = self.sync_window();
        let mut options = FetchOptions::new(window);
        if source.source_type == SourceType::Ics
            && let Some(etag) = source.metadata.change_tokens.get(ETAG_TOKEN)
        {
            options = options.with_if_none_match(etag.clone());
        }

        let fetched = match adapter.fetch_events(source, options).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let needs_reauth = e.is_auth_failure();
                warn!(source_id = %source.id, error = %e, needs_reauth, "fetch failed");
                return report(self.fail(source, &e.to_string(), needs_reauth));
            }
        };
        for calendar in &fetched.skipped {
            debug!(source_id = %source.id, calendar = %calendar, "calendar skipped this cycle");
        }

        if fetched.not_modified {
            return match self.sources.record_success(source, fetched.change_tokens) {
                Ok(_) => {
                    debug!(source_id = %source.id, "source not modified");
                    report(SyncOutcome::NotModified)
                }
                Err(e) => report(self.fail(source, &e.to_string(), false)),
            };
        }

        let events = expand_recurring(fetched.events, window);
        let summary = self.store_events(&source.id, &events);

        if let Err(e) = self.sources.record_success(source, fetched.change_tokens) {
            return report(self.fail(source, &e.to_string(), false));
        }
        let audit = AuditEntry::new(AuditOperation::Sync, AuditActor::System)
            .for_source(&source.id)
            .with_after(&summary);
        if let Err(e) = self.store.append_audit(&audit) {
            warn!(source_id = %source.id, error = %e, "failed to record sync audit");
        }

        info!(
            source_id = %source.id,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "source synced"
        );
        report(SyncOutcome::Synced(summary))
    }

    fn fail(&self, source: &CalendarSource, message: &str, needs_reauth: bool) -> SyncOutcome {
        if let Err(e) = self.sources.record_failure(source, message, needs_reauth) {
            warn!(source_id = %source.id, error = %e, "failed to record sync failure");
        }
        SyncOutcome::Failed {
            error: message.to_string(),
            needs_reauth,
        }
    }

    /// Reconciles events against the store, one transaction per event.
    ///
    /// Events without a UID get a synthetic one. Per-event failures are
    /// counted, never propagated.
    pub fn store_events(&self, source_id: &str, events: &[RawEvent]) -> StoreSummary {
        let mut summary = StoreSummary::default();
        for raw in events {
            let incoming = to_incoming(source_id, raw);
            match self.store.upsert_event(&incoming) {
                Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
                Ok(UpsertOutcome::Updated) => summary.updated += 1,
                Ok(UpsertOutcome::Unchanged) => summary.unchanged += 1,
                Err(e) => {
                    warn!(source_id, uid = %incoming.key.uid, error = %e, "failed to store event");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Non-cancelled synced events overlapping `window`.
    pub fn events_in_window(&self, window: &TimeWindow) -> ServerResult<Vec<(CalendarEvent, SourceType)>> {
        self.store.events_in_window(window)
    }

    /// Probes a source and reports its bookkeeping.
    pub async fn health_check(&self, source_id: &str) -> ServerResult<SourceHealth> {
        let source = self.sources.get(source_id)?;
        let reachable = self
            .adapters
            .for_type(source.source_type)
            .validate_source(&source)
            .await;
        Ok(SourceHealth {
            source_id: source.id,
            name: source.name,
            enabled: source.enabled,
            reachable,
            last_sync_at: source.metadata.last_sync_at,
            consecutive_errors: source.metadata.consecutive_errors,
            last_error: source.metadata.last_error,
            needs_reauth: source.metadata.needs_reauth,
        })
    }
}

fn to_incoming(source_id: &str, raw: &RawEvent) -> IncomingEvent {
    let content = raw.to_content();
    let uid = match raw.uid.as_deref().map(str::trim) {
        Some(uid) if !uid.is_empty() => uid.to_string(),
        _ => synthetic_uid(&content.title, content.start, content.end, content.location.as_deref()),
    };
    IncomingEvent {
        key: EventKey {
            source_id: source_id.to_string(),
            uid,
            recurrence_id: raw.recurrence_id.clone().unwrap_or_default(),
            start: content.start,
            end: content.end,
        },
        content,
        etag: raw.etag.clone(),
        href: raw.href.clone(),
    }
}

/// Replaces recurring masters by their instances inside `window`.
///
/// Instances carry the master's fields with `recurrence_id` set to the
/// instance start. A fetched override (same UID and recurrence id) replaces
/// the generated instance. Masters with an unusable rule are kept as single
/// events.
pub fn expand_recurring(events: Vec<RawEvent>, window: TimeWindow) -> Vec<RawEvent> {
    let overrides: HashMap<&str, HashSet<&str>> =
        events
            .iter()
            .filter_map(|e| Some((e.uid.as_deref()?, e.recurrence_id.as_deref()?)))
            .fold(HashMap::new(), |mut acc, (uid, rid)| {
                acc.entry(uid).or_default().insert(rid);
                acc
            });

    let mut generated = Vec::new();
    for master in events
        .iter()
        .filter(|e| e.recurrence_id.is_none() && e.rrule.is_some())
    {
        let Some(rule) = master.rrule.as_deref().and_then(parse_rule) else {
            debug!(uid = ?master.uid, rrule = ?master.rrule, "unusable recurrence rule, keeping master");
            generated.push(master.clone());
            continue;
        };
        let replaced = master
            .uid
            .as_deref()
            .and_then(|uid| overrides.get(uid));
        for (start, end) in expand(&rule, window, master.start.to_utc(), master.end_utc()) {
            let recurrence_id = start.format(RECURRENCE_ID_FORMAT).to_string();
            if replaced.is_some_and(|ids| ids.contains(recurrence_id.as_str())) {
                continue;
            }
            let mut instance = master.clone();
            instance.start = RawEventTime::DateTime(start);
            instance.end = Some(RawEventTime::DateTime(end));
            instance.rrule = None;
            instance.recurrence_id = Some(recurrence_id);
            generated.push(instance);
        }
    }

    let mut result: Vec<RawEvent> = events
        .into_iter()
        .filter(|e| e.rrule.is_none() || e.recurrence_id.is_some())
        .collect();
    result.extend(generated);
    result
}
