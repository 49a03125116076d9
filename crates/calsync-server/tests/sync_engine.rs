//! Engine flows against in-process fake adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};

use calsync_core::{
    AuditActor, AuditOperation, CalendarSource, ConnectionParams, EventChanges, EventContent, EventOrigin,
    EventStatus, ManualClock, SourceType, TimeWindow, WritePolicy,
};
use calsync_providers::{
    Adapters, BoxFuture, CalendarAdapter, ConflictDetails, FetchOptions, FetchResult,
    ProviderError, ProviderResult, RawEvent, RawEventTime, RemoteEvent, RemoteWriter, WriteFlags,
    WriteOutcome,
};
use calsync_server::{
    CalDavSettings, Engine, IcsFeedSettings, ServerError, SourceUpdate, Store, SyncConfig,
    SyncOutcome,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 5, 8, 0, 0).unwrap()
}

fn timed(uid: &str, title: &str, start: DateTime<Utc>) -> RawEvent {
    RawEvent::new(RawEventTime::DateTime(start))
        .with_uid(uid)
        .with_summary(title)
        .with_end(RawEventTime::DateTime(start + Duration::hours(1)))
}

/// Serves a fixed event list; answers 304 once it has seen its own etag.
struct FakeFeed {
    events: Vec<RawEvent>,
    fetches: AtomicUsize,
    last_if_none_match: Mutex<Option<String>>,
    fail_auth: bool,
    fail_validation: bool,
}

impl FakeFeed {
    fn new(events: Vec<RawEvent>) -> Self {
        Self {
            events,
            fetches: AtomicUsize::new(0),
            last_if_none_match: Mutex::new(None),
            fail_auth: false,
            fail_validation: false,
        }
    }
}

impl CalendarAdapter for FakeFeed {
    fn name(&self) -> &str {
        "fake"
    }

    fn fetch_events<'a>(
        &'a self,
        _source: &'a CalendarSource,
        options: FetchOptions,
    ) -> BoxFuture<'a, ProviderResult<FetchResult>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            *self.last_if_none_match.lock().unwrap() = options.if_none_match.clone();
            if self.fail_auth {
                return Err(ProviderError::authentication("401 Unauthorized").with_status(401));
            }
            if options.if_none_match.as_deref() == Some("\"v1\"") {
                return Ok(FetchResult::not_modified());
            }
            Ok(FetchResult::with_events(self.events.clone()).with_change_token("etag", "\"v1\""))
        })
    }

    fn validate_source<'a>(&'a self, _source: &'a CalendarSource) -> BoxFuture<'a, bool> {
        Box::pin(async move { !self.fail_validation })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum WriterMode {
    Ok,
    Conflict,
    ServerDown,
}

struct FakeWriter {
    mode: Mutex<WriterMode>,
    calls: AtomicUsize,
}

impl FakeWriter {
    fn new(mode: WriterMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
        }
    }

    fn respond(&self, event: &RemoteEvent) -> ProviderResult<WriteOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock().unwrap() {
            WriterMode::Ok => Ok(WriteOutcome {
                href: Some(format!("/cal/work/{}.ics", event.uid)),
                etag: Some("\"w1\"".into()),
                dry_run: false,
            }),
            WriterMode::Conflict => Err(ProviderError::conflict(ConflictDetails {
                before: serde_json::to_value(event).unwrap(),
                attempted: serde_json::json!({}),
                summary: "event changed on the server".into(),
            })),
            WriterMode::ServerDown => Err(ProviderError::server("503 Service Unavailable").with_status(503)),
        }
    }
}

impl RemoteWriter for FakeWriter {
    fn create_event<'a>(
        &'a self,
        _source: &'a CalendarSource,
        _flags: WriteFlags,
        event: &'a RemoteEvent,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>> {
        Box::pin(async move { self.respond(event) })
    }

    fn update_event<'a>(
        &'a self,
        _source: &'a CalendarSource,
        _flags: WriteFlags,
        before: &'a RemoteEvent,
        _changes: &'a EventChanges,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>> {
        Box::pin(async move { self.respond(before) })
    }

    fn delete_event<'a>(
        &'a self,
        _source: &'a CalendarSource,
        _flags: WriteFlags,
        event: &'a RemoteEvent,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>> {
        Box::pin(async move { self.respond(event) })
    }
}

struct Harness {
    engine: Engine,
    config: SyncConfig,
    feed: Arc<FakeFeed>,
    writer: Arc<FakeWriter>,
    clock: Arc<ManualClock>,
}

fn harness(feed: FakeFeed, mode: WriterMode, write_enabled: bool) -> Harness {
    let mut config = SyncConfig::default();
    config.features.write_enabled = write_enabled;
    config.ics.push(IcsFeedSettings {
        name: "Team".into(),
        url: "https://example.com/team.ics".into(),
        color: None,
    });
    config.caldav.push(CalDavSettings {
        name: "Work".into(),
        url: "https://dav.example.com/cal/work/".into(),
        username: Some("alice".into()),
        password: Some("hunter2secret".into()),
        color: None,
        calendar_filter: None,
        write_policy: WritePolicy::Write,
    });

    let clock = Arc::new(ManualClock::new(now()));
    let store = Arc::new(Store::in_memory_with_clock(clock.clone()).unwrap());
    let feed = Arc::new(feed);
    let writer = Arc::new(FakeWriter::new(mode));
    let adapters = Adapters {
        ics: feed.clone(),
        caldav: Arc::new(FakeFeed::new(vec![])),
        caldav_writer: writer.clone(),
    };
    let engine = Engine::with_parts(&config, store, adapters);
    engine.sync.sources().bootstrap(&config.sources()).unwrap();
    Harness {
        engine,
        config,
        feed,
        writer,
        clock,
    }
}

fn ics_source(h: &Harness) -> CalendarSource {
    h.config.sources().into_iter().find(|s| s.source_type == SourceType::Ics).unwrap()
}

fn caldav_id(h: &Harness) -> String {
    h.config
        .sources()
        .into_iter()
        .find(|s| s.source_type == SourceType::CalDav)
        .unwrap()
        .id
}

fn week() -> TimeWindow {
    TimeWindow::sync_window(now(), 0)
}

#[test]
fn store_events_is_idempotent() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, false);
    let source = ics_source(&h);
    let events = vec![
        timed("a", "Planning", now() + Duration::hours(1)),
        timed("b", "Review", now() + Duration::hours(3)),
        timed("c", "Retro", now() + Duration::days(1)),
    ];

    let first = h.engine.sync.store_events(&source.id, &events);
    assert_eq!(first.inserted, 3);

    let second = h.engine.sync.store_events(&source.id, &events);
    assert_eq!((second.inserted, second.updated), (0, 0));
    assert_eq!(second.unchanged, 3);

    let mut changed = events.clone();
    changed[1].summary = Some("Design review".into());
    let third = h.engine.sync.store_events(&source.id, &changed);
    assert_eq!((third.inserted, third.updated, third.unchanged), (0, 1, 2));
}

#[tokio::test]
async fn sync_stores_tokens_and_uses_them_next_time() {
    let feed = FakeFeed::new(vec![timed("a", "Planning", now() + Duration::hours(1))]);
    let h = harness(feed, WriterMode::Ok, false);
    let source = ics_source(&h);

    let report = h.engine.sync.sync_source(&source).await;
    assert!(matches!(report.outcome, SyncOutcome::Synced(s) if s.inserted == 1));

    let stored = h.engine.sync.sources().get(&source.id).unwrap();
    assert_eq!(stored.metadata.change_tokens.get("etag").map(String::as_str), Some("\"v1\""));
    assert_eq!(stored.metadata.last_sync_at, Some(now()));

    let report = h.engine.sync.sync_source(&stored).await;
    assert_eq!(report.outcome, SyncOutcome::NotModified);
    assert_eq!(h.feed.last_if_none_match.lock().unwrap().as_deref(), Some("\"v1\""));

    let audit = h.engine.store.list_audit(10).unwrap();
    assert_eq!(audit[0].entry.operation, AuditOperation::Sync);
    assert_eq!(audit[0].entry.after.as_ref().unwrap()["inserted"], 1);
}

#[tokio::test]
async fn failed_validation_is_recorded_without_fetching() {
    let mut feed = FakeFeed::new(vec![timed("a", "Planning", now() + Duration::hours(1))]);
    feed.fail_validation = true;
    let h = harness(feed, WriterMode::Ok, false);
    let source = ics_source(&h);

    let report = h.engine.sync.sync_source(&source).await;
    assert!(matches!(report.outcome, SyncOutcome::Failed { needs_reauth: false, .. }));
    assert_eq!(h.feed.fetches.load(Ordering::SeqCst), 0);

    let stored = h.engine.sync.sources().get(&source.id).unwrap();
    assert_eq!(stored.metadata.consecutive_errors, 1);
    assert!(stored.metadata.last_error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(!stored.metadata.needs_reauth);
    assert_eq!(h.engine.store.count_events(&source.id).unwrap(), 0);
}

#[tokio::test]
async fn auth_failure_marks_reauth_and_skips() {
    let mut feed = FakeFeed::new(vec![]);
    feed.fail_auth = true;
    let h = harness(feed, WriterMode::Ok, false);
    let source = ics_source(&h);

    let report = h.engine.sync.sync_source(&source).await;
    assert!(matches!(report.outcome, SyncOutcome::Failed { needs_reauth: true, .. }));

    let stored = h.engine.sync.sources().get(&source.id).unwrap();
    assert!(stored.metadata.needs_reauth);
    assert_eq!(stored.metadata.consecutive_errors, 1);

    let report = h.engine.sync.sync_source(&stored).await;
    assert!(matches!(report.outcome, SyncOutcome::Skipped { .. }));
    assert_eq!(h.feed.fetches.load(Ordering::SeqCst), 1);

    let health = h.engine.sync.health_check(&source.id).await.unwrap();
    assert!(health.reachable);
    assert!(health.needs_reauth);
}

#[tokio::test]
async fn recurring_master_expands_in_window() {
    let mut master = timed("standup", "Standup", Utc.with_ymd_and_hms(2025, 2, 3, 9, 0, 0).unwrap());
    master.rrule = Some("FREQ=WEEKLY;BYDAY=MO,WE,FR".into());
    let h = harness(FakeFeed::new(vec![master]), WriterMode::Ok, false);

    let reports = h.engine.sync.sync_all().await.unwrap();
    assert_eq!(reports.len(), 2);

    let events = h.engine.sync.events_in_window(&week()).unwrap();
    assert!(events.len() >= 3);
    assert!(events.iter().all(|(e, t)| *t == SourceType::Ics && e.recurrence_id.is_some()));
}

#[tokio::test]
async fn merged_view_prefers_local_events() {
    let start = now() + Duration::hours(2);
    let feed = FakeFeed::new(vec![timed("a", "Lunch", start), timed("b", "Demo", start)]);
    let h = harness(feed, WriterMode::Ok, false);
    h.engine.sync.sync_source(&ics_source(&h)).await;

    h.engine
        .admin
        .create_event(None, EventContent::new("Lunch", start, start + Duration::hours(1)))
        .await
        .unwrap();

    let merged = h.engine.merger.get_merged_events(&week()).unwrap();
    let origins: Vec<(&str, EventOrigin)> = merged
        .iter()
        .map(|e| (e.content.title.as_str(), e.origin))
        .collect();
    assert_eq!(origins, [("Lunch", EventOrigin::Local), ("Demo", EventOrigin::Ics)]);
}

#[tokio::test]
async fn admin_create_mirrors_to_caldav() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, true);
    let start = now() + Duration::days(1);

    let event = h
        .engine
        .admin
        .create_event(Some(&caldav_id(&h)), EventContent::new("1:1", start, start + Duration::minutes(30)))
        .await
        .unwrap();

    assert_eq!(event.content.status, EventStatus::Confirmed);
    assert_eq!(event.etag.as_deref(), Some("\"w1\""));
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 1);
    let stored = h.engine.store.get_local_event(&event.id).unwrap().unwrap();
    assert_eq!(stored, event);
    assert!(h.engine.quota.available(&caldav_id(&h)) < 30.0);
}

#[tokio::test]
async fn admin_write_gates_run_before_persisting() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, false);
    let start = now() + Duration::days(1);
    let content = EventContent::new("Blocked", start, start + Duration::hours(1));

    let err = h
        .engine
        .admin
        .create_event(Some(&caldav_id(&h)), content.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::WriteNotAllowed { .. }));

    let err = h
        .engine
        .admin
        .create_event(Some(&ics_source(&h).id), content)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::WriteNotAllowed { .. }));

    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 0);
    assert!(h.engine.store.local_events_in_window(&week()).unwrap().is_empty());
    assert!(h.engine.store.list_audit(10).unwrap().is_empty());
}

#[tokio::test]
async fn admin_source_update_revokes_writes_and_masks_audit() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, true);
    let id = caldav_id(&h);

    let updated = h
        .engine
        .admin
        .update_source(
            &id,
            &SourceUpdate {
                name: Some("Work (read only)".into()),
                write_policy: Some(WritePolicy::None),
                password: Some("rotated-secret".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.name, "Work (read only)");
    assert!(!updated.allows_writes());

    let audit = h.engine.store.list_audit(10).unwrap();
    assert_eq!(audit[0].entry.operation, AuditOperation::SourceUpdate);
    let snapshot = serde_json::to_string(&audit[0].entry).unwrap();
    assert!(!snapshot.contains("rotated-secret"));
    assert!(!snapshot.contains("hunter2secret"));

    let start = now() + Duration::days(1);
    let err = h
        .engine
        .admin
        .create_event(Some(&id), EventContent::new("Sync", start, start + Duration::hours(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::WriteNotAllowed { .. }));
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn admin_conflict_marks_failed_and_surfaces() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, true);
    let start = now() + Duration::days(1);
    let event = h
        .engine
        .admin
        .create_event(Some(&caldav_id(&h)), EventContent::new("Budget", start, start + Duration::hours(1)))
        .await
        .unwrap();

    *h.writer.mode.lock().unwrap() = WriterMode::Conflict;
    let changes = EventChanges {
        title: Some("Budget v2".into()),
        ..Default::default()
    };
    let err = h.engine.admin.update_event(&event.id, &changes).await.unwrap_err();
    assert!(matches!(err, ServerError::Conflict(_)));
    // conflicts are never retried
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 2);

    let stored = h.engine.store.get_local_event(&event.id).unwrap().unwrap();
    assert_eq!(stored.content.status, EventStatus::Failed);
    assert_eq!(stored.content.title, "Budget v2");
    assert_eq!(stored.version, 2);
}

#[tokio::test(start_paused = true)]
async fn admin_transient_failure_keeps_local_change() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::ServerDown, true);
    let start = now() + Duration::days(1);

    let event = h
        .engine
        .admin
        .create_event(Some(&caldav_id(&h)), EventContent::new("Offsite", start, start + Duration::hours(8)))
        .await
        .unwrap();

    assert_eq!(event.content.status, EventStatus::Failed);
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 3);
    assert!(h.engine.store.get_local_event(&event.id).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_remote_delete_keeps_event_deleted() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, true);
    let start = now() + Duration::hours(4);
    let event = h
        .engine
        .admin
        .create_event(Some(&caldav_id(&h)), EventContent::new("Sync", start, start + Duration::hours(1)))
        .await
        .unwrap();

    *h.writer.mode.lock().unwrap() = WriterMode::ServerDown;
    let deleted = h.engine.admin.delete_event(&event.id).await.unwrap();
    assert_eq!(deleted.content.status, EventStatus::Cancelled);
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 4);

    let stored = h.engine.store.get_local_event(&event.id).unwrap().unwrap();
    assert_eq!(stored.content.status, EventStatus::Cancelled);
    assert!(h.engine.merger.get_merged_events(&week()).unwrap().is_empty());

    let audit = h.engine.store.list_audit(1).unwrap();
    assert_eq!(audit[0].entry.operation, AuditOperation::Delete);
    assert_eq!(audit[0].entry.actor, AuditActor::System);
    assert_eq!(audit[0].entry.after.as_ref().unwrap()["remote"], "failed");

    let err = h.engine.admin.delete_event(&event.id).await.unwrap_err();
    assert!(matches!(err, ServerError::Validation { .. }));
}

#[tokio::test]
async fn admin_delete_is_soft_with_tombstone() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, true);
    let start = now() + Duration::hours(4);
    let event = h
        .engine
        .admin
        .create_event(Some(&caldav_id(&h)), EventContent::new("Sync", start, start + Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(h.engine.merger.get_merged_events(&week()).unwrap().len(), 1);

    let deleted = h.engine.admin.delete_event(&event.id).await.unwrap();
    assert_eq!(deleted.content.status, EventStatus::Cancelled);

    let tombstones = h.engine.store.list_tombstones().unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].last_etag.as_deref(), Some("\"w1\""));
    assert!(h.engine.merger.get_merged_events(&week()).unwrap().is_empty());
    assert!(h.engine.admin.delete_event(&event.id).await.is_err());
}

#[tokio::test]
async fn quota_exhaustion_rejects_before_persisting() {
    let h = harness(FakeFeed::new(vec![]), WriterMode::Ok, true);
    let start = now() + Duration::days(2);
    let id = caldav_id(&h);
    for i in 0..30 {
        let content = EventContent::new(format!("Slot {}", i), start, start + Duration::minutes(15));
        h.engine.admin.create_event(Some(&id), content).await.unwrap();
    }

    let content = EventContent::new("One too many", start, start + Duration::minutes(15));
    let err = h.engine.admin.create_event(Some(&id), content.clone()).await.unwrap_err();
    assert!(matches!(err, ServerError::QuotaExceeded { .. }));

    h.clock.advance(Duration::seconds(2));
    assert!(h.engine.admin.create_event(Some(&id), content).await.is_ok());
}

#[test]
fn on_disk_store_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("calsync.db");
    let source = CalendarSource::new(SourceType::Ics, "Feed", ConnectionParams::new("https://x/f.ics"));
    {
        let store = Store::open(&path).unwrap();
        store.save_source(&source).unwrap();
    }
    let store = Store::open(&path).unwrap();
    assert_eq!(store.get_source(&source.id).unwrap().unwrap().name, "Feed");
}
