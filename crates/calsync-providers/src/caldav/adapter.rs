//! CalDAV read and write paths.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use calsync_core::{CalendarSource, EventChanges, TimeWindow};

use crate::error::{ConflictDetails, ProviderError, ProviderResult};
use crate::ical::{parse_events, serialize_event};
use crate::provider::{
    BoxFuture, CalendarAdapter, FetchOptions, FetchResult, RemoteEvent, RemoteWriter, WriteFlags,
    WriteOutcome,
};
use crate::raw_event::RawEvent;

use super::client::{CalDavClient, DavReply};
use super::config::CalDavConfig;
use super::xml::{
    DiscoveredCalendar, calendar_query_body, has_any_response, parse_propfind_response,
    parse_report_response, propfind_calendars_body,
};

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of the per-collection CTag change tokens.
pub const CTAG_TOKEN_PREFIX: &str = "ctag:";

const PROVIDER: &str = "caldav";

/// Adapter for `caldav` sources.
///
/// Holds one shared HTTP connection pool; a [`CalDavClient`] carrying the
/// source's credentials is built per operation.
#[derive(Debug, Clone)]
pub struct CalDavAdapter {
    client: Client,
}

impl CalDavAdapter {
    pub fn new() -> ProviderResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("calsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn connect(&self, source: &CalendarSource, timeout: Duration) -> ProviderResult<CalDavClient> {
        let config = CalDavConfig::from_source(source)?;
        debug!(source_id = %source.id, config = ?config, "Connecting to CalDAV server");
        Ok(CalDavClient::new(self.client.clone(), config, timeout))
    }

    /// Lists the calendars passing the source's filter.
    ///
    /// A URL that is itself a calendar collection yields no children; it is
    /// then used directly.
    async fn discover(&self, dav: &mut CalDavClient) -> ProviderResult<Vec<DiscoveredCalendar>> {
        let base = dav.config().url.clone();
        let reply = dav
            .propfind(base.as_str(), &propfind_calendars_body()?, 1)
            .await?;
        let discovered = parse_propfind_response(&reply)?;

        if discovered.is_empty() {
            debug!(url = %base, "No child calendars, using URL as the calendar");
            return Ok(vec![DiscoveredCalendar {
                href: base.to_string(),
                display_name: None,
                ctag: None,
            }]);
        }

        let total = discovered.len();
        let calendars: Vec<_> = discovered
            .into_iter()
            .filter(|c| dav.config().matches_filter(c.display_name.as_deref(), &c.href))
            .map(|c| DiscoveredCalendar {
                href: resolve_href(&base, &c.href),
                ..c
            })
            .collect();

        if calendars.is_empty() {
            return Err(ProviderError::calendar(format!(
                "No calendar matches filter {:?} ({} discovered)",
                dav.config().calendar_filter,
                total
            )));
        }

        info!(count = calendars.len(), discovered = total, "Discovered calendars");
        Ok(calendars)
    }

    async fn fetch_calendar(
        dav: &mut CalDavClient,
        calendar: &DiscoveredCalendar,
        window: &TimeWindow,
    ) -> ProviderResult<Vec<RawEvent>> {
        debug!(
            calendar = %calendar.href,
            start = %window.start,
            end = %window.end,
            "Fetching events with REPORT"
        );
        let body = calendar_query_body(window.start, window.end)?;
        let reply = dav.report(&calendar.href, &body).await?;
        let base = url::Url::parse(&calendar.href).ok();

        let mut events = Vec::new();
        for object in parse_report_response(&reply)? {
            let href = match base {
                Some(ref base) => resolve_href(base, &object.href),
                None => object.href.clone(),
            };
            for mut event in parse_events(&object.data) {
                event.href = Some(href.clone());
                event.etag = object.etag.clone();
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn fetch(&self, source: &CalendarSource, options: &FetchOptions) -> ProviderResult<FetchResult> {
        let mut dav = self.connect(source, REQUEST_TIMEOUT)?;
        let calendars = self.discover(&mut dav).await?;

        let mut result = FetchResult::default();
        let mut succeeded = 0usize;
        for calendar in &calendars {
            match Self::fetch_calendar(&mut dav, calendar, &options.window).await {
                Ok(events) => {
                    info!(calendar = %calendar.href, count = events.len(), "Fetched calendar");
                    succeeded += 1;
                    result.events.extend(events);
                    if let Some(ref ctag) = calendar.ctag {
                        result
                            .change_tokens
                            .insert(format!("{}{}", CTAG_TOKEN_PREFIX, calendar.href), ctag.clone());
                    }
                }
                Err(e) if e.is_auth_failure() => return Err(e),
                Err(e) => {
                    warn!(calendar = %calendar.href, error = %e, "Skipping calendar");
                    result.skipped.push(calendar.href.clone());
                }
            }
        }

        if succeeded == 0 {
            return Err(ProviderError::calendar(format!(
                "All {} calendars failed",
                calendars.len()
            )));
        }
        Ok(result)
    }

    async fn probe(&self, source: &CalendarSource) -> bool {
        let mut dav = match self.connect(source, VALIDATE_TIMEOUT) {
            Ok(dav) => dav,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Invalid CalDAV configuration");
                return false;
            }
        };
        let body = match propfind_calendars_body() {
            Ok(body) => body,
            Err(_) => return false,
        };
        let url = dav.config().url.to_string();
        match dav.propfind(&url, &body, 0).await {
            Ok(reply) => has_any_response(&reply),
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "CalDAV probe failed");
                false
            }
        }
    }

    /// The object URL: the stored href, or `<first calendar>/<uid>.ics`.
    async fn write_target(&self, dav: &mut CalDavClient, event: &RemoteEvent) -> ProviderResult<String> {
        if let Some(ref href) = event.href {
            return Ok(resolve_href(&dav.config().url, href));
        }
        let calendars = self.discover(dav).await?;
        let calendar = calendars
            .first()
            .ok_or_else(|| ProviderError::calendar("No writable calendar"))?;
        let mut url = calendar.href.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(&urlencoding::encode(&event.uid));
        url.push_str(".ics");
        Ok(url)
    }

    async fn put(
        &self,
        source: &CalendarSource,
        event: &RemoteEvent,
        content: &calsync_core::EventContent,
        precondition: (&'static str, String),
        on_conflict: impl FnOnce() -> ProviderResult<ConflictDetails>,
    ) -> ProviderResult<WriteOutcome> {
        let mut dav = self.connect(source, REQUEST_TIMEOUT)?;
        let url = self.write_target(&mut dav, event).await?;
        let ics = serialize_event(&event.uid, content, Utc::now());

        let reply = dav.put(&url, &ics, vec![precondition]).await?;
        let reply = check_reply(reply, &url, on_conflict)?;
        info!(source_id = %source.id, href = %url, status = reply.status, "Wrote event");
        Ok(WriteOutcome {
            href: Some(url),
            etag: reply.etag,
            dry_run: false,
        })
    }

    async fn create(
        &self,
        source: &CalendarSource,
        flags: WriteFlags,
        event: &RemoteEvent,
    ) -> ProviderResult<WriteOutcome> {
        flags.check(source)?;
        if flags.dry_run {
            info!(source_id = %source.id, uid = %event.uid, "Dry run: skipping create");
            return Ok(WriteOutcome::dry_run());
        }
        self.put(source, event, &event.content, ("If-None-Match", "*".to_string()), || {
            conflict_details(event, &event.content, format!("event {} already exists on the server", event.uid))
        })
        .await
    }

    async fn update(
        &self,
        source: &CalendarSource,
        flags: WriteFlags,
        before: &RemoteEvent,
        changes: &EventChanges,
    ) -> ProviderResult<WriteOutcome> {
        flags.check(source)?;
        if flags.dry_run {
            info!(source_id = %source.id, uid = %before.uid, "Dry run: skipping update");
            return Ok(WriteOutcome::dry_run());
        }
        let updated = changes.apply(&before.content);
        let precondition = match before.etag {
            Some(ref etag) => ("If-Match", etag.clone()),
            None => ("If-Match", "*".to_string()),
        };
        self.put(source, before, &updated, precondition, || {
            conflict_details(
                before,
                changes,
                format!("event {} changed on the server since it was last read", before.uid),
            )
        })
        .await
    }

    async fn delete(
        &self,
        source: &CalendarSource,
        flags: WriteFlags,
        event: &RemoteEvent,
    ) -> ProviderResult<WriteOutcome> {
        flags.check(source)?;
        if flags.dry_run {
            info!(source_id = %source.id, uid = %event.uid, "Dry run: skipping delete");
            return Ok(WriteOutcome::dry_run());
        }
        let mut dav = self.connect(source, REQUEST_TIMEOUT)?;
        let url = self.write_target(&mut dav, event).await?;
        let headers = event
            .etag
            .iter()
            .map(|etag| ("If-Match", etag.clone()))
            .collect();

        let reply = dav.delete(&url, headers).await?;
        if matches!(reply.status, 404 | 410) {
            debug!(href = %url, "Object already gone");
            return Ok(WriteOutcome {
                href: Some(url),
                ..Default::default()
            });
        }
        check_reply(reply, &url, || {
            conflict_details(
                event,
                &serde_json::json!({ "delete": true }),
                format!("event {} changed on the server before it could be deleted", event.uid),
            )
        })?;
        info!(source_id = %source.id, href = %url, "Deleted event");
        Ok(WriteOutcome {
            href: Some(url),
            ..Default::default()
        })
    }
}

impl CalendarAdapter for CalDavAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn fetch_events<'a>(
        &'a self,
        source: &'a CalendarSource,
        options: FetchOptions,
    ) -> BoxFuture<'a, ProviderResult<FetchResult>> {
        Box::pin(async move {
            self.fetch(source, &options)
                .await
                .map_err(|e| e.with_provider(PROVIDER))
        })
    }

    fn validate_source<'a>(&'a self, source: &'a CalendarSource) -> BoxFuture<'a, bool> {
        Box::pin(self.probe(source))
    }
}

impl RemoteWriter for CalDavAdapter {
    fn create_event<'a>(
        &'a self,
        source: &'a CalendarSource,
        flags: WriteFlags,
        event: &'a RemoteEvent,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>> {
        Box::pin(async move {
            self.create(source, flags, event)
                .await
                .map_err(|e| e.with_provider(PROVIDER))
        })
    }

    fn update_event<'a>(
        &'a self,
        source: &'a CalendarSource,
        flags: WriteFlags,
        before: &'a RemoteEvent,
        changes: &'a EventChanges,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>> {
        Box::pin(async move {
            self.update(source, flags, before, changes)
                .await
                .map_err(|e| e.with_provider(PROVIDER))
        })
    }

    fn delete_event<'a>(
        &'a self,
        source: &'a CalendarSource,
        flags: WriteFlags,
        event: &'a RemoteEvent,
    ) -> BoxFuture<'a, ProviderResult<WriteOutcome>> {
        Box::pin(async move {
            self.delete(source, flags, event)
                .await
                .map_err(|e| e.with_provider(PROVIDER))
        })
    }
}

/// 2xx passes, 412 becomes a conflict, anything else maps by status.
fn check_reply(
    reply: DavReply,
    url: &str,
    on_conflict: impl FnOnce() -> ProviderResult<ConflictDetails>,
) -> ProviderResult<DavReply> {
    if reply.status == 412 {
        warn!(href = %url, "Precondition failed");
        return Err(ProviderError::conflict(on_conflict()?).with_status(412));
    }
    reply.into_success(url)
}

fn conflict_details<A: Serialize>(
    before: &RemoteEvent,
    attempted: &A,
    summary: String,
) -> ProviderResult<ConflictDetails> {
    let to_json = |value: serde_json::Result<serde_json::Value>| {
        value.map_err(|e| ProviderError::internal(format!("Failed to encode conflict: {}", e)))
    };
    Ok(ConflictDetails {
        before: to_json(serde_json::to_value(before))?,
        attempted: to_json(serde_json::to_value(attempted))?,
        summary,
    })
}

/// Resolves an href against the URL it was returned for.
fn resolve_href(base: &url::Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{ConnectionParams, EventContent, SourceType, WritePolicy};
    use chrono::TimeZone;

    fn source(policy: WritePolicy) -> CalendarSource {
        CalendarSource::new(
            SourceType::CalDav,
            "Work",
            // Nothing listens here; any network call would fail the test.
            ConnectionParams::new("http://127.0.0.1:9/dav/").with_credentials("alice", "secret-pw"),
        )
        .with_write_policy(policy)
    }

    fn remote_event() -> RemoteEvent {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap();
        RemoteEvent {
            uid: "evt-1".into(),
            content: EventContent::new("Review", start, start + chrono::Duration::hours(1)),
            href: None,
            etag: Some("\"v1\"".into()),
        }
    }

    #[test]
    fn resolves_relative_hrefs() {
        let base = url::Url::parse("https://dav.example.com/calendars/alice/").unwrap();
        assert_eq!(
            resolve_href(&base, "work/"),
            "https://dav.example.com/calendars/alice/work/"
        );
        assert_eq!(
            resolve_href(&base, "/calendars/bob/home/"),
            "https://dav.example.com/calendars/bob/home/"
        );
        assert_eq!(
            resolve_href(&base, "https://other.example.com/cal/"),
            "https://other.example.com/cal/"
        );
    }

    #[tokio::test]
    async fn read_only_source_rejected_before_io() {
        let adapter = CalDavAdapter::new().unwrap();
        let flags = WriteFlags {
            write_enabled: true,
            dry_run: false,
        };
        let err = adapter
            .create_event(&source(WritePolicy::None), flags, &remote_event())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::ProviderErrorCode::WriteNotAllowed);
        assert_eq!(err.provider(), Some("caldav"));
    }

    #[tokio::test]
    async fn dry_run_skips_network() {
        let adapter = CalDavAdapter::new().unwrap();
        let flags = WriteFlags {
            write_enabled: true,
            dry_run: true,
        };
        let source = source(WritePolicy::Write);
        let event = remote_event();

        let outcome = adapter.create_event(&source, flags, &event).await.unwrap();
        assert!(outcome.dry_run);
        let outcome = adapter
            .update_event(&source, flags, &event, &EventChanges::default())
            .await
            .unwrap();
        assert!(outcome.dry_run);
        let outcome = adapter.delete_event(&source, flags, &event).await.unwrap();
        assert!(outcome.dry_run);
    }

    #[test]
    fn conflict_on_412() {
        let reply = DavReply {
            status: 412,
            etag: None,
            body: String::new(),
        };
        let event = remote_event();
        let changes = EventChanges {
            title: Some("Renamed".into()),
            ..Default::default()
        };
        let err = check_reply(reply, "https://dav.example.com/a.ics", || {
            conflict_details(&event, &changes, "changed".into())
        })
        .unwrap_err();

        let details = err.conflict_details().unwrap();
        assert_eq!(details.before["uid"], "evt-1");
        assert_eq!(details.attempted["title"], "Renamed");
        assert_eq!(err.status(), Some(412));
    }
}
