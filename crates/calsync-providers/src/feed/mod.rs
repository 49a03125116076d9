//! Read-only ICS/webcal feed adapter.
//!
//! A feed is fetched with a single conditional GET. Events missing a UID,
//! title, start or end are dropped; the rest of the document still syncs.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info, warn};

use calsync_core::CalendarSource;

use crate::error::{ProviderError, ProviderResult};
use crate::ical::parse_events;
use crate::provider::{BoxFuture, CalendarAdapter, FetchOptions, FetchResult};

/// Change-token key for the feed's ETag.
pub const ETAG_TOKEN: &str = "etag";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

const CALENDAR_CONTENT_TYPES: &[&str] = &["text/calendar", "text/plain", "application/octet-stream"];

/// Adapter for `ics` sources.
#[derive(Debug, Clone)]
pub struct IcsFeedAdapter {
    client: Client,
}

impl IcsFeedAdapter {
    /// Creates an adapter with its own HTTP client.
    pub fn new() -> ProviderResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("calsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    /// Creates an adapter sharing an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request(&self, method: reqwest::Method, source: &CalendarSource) -> RequestBuilder {
        let request = self.client.request(method, feed_url(&source.connection.url));
        match (&source.connection.username, &source.connection.password) {
            (Some(user), Some(password)) => request.basic_auth(user, Some(password)),
            _ => request,
        }
    }

    async fn fetch(&self, source: &CalendarSource, options: &FetchOptions) -> ProviderResult<FetchResult> {
        let mut request = self
            .request(reqwest::Method::GET, source)
            .timeout(FETCH_TIMEOUT);
        if let Some(ref etag) = options.if_none_match {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| {
            ProviderError::network(format!("Feed request failed: {}", e)).with_source(e)
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(source_id = %source.id, "Feed not modified");
            return Ok(FetchResult::not_modified());
        }
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), "fetching feed"));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read feed body: {}", e)))?;

        let (events, dropped): (Vec<_>, Vec<_>) =
            parse_events(&body).into_iter().partition(|e| e.is_complete());
        for event in &dropped {
            debug!(
                source_id = %source.id,
                uid = ?event.uid,
                summary = ?event.summary,
                "Dropping incomplete feed event"
            );
        }

        info!(
            source_id = %source.id,
            count = events.len(),
            dropped = dropped.len(),
            "Fetched feed"
        );

        let mut result = FetchResult::with_events(events);
        if let Some(etag) = etag {
            result = result.with_change_token(ETAG_TOKEN, etag);
        }
        Ok(result)
    }

    /// HEAD first, GET when the server rejects HEAD.
    async fn probe(&self, source: &CalendarSource) -> bool {
        let head = self
            .request(reqwest::Method::HEAD, source)
            .timeout(VALIDATE_TIMEOUT)
            .send()
            .await;
        if let Ok(response) = head {
            if response.status().is_success() && has_calendar_content_type(&response) {
                return true;
            }
        }

        let response = match self
            .request(reqwest::Method::GET, source)
            .timeout(VALIDATE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Feed unreachable");
                return false;
            }
        };
        if !response.status().is_success() {
            warn!(source_id = %source.id, status = %response.status(), "Feed probe failed");
            return false;
        }
        if has_calendar_content_type(&response) {
            return true;
        }
        response
            .text()
            .await
            .map(|body| body.trim_start().starts_with("BEGIN:VCALENDAR"))
            .unwrap_or(false)
    }
}

impl CalendarAdapter for IcsFeedAdapter {
    fn name(&self) -> &str {
        "ics"
    }

    fn fetch_events<'a>(
        &'a self,
        source: &'a CalendarSource,
        options: FetchOptions,
    ) -> BoxFuture<'a, ProviderResult<FetchResult>> {
        Box::pin(async move {
            self.fetch(source, &options)
                .await
                .map_err(|e| e.with_provider("ics"))
        })
    }

    fn validate_source<'a>(&'a self, source: &'a CalendarSource) -> BoxFuture<'a, bool> {
        Box::pin(self.probe(source))
    }
}

fn has_calendar_content_type(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_calendar_content_type)
}

fn is_calendar_content_type(value: &str) -> bool {
    let mime = value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase();
    CALENDAR_CONTENT_TYPES.contains(&mime.as_str())
}

/// Rewrites `webcal://` to `https://`.
pub fn feed_url(url: &str) -> String {
    match url.get(..9) {
        Some(scheme) if scheme.eq_ignore_ascii_case("webcal://") => format!("https://{}", &url[9..]),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webcal_becomes_https() {
        assert_eq!(feed_url("webcal://example.com/a.ics"), "https://example.com/a.ics");
        assert_eq!(feed_url("WEBCAL://example.com/a.ics"), "https://example.com/a.ics");
        assert_eq!(feed_url("https://example.com/a.ics"), "https://example.com/a.ics");
        assert_eq!(feed_url("http"), "http");
    }

    #[test]
    fn content_types() {
        assert!(is_calendar_content_type("text/calendar; charset=utf-8"));
        assert!(is_calendar_content_type("Text/Plain"));
        assert!(is_calendar_content_type("application/octet-stream"));
        assert!(!is_calendar_content_type("text/html"));
    }

    #[test]
    fn adapter_name() {
        let adapter = IcsFeedAdapter::new().unwrap();
        assert_eq!(adapter.name(), "ics");
    }
}
