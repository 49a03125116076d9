//! Calendar source adapters and the write-path guards around them.
//!
//! - [`CalendarAdapter`]: the read trait every source type implements
//! - [`RemoteWriter`]: conditional writes, CalDAV only
//! - [`ical`]: the line-scanning iCalendar codec shared by both adapters
//! - [`QuotaManager`] and [`RetryExecutor`]: per-source write throttling and backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │  ICS / webcal   │    │  CalDAV Server  │
//! └────────┬────────┘    └────────┬────────┘
//!          │ GET                  │ PROPFIND / REPORT / PUT / DELETE
//!          ▼                      ▼
//! ┌─────────────────┐    ┌─────────────────┐
//! │ IcsFeedAdapter  │    │  CalDavAdapter  │
//! └────────┬────────┘    └────────┬────────┘
//!          │   CalendarAdapter    │
//!          └──────────┬───────────┘
//!                     ▼
//!              ┌─────────────┐
//!              │  RawEvent   │
//!              └─────────────┘
//! ```

pub mod caldav;
pub mod error;
pub mod feed;
pub mod ical;
pub mod provider;
pub mod quota;
pub mod raw_event;
pub mod retry;

pub use caldav::CalDavAdapter;
pub use error::{ConflictDetails, ProviderError, ProviderErrorCode, ProviderResult};
pub use feed::IcsFeedAdapter;
pub use provider::{
    Adapters, BoxFuture, CalendarAdapter, FetchOptions, FetchResult, RemoteEvent, RemoteWriter,
    WriteFlags, WriteOutcome,
};
pub use quota::{QuotaConfig, QuotaManager};
pub use raw_event::{RawEvent, RawEventTime};
pub use retry::{RetryExecutor, RetryPolicy, is_terminal};

use std::sync::Arc;

impl Adapters {
    /// The production adapters, sharing one HTTP connection pool.
    pub fn http() -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("calsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {}", e)))?;
        let caldav = Arc::new(CalDavAdapter::with_client(client.clone()));
        Ok(Self {
            ics: Arc::new(IcsFeedAdapter::with_client(client)),
            caldav: caldav.clone(),
            caldav_writer: caldav,
        })
    }
}
