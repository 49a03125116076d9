//! CalDAV source adapter.
//!
//! - PROPFIND discovery with an optional calendar-name filter
//! - REPORT calendar-query per calendar, failures skipped per calendar
//! - HTTP Digest and Basic authentication
//! - conditional PUT/DELETE writes (`If-None-Match: *`, `If-Match`)
//!
//! # Example
//!
//! ```ignore
//! use calsync_providers::caldav::CalDavAdapter;
//! use calsync_providers::{CalendarAdapter, FetchOptions};
//!
//! let adapter = CalDavAdapter::new()?;
//! let result = adapter.fetch_events(&source, FetchOptions::new(window)).await?;
//! ```

mod adapter;
mod auth;
mod client;
mod config;
mod xml;

pub use adapter::{CTAG_TOKEN_PREFIX, CalDavAdapter};
pub use config::CalDavConfig;
