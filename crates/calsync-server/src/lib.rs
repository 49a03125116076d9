//! Sync engine: store, source catalog, scheduler, merger, admin API.
//!
//! This crate keeps a local SQLite mirror of every configured calendar
//! source and exposes:
//! - A persistent sync service reconciling remote events into the store
//! - A background scheduler running it on a fixed interval
//! - A merged, cached timeline of local and synced events
//! - An admin API for local events, mirrored to CalDAV when allowed
//! - Recurring todo advancement
//!
//! # Example
//!
//! ```rust,no_run
//! use calsync_server::{Engine, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::load()?;
//!     let engine = Engine::open(&config)?;
//!     engine.scheduler.start()?;
//!     Ok(())
//! }
//! ```

mod admin;
mod cache;
mod config;
mod engine;
mod error;
mod merger;
mod scheduler;
mod sources;
mod store;
mod sync;
mod todo;

pub use admin::AdminService;
pub use cache::MergeCache;
pub use config::{
    CalDavSettings, FeatureFlags, IcsFeedSettings, MergeSettings, StorageSettings, SyncConfig,
    WindowSettings,
};
pub use engine::Engine;
pub use error::{ServerError, ServerResult};
pub use merger::{EventMerger, merge};
pub use scheduler::{SchedulerCommand, SyncScheduler};
pub use sources::{SourceManager, SourceUpdate};
pub use store::{EventKey, IncomingEvent, Store, UpsertOutcome};
pub use sync::{
    RECURRENCE_ID_FORMAT, SourceHealth, StoreSummary, SyncOutcome, SyncReport, SyncService,
    expand_recurring,
};
pub use todo::{TodoAdvance, TodoService};
