//! Core types: sources, events, audit, todos, time, recurrence

pub mod audit;
pub mod clock;
pub mod event;
pub mod recurrence;
pub mod secret;
pub mod source;
pub mod time;
pub mod todo;
pub mod tracing;

pub use crate::audit::{AuditActor, AuditEntry, AuditOperation, CalendarAudit, CalendarTombstone};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::event::{
    CalendarEvent, EventChanges, EventContent, EventOrigin, EventStatus, LocalEvent, MergedEvent,
    synthetic_uid,
};
pub use crate::recurrence::{
    ByDay, Frequency, Rule, expand, first_due_date, next_due_date, parse_rule,
};
pub use crate::secret::mask_secret;
pub use crate::source::{CalendarSource, ConnectionParams, SourceType, SyncMetadata, WritePolicy};
pub use crate::time::{TimeWindow, end_of_day, start_of_day};
pub use crate::todo::{RecurringTodo, TodoState};
pub use crate::tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
