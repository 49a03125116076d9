//! SQLite persistence.
//!
//! One connection behind a mutex. Every multi-statement decision (event
//! upsert, todo advancement) runs in its own transaction.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use calsync_core::{
    AuditEntry, CalendarAudit, CalendarEvent, CalendarSource, CalendarTombstone, Clock,
    ConnectionParams, EventContent, EventStatus, LocalEvent, RecurringTodo, SourceType,
    SyncMetadata, SystemClock, TimeWindow, TodoState,
};

use crate::error::{ServerError, ServerResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS calendar_sources (
    id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    name TEXT NOT NULL,
    color TEXT,
    connection TEXT NOT NULL,
    write_policy TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calendar_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL REFERENCES calendar_sources(id),
    uid TEXT NOT NULL,
    recurrence_id TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL,
    description TEXT,
    location TEXT,
    start_at TEXT NOT NULL,
    end_at TEXT NOT NULL,
    all_day INTEGER NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    etag TEXT,
    href TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_identity
    ON calendar_events(source_id, uid, recurrence_id, start_at, end_at);
CREATE INDEX IF NOT EXISTS idx_events_window ON calendar_events(start_at, end_at);

CREATE TABLE IF NOT EXISTS local_events (
    id TEXT PRIMARY KEY,
    source_id TEXT,
    title TEXT NOT NULL,
    description TEXT,
    location TEXT,
    start_at TEXT NOT NULL,
    end_at TEXT NOT NULL,
    all_day INTEGER NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    etag TEXT,
    href TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calendar_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT,
    source_id TEXT,
    operation TEXT NOT NULL,
    actor TEXT NOT NULL,
    before_json TEXT,
    after_json TEXT,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calendar_tombstones (
    event_id TEXT PRIMARY KEY,
    source_id TEXT,
    uid TEXT NOT NULL,
    last_etag TEXT,
    deleted_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS todos (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    rrule TEXT,
    recurring_group_id TEXT NOT NULL,
    anchor TEXT NOT NULL,
    due TEXT,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_todos_one_open
    ON todos(recurring_group_id) WHERE state = 'open';
";

/// Identity of a synced event: `(source_id, uid, recurrence_id, start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub source_id: String,
    pub uid: String,
    /// Empty when the event is not a recurrence instance.
    pub recurrence_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// An event to reconcile: key plus remote bookkeeping.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub key: EventKey,
    pub content: EventContent,
    pub etag: Option<String>,
    pub href: Option<String>,
}

/// The SQLite store.
pub struct Store {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Opens (and migrates) a database file, creating parent directories.
    pub fn open(path: &Path) -> ServerResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServerError::config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        Self::init(Connection::open(path)?, Arc::new(SystemClock))
    }

    /// An in-memory store for tests.
    pub fn in_memory() -> ServerResult<Self> {
        Self::init(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> ServerResult<Self> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> ServerResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn now(&self) -> String {
        fmt_ts(self.clock.now())
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Inserts a source or replaces every field of an existing one.
    pub fn save_source(&self, source: &CalendarSource) -> ServerResult<()> {
        let now = self.now();
        self.conn().execute(
            "INSERT INTO calendar_sources
                (id, source_type, name, color, connection, write_policy, enabled, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                source_type = excluded.source_type,
                name = excluded.name,
                color = excluded.color,
                connection = excluded.connection,
                write_policy = excluded.write_policy,
                enabled = excluded.enabled,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                source.id,
                source.source_type.as_str(),
                source.name,
                source.color,
                serde_json::to_string(&source.connection)?,
                source.write_policy.as_str(),
                source.enabled,
                serde_json::to_string(&source.metadata)?,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, id: &str) -> ServerResult<Option<CalendarSource>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {} FROM calendar_sources WHERE id = ?1", SOURCE_COLUMNS),
                params![id],
                source_from_row,
            )
            .optional()?)
    }

    pub fn list_sources(&self) -> ServerResult<Vec<CalendarSource>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM calendar_sources ORDER BY source_type, name",
            SOURCE_COLUMNS
        ))?;
        let rows = stmt.query_map([], source_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn save_metadata(&self, id: &str, metadata: &SyncMetadata) -> ServerResult<()> {
        let changed = self.conn().execute(
            "UPDATE calendar_sources SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(metadata)?, self.now()],
        )?;
        if changed == 0 {
            return Err(ServerError::not_found("source", id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Synced events
    // -----------------------------------------------------------------------

    /// Reconciles one event in its own transaction.
    ///
    /// A row with the same key is updated (and its version bumped) only when
    /// its content differs.
    pub fn upsert_event(&self, incoming: &IncomingEvent) -> ServerResult<UpsertOutcome> {
        let now = self.now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let outcome = upsert_in(&tx, incoming, &now)?;
        tx.commit()?;
        Ok(outcome)
    }

    pub fn find_event(&self, key: &EventKey) -> ServerResult<Option<CalendarEvent>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM calendar_events e
                     WHERE source_id = ?1 AND uid = ?2 AND recurrence_id = ?3 AND start_at = ?4 AND end_at = ?5",
                    EVENT_COLUMNS
                ),
                params![key.source_id, key.uid, key.recurrence_id, fmt_ts(key.start), fmt_ts(key.end)],
                event_from_row,
            )
            .optional()?)
    }

    /// Non-cancelled synced events overlapping `window`, with their source type.
    pub fn events_in_window(&self, window: &TimeWindow) -> ServerResult<Vec<(CalendarEvent, SourceType)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, s.source_type FROM calendar_events e
             JOIN calendar_sources s ON s.id = e.source_id
             WHERE e.status != 'cancelled' AND s.enabled = 1
               AND e.start_at < ?2 AND (e.end_at > ?1 OR (e.end_at = e.start_at AND e.start_at >= ?1))
             ORDER BY e.start_at, e.id",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![fmt_ts(window.start), fmt_ts(window.end)], |row| {
            let event = event_from_row(row)?;
            let source_type: String = row.get(EVENT_COLUMN_COUNT)?;
            Ok((event, parse_col(EVENT_COLUMN_COUNT, &source_type)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_events(&self, source_id: &str) -> ServerResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM calendar_events WHERE source_id = ?1",
            params![source_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // -----------------------------------------------------------------------
    // Local events
    // -----------------------------------------------------------------------

    pub fn insert_local_event(&self, event: &LocalEvent) -> ServerResult<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO local_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                LOCAL_COLUMNS
            ),
            params![
                event.id,
                event.source_id,
                event.content.title,
                event.content.description,
                event.content.location,
                fmt_ts(event.content.start),
                fmt_ts(event.content.end),
                event.content.all_day,
                event.content.status.as_str(),
                event.version,
                event.etag,
                event.href,
                fmt_ts(event.created_at),
                fmt_ts(event.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Overwrites the mutable fields of a local event.
    pub fn update_local_event(&self, event: &LocalEvent) -> ServerResult<()> {
        let changed = self.conn().execute(
            "UPDATE local_events SET
                source_id = ?2, title = ?3, description = ?4, location = ?5, start_at = ?6,
                end_at = ?7, all_day = ?8, status = ?9, version = ?10, etag = ?11, href = ?12,
                updated_at = ?13
             WHERE id = ?1",
            params![
                event.id,
                event.source_id,
                event.content.title,
                event.content.description,
                event.content.location,
                fmt_ts(event.content.start),
                fmt_ts(event.content.end),
                event.content.all_day,
                event.content.status.as_str(),
                event.version,
                event.etag,
                event.href,
                fmt_ts(event.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(ServerError::not_found("local event", &event.id));
        }
        Ok(())
    }

    pub fn get_local_event(&self, id: &str) -> ServerResult<Option<LocalEvent>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {} FROM local_events WHERE id = ?1", LOCAL_COLUMNS),
                params![id],
                local_from_row,
            )
            .optional()?)
    }

    /// Non-cancelled local events overlapping `window`.
    pub fn local_events_in_window(&self, window: &TimeWindow) -> ServerResult<Vec<LocalEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM local_events
             WHERE status != 'cancelled'
               AND start_at < ?2 AND (end_at > ?1 OR (end_at = start_at AND start_at >= ?1))
             ORDER BY start_at, id",
            LOCAL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![fmt_ts(window.start), fmt_ts(window.end)], local_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Audit and tombstones
    // -----------------------------------------------------------------------

    /// Appends an audit entry. Entries are never updated or deleted.
    pub fn append_audit(&self, entry: &AuditEntry) -> ServerResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO calendar_audit (event_id, source_id, operation, actor, before_json, after_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.event_id,
                entry.source_id,
                entry.operation.as_str(),
                entry.actor.as_str(),
                entry.before.as_ref().map(serde_json::to_string).transpose()?,
                entry.after.as_ref().map(serde_json::to_string).transpose()?,
                self.now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent entries first.
    pub fn list_audit(&self, limit: usize) -> ServerResult<Vec<CalendarAudit>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, source_id, operation, actor, before_json, after_json, recorded_at
             FROM calendar_audit ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(CalendarAudit {
                id: row.get(0)?,
                entry: AuditEntry {
                    event_id: row.get(1)?,
                    source_id: row.get(2)?,
                    operation: parse_col(3, &row.get::<_, String>(3)?)?,
                    actor: parse_col(4, &row.get::<_, String>(4)?)?,
                    before: json_col(row, 5)?,
                    after: json_col(row, 6)?,
                },
                recorded_at: ts_col(row, 7)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn insert_tombstone(&self, tombstone: &CalendarTombstone) -> ServerResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO calendar_tombstones (event_id, source_id, uid, last_etag, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tombstone.event_id,
                tombstone.source_id,
                tombstone.uid,
                tombstone.last_etag,
                fmt_ts(tombstone.deleted_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_tombstones(&self) -> ServerResult<Vec<CalendarTombstone>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT event_id, source_id, uid, last_etag, deleted_at FROM calendar_tombstones ORDER BY deleted_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CalendarTombstone {
                event_id: row.get(0)?,
                source_id: row.get(1)?,
                uid: row.get(2)?,
                last_etag: row.get(3)?,
                deleted_at: ts_col(row, 4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Todos
    // -----------------------------------------------------------------------

    pub fn insert_todo(&self, todo: &RecurringTodo) -> ServerResult<()> {
        insert_todo_in(&self.conn(), todo)
    }

    pub fn get_todo(&self, id: &str) -> ServerResult<Option<RecurringTodo>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {} FROM todos WHERE id = ?1", TODO_COLUMNS),
                params![id],
                todo_from_row,
            )
            .optional()?)
    }

    /// Todos of one group, oldest first.
    pub fn todos_in_group(&self, group_id: &str) -> ServerResult<Vec<RecurringTodo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM todos WHERE recurring_group_id = ?1 ORDER BY created_at, due",
            TODO_COLUMNS
        ))?;
        let rows = stmt.query_map(params![group_id], todo_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn open_todos(&self) -> ServerResult<Vec<RecurringTodo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM todos WHERE state = 'open' ORDER BY due IS NULL, due, title",
            TODO_COLUMNS
        ))?;
        let rows = stmt.query_map([], todo_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Closes a todo and, if given, inserts its successor atomically.
    pub fn close_todo(
        &self,
        id: &str,
        state: TodoState,
        successor: Option<&RecurringTodo>,
    ) -> ServerResult<()> {
        let now = self.now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE todos SET state = ?2, updated_at = ?3 WHERE id = ?1 AND state = 'open'",
            params![id, state.as_str(), now],
        )?;
        if changed == 0 {
            return Err(ServerError::not_found("open todo", id));
        }
        if let Some(next) = successor {
            insert_todo_in(&tx, next)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn upsert_in(tx: &Transaction<'_>, incoming: &IncomingEvent, now: &str) -> ServerResult<UpsertOutcome> {
    let key = &incoming.key;
    let start = fmt_ts(key.start);
    let end = fmt_ts(key.end);
    let existing = tx
        .query_row(
            &format!(
                "SELECT {} FROM calendar_events e
                 WHERE source_id = ?1 AND uid = ?2 AND recurrence_id = ?3 AND start_at = ?4 AND end_at = ?5",
                EVENT_COLUMNS
            ),
            params![key.source_id, key.uid, key.recurrence_id, start, end],
            event_from_row,
        )
        .optional()?;

    let content = &incoming.content;
    match existing {
        Some(row) if row.content == *content => {
            if row.etag != incoming.etag || row.href != incoming.href {
                tx.execute(
                    "UPDATE calendar_events SET etag = ?2, href = ?3 WHERE id = ?1",
                    params![row.id, incoming.etag, incoming.href],
                )?;
            }
            Ok(UpsertOutcome::Unchanged)
        }
        Some(row) => {
            tx.execute(
                "UPDATE calendar_events SET
                    title = ?2, description = ?3, location = ?4, all_day = ?5, status = ?6,
                    version = version + 1, etag = ?7, href = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    row.id,
                    content.title,
                    content.description,
                    content.location,
                    content.all_day,
                    content.status.as_str(),
                    incoming.etag,
                    incoming.href,
                    now,
                ],
            )?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            tx.execute(
                "INSERT INTO calendar_events
                    (source_id, uid, recurrence_id, title, description, location, start_at, end_at,
                     all_day, status, version, etag, href, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12, ?13, ?13)",
                params![
                    key.source_id,
                    key.uid,
                    key.recurrence_id,
                    content.title,
                    content.description,
                    content.location,
                    start,
                    end,
                    content.all_day,
                    content.status.as_str(),
                    incoming.etag,
                    incoming.href,
                    now,
                ],
            )?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

fn insert_todo_in(conn: &Connection, todo: &RecurringTodo) -> ServerResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO todos ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            TODO_COLUMNS
        ),
        params![
            todo.id,
            todo.title,
            todo.rrule,
            todo.recurring_group_id,
            todo.anchor.format(DATE_FORMAT).to_string(),
            todo.due.map(|d| d.format(LOCAL_TS_FORMAT).to_string()),
            todo.state.as_str(),
            fmt_ts(todo.created_at),
            fmt_ts(todo.updated_at),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const SOURCE_COLUMNS: &str = "id, source_type, name, color, connection, write_policy, enabled, metadata";

const EVENT_COLUMNS: &str = "e.id, e.source_id, e.uid, e.recurrence_id, e.title, e.description, e.location, \
     e.start_at, e.end_at, e.all_day, e.status, e.version, e.etag, e.href, e.created_at, e.updated_at";
const EVENT_COLUMN_COUNT: usize = 16;

const LOCAL_COLUMNS: &str = "id, source_id, title, description, location, start_at, end_at, all_day, \
     status, version, etag, href, created_at, updated_at";

const TODO_COLUMNS: &str =
    "id, title, rrule, recurring_group_id, anchor, due, state, created_at, updated_at";

const DATE_FORMAT: &str = "%Y-%m-%d";
const LOCAL_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Fixed-width UTC timestamps so text comparison orders chronologically.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_col<T: std::str::FromStr<Err = String>>(idx: usize, text: &str) -> rusqlite::Result<T> {
    text.parse()
        .map_err(|e: String| conversion_error(idx, std::io::Error::other(e)))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn content_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<EventContent> {
    Ok(EventContent {
        title: row.get(first)?,
        description: row.get(first + 1)?,
        location: row.get(first + 2)?,
        start: ts_col(row, first + 3)?,
        end: ts_col(row, first + 4)?,
        all_day: row.get(first + 5)?,
        status: parse_col::<EventStatus>(first + 6, &row.get::<_, String>(first + 6)?)?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarSource> {
    let connection: Option<ConnectionParams> = json_col(row, 4)?;
    let metadata: Option<SyncMetadata> = json_col(row, 7)?;
    Ok(CalendarSource {
        id: row.get(0)?,
        source_type: parse_col(1, &row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        color: row.get(3)?,
        connection: connection.unwrap_or_default(),
        write_policy: parse_col(5, &row.get::<_, String>(5)?)?,
        enabled: row.get(6)?,
        metadata: metadata.unwrap_or_default(),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarEvent> {
    let recurrence_id: String = row.get(3)?;
    Ok(CalendarEvent {
        id: row.get(0)?,
        source_id: row.get(1)?,
        uid: row.get(2)?,
        recurrence_id: (!recurrence_id.is_empty()).then_some(recurrence_id),
        content: content_from_row(row, 4)?,
        version: row.get(11)?,
        etag: row.get(12)?,
        href: row.get(13)?,
        created_at: ts_col(row, 14)?,
        updated_at: ts_col(row, 15)?,
    })
}

fn local_from_row(row: &Row<'_>) -> rusqlite::Result<LocalEvent> {
    Ok(LocalEvent {
        id: row.get(0)?,
        source_id: row.get(1)?,
        content: content_from_row(row, 2)?,
        version: row.get(9)?,
        etag: row.get(10)?,
        href: row.get(11)?,
        created_at: ts_col(row, 12)?,
        updated_at: ts_col(row, 13)?,
    })
}

fn todo_from_row(row: &Row<'_>) -> rusqlite::Result<RecurringTodo> {
    let anchor: String = row.get(4)?;
    let due: Option<String> = row.get(5)?;
    Ok(RecurringTodo {
        id: row.get(0)?,
        title: row.get(1)?,
        rrule: row.get(2)?,
        recurring_group_id: row.get(3)?,
        anchor: NaiveDate::parse_from_str(&anchor, DATE_FORMAT).map_err(|e| conversion_error(4, e))?,
        due: due
            .map(|d| NaiveDateTime::parse_from_str(&d, LOCAL_TS_FORMAT).map_err(|e| conversion_error(5, e)))
            .transpose()?,
        state: parse_col(6, &row.get::<_, String>(6)?)?,
        created_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{AuditActor, AuditOperation, ManualClock};
    use chrono::{Duration, TimeZone};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 5, h, 0, 0).unwrap()
    }

    fn store_with_source() -> (Store, CalendarSource) {
        let store = Store::in_memory().unwrap();
        let source = CalendarSource::new(SourceType::Ics, "Feed", ConnectionParams::new("https://x/a.ics"));
        store.save_source(&source).unwrap();
        (store, source)
    }

    fn incoming(source_id: &str, uid: &str, title: &str) -> IncomingEvent {
        IncomingEvent {
            key: EventKey {
                source_id: source_id.into(),
                uid: uid.into(),
                recurrence_id: String::new(),
                start: at(9),
                end: at(10),
            },
            content: EventContent::new(title, at(9), at(10)),
            etag: None,
            href: None,
        }
    }

    #[test]
    fn source_round_trip() {
        let (store, mut source) = store_with_source();
        source.metadata.consecutive_errors = 2;
        source.metadata.change_tokens.insert("etag".into(), "\"v1\"".into());
        store.save_source(&source).unwrap();

        let loaded = store.get_source(&source.id).unwrap().unwrap();
        assert_eq!(loaded, source);
        assert_eq!(store.list_sources().unwrap().len(), 1);
        assert!(store.get_source("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_inserts_updates_and_skips() {
        let (store, source) = store_with_source();
        let event = incoming(&source.id, "u1", "Standup");

        assert_eq!(store.upsert_event(&event).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_event(&event).unwrap(), UpsertOutcome::Unchanged);

        let mut renamed = event.clone();
        renamed.content.title = "Daily standup".into();
        assert_eq!(store.upsert_event(&renamed).unwrap(), UpsertOutcome::Updated);

        let row = store.find_event(&event.key).unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.content.title, "Daily standup");
        assert_eq!(row.recurrence_id, None);
        assert_eq!(store.count_events(&source.id).unwrap(), 1);
    }

    #[test]
    fn identity_index_rejects_duplicates() {
        let (store, source) = store_with_source();
        store.upsert_event(&incoming(&source.id, "u1", "A")).unwrap();
        let now = fmt_ts(at(0));
        let err = store.conn().execute(
            "INSERT INTO calendar_events
                (source_id, uid, recurrence_id, title, start_at, end_at, all_day, status, version, created_at, updated_at)
             VALUES (?1, 'u1', '', 'B', ?2, ?3, 0, 'confirmed', 1, ?4, ?4)",
            params![source.id, fmt_ts(at(9)), fmt_ts(at(10)), now],
        );
        assert!(err.is_err());
    }

    #[test]
    fn window_query_hides_cancelled() {
        let (store, source) = store_with_source();
        store.upsert_event(&incoming(&source.id, "u1", "Visible")).unwrap();
        let mut cancelled = incoming(&source.id, "u2", "Gone");
        cancelled.content.status = EventStatus::Cancelled;
        store.upsert_event(&cancelled).unwrap();

        let window = TimeWindow::new(at(0), at(23));
        let events = store.events_in_window(&window).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.content.title, "Visible");
        assert_eq!(events[0].1, SourceType::Ics);

        let later = TimeWindow::new(at(10), at(23));
        assert!(store.events_in_window(&later).unwrap().is_empty());
    }

    #[test]
    fn audit_is_append_only_log() {
        let clock = Arc::new(ManualClock::new(at(8)));
        let store = Store::in_memory_with_clock(clock.clone()).unwrap();
        store
            .append_audit(&AuditEntry::new(AuditOperation::Sync, AuditActor::System).for_source("s1"))
            .unwrap();
        clock.advance(Duration::minutes(1));
        let id = store
            .append_audit(
                &AuditEntry::new(AuditOperation::Create, AuditActor::User)
                    .for_event("e1")
                    .with_after(&serde_json::json!({"title": "x"})),
            )
            .unwrap();

        let entries = store.list_audit(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].entry.after.as_ref().unwrap()["title"], "x");
        assert_eq!(entries[1].recorded_at, at(8));
    }

    #[test]
    fn one_open_todo_per_group() {
        let store = Store::in_memory().unwrap();
        let anchor = NaiveDate::from_ymd_opt(2025, 1, 13).unwrap();
        let todo = |id: &str| RecurringTodo {
            id: id.into(),
            title: "Water plants".into(),
            rrule: Some("FREQ=DAILY".into()),
            recurring_group_id: "g1".into(),
            anchor,
            due: anchor.and_hms_milli_opt(23, 59, 59, 999),
            state: TodoState::Open,
            created_at: at(0),
            updated_at: at(0),
        };
        store.insert_todo(&todo("t1")).unwrap();
        assert!(store.insert_todo(&todo("t2")).is_err());

        store.close_todo("t1", TodoState::Completed, Some(&todo("t2"))).unwrap();
        let group = store.todos_in_group("g1").unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(store.open_todos().unwrap()[0].id, "t2");
        assert_eq!(store.get_todo("t2").unwrap().unwrap().due, todo("t2").due);

        // closing twice fails and leaves no partial successor
        assert!(store.close_todo("t1", TodoState::Completed, Some(&todo("t3"))).is_err());
        assert!(store.get_todo("t3").unwrap().is_none());
    }
}
