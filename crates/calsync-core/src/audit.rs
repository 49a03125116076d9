//! Audit trail entries.
//!
//! Audit records are append-only; they exist for post-hoc reconciliation and
//! debugging and never drive control flow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    Sync,
    SourceUpdate,
}

impl AuditOperation {
    /// Returns the storage name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sync => "sync",
            Self::SourceUpdate => "source_update",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "sync" => Ok(Self::Sync),
            "source_update" => Ok(Self::SourceUpdate),
            other => Err(format!("unknown audit operation: {}", other)),
        }
    }
}

/// Who did it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditActor {
    User,
    System,
}

impl AuditActor {
    /// Returns the storage name of this actor.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl FromStr for AuditActor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            other => Err(format!("unknown audit actor: {}", other)),
        }
    }
}

/// A new audit entry, before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Referenced event (local id or synced row id), if any.
    pub event_id: Option<String>,
    /// Referenced source, if any.
    pub source_id: Option<String>,
    pub operation: AuditOperation,
    pub actor: AuditActor,
    /// Snapshot before the change.
    pub before: Option<serde_json::Value>,
    /// Snapshot after the change.
    pub after: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Creates an entry without references or snapshots.
    pub fn new(operation: AuditOperation, actor: AuditActor) -> Self {
        Self {
            event_id: None,
            source_id: None,
            operation,
            actor,
            before: None,
            after: None,
        }
    }

    /// Builder method to reference an event.
    pub fn for_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Builder method to reference a source.
    pub fn for_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Builder method to attach a before snapshot.
    pub fn with_before<T: Serialize>(mut self, before: &T) -> Self {
        self.before = serde_json::to_value(before).ok();
        self
    }

    /// Builder method to attach an after snapshot.
    pub fn with_after<T: Serialize>(mut self, after: &T) -> Self {
        self.after = serde_json::to_value(after).ok();
        self
    }
}

/// A stored audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarAudit {
    pub id: i64,
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub recorded_at: DateTime<Utc>,
}

/// Marks a soft-deleted local event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarTombstone {
    pub event_id: String,
    pub source_id: Option<String>,
    pub uid: String,
    pub last_etag: Option<String>,
    pub deleted_at: DateTime<Utc>,
}
