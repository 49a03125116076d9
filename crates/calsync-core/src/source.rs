//! Calendar source catalog types.
//!
//! A [`CalendarSource`] is a configured origin of events. Its identifier is
//! derived from the connection parameters so bootstrapping the same
//! configuration twice resolves to the same source.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::secret::mask_secret;

/// The kind of remote a source talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A read-only ICS/webcal feed.
    Ics,
    /// A CalDAV account.
    #[serde(rename = "caldav")]
    CalDav,
}

impl SourceType {
    /// Returns the wire/storage name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ics => "ics",
            Self::CalDav => "caldav",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ics" => Ok(Self::Ics),
            "caldav" => Ok(Self::CalDav),
            other => Err(format!("unknown source type: {}", other)),
        }
    }
}

/// Whether outbound writes are permitted for a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Read-only.
    #[default]
    None,
    /// Writes allowed (still subject to the global write switch).
    Write,
}

impl WritePolicy {
    /// Returns the storage name of this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Write => "write",
        }
    }
}

impl FromStr for WritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "write" => Ok(Self::Write),
            other => Err(format!("unknown write policy: {}", other)),
        }
    }
}

/// Connection parameters for a source.
///
/// The password is masked in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Feed URL or CalDAV server/principal URL.
    pub url: String,
    /// Username for authenticated sources.
    pub username: Option<String>,
    /// Password for authenticated sources.
    pub password: Option<String>,
    /// Case-insensitive calendar name filter (CalDAV only).
    pub calendar_filter: Option<String>,
}

impl ConnectionParams {
    /// Creates parameters for an unauthenticated URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Builder method to set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Builder method to set the calendar filter.
    pub fn with_calendar_filter(mut self, filter: impl Into<String>) -> Self {
        self.calendar_filter = Some(filter.into());
        self
    }

    /// Returns the password masked for logging.
    pub fn masked_password(&self) -> Option<String> {
        self.password.as_deref().map(mask_secret)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.masked_password())
            .field("calendar_filter", &self.calendar_filter)
            .finish()
    }
}

/// Per-source sync bookkeeping, updated after every attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Last successful sync.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last failed attempt.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Failures since the last success.
    pub consecutive_errors: u32,
    /// Set when the remote rejected the credentials; cleared on credential update.
    pub needs_reauth: bool,
    /// Opaque change tokens (ETag, CTag, sync-token) keyed by scope.
    #[serde(default)]
    pub change_tokens: BTreeMap<String, String>,
}

/// A configured origin of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSource {
    /// Deterministic identifier, see [`CalendarSource::derive_id`].
    pub id: String,
    /// Source kind.
    pub source_type: SourceType,
    /// Human-readable name.
    pub name: String,
    /// Display color (e.g. `#3b82f6`).
    pub color: Option<String>,
    /// How to reach the remote.
    pub connection: ConnectionParams,
    /// Whether writes are permitted.
    pub write_policy: WritePolicy,
    /// Disabled sources are kept but never synced.
    pub enabled: bool,
    /// Sync bookkeeping.
    pub metadata: SyncMetadata,
}

impl CalendarSource {
    /// Creates a source with an identifier derived from its connection.
    pub fn new(source_type: SourceType, name: impl Into<String>, connection: ConnectionParams) -> Self {
        let id = Self::derive_id(source_type, &connection);
        Self {
            id,
            source_type,
            name: name.into(),
            color: None,
            connection,
            write_policy: WritePolicy::None,
            enabled: true,
            metadata: SyncMetadata::default(),
        }
    }

    /// Derives the stable identifier for a connection.
    ///
    /// Only the type, URL and username participate, so rotating a password
    /// keeps the same source.
    pub fn derive_id(source_type: SourceType, connection: &ConnectionParams) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_type.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(connection.url.trim().trim_end_matches('/').as_bytes());
        hasher.update(b"\n");
        hasher.update(connection.username.as_deref().unwrap_or("").as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}", source_type.as_str(), &digest[..16])
    }

    /// Builder method to set the color.
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// Builder method to set the write policy.
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Returns true if the source's own policy allows writes.
    pub fn allows_writes(&self) -> bool {
        self.write_policy == WritePolicy::Write
    }
}
