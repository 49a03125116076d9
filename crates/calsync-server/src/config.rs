//! Sync engine configuration.
//!
//! All settings live in a single `config.toml`, by default at
//! `~/.config/calsync/config.toml`:
//!
//! ```toml
//! [features]
//! write_enabled = true
//! sync_interval_secs = 900
//!
//! [[ics]]
//! name = "Holidays"
//! url = "webcal://example.com/holidays.ics"
//!
//! [[caldav]]
//! name = "Work"
//! url = "https://dav.example.com/calendars/alice/"
//! username = "alice"
//! password = "env::CALSYNC_WORK_PASSWORD"
//! calendar_filter = "work"
//! write_policy = "write"
//! ```
//!
//! Password values support secret references (`env::VAR_NAME`); they are
//! stored as written and resolved whenever a connection is made.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use calsync_core::{CalendarSource, ConnectionParams, SourceType, WritePolicy};
use calsync_providers::{QuotaConfig, WriteFlags};

use crate::error::{ServerError, ServerResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub features: FeatureFlags,
    pub storage: StorageSettings,
    pub quota: QuotaConfig,
    pub merge: MergeSettings,
    pub sync: WindowSettings,
    /// Read-only feeds.
    pub ics: Vec<IcsFeedSettings>,
    /// CalDAV accounts.
    pub caldav: Vec<CalDavSettings>,
}

/// Global switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Master switch for outbound writes.
    pub write_enabled: bool,
    /// Report writes as successful without contacting servers.
    pub dry_run: bool,
    /// Run the periodic sync; when off `start()` only bootstraps sources.
    pub sync_enabled: bool,
    /// Seconds between sync cycles.
    pub sync_interval_secs: u64,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            write_enabled: false,
            dry_run: false,
            sync_enabled: true,
            sync_interval_secs: 900,
        }
    }
}

impl FeatureFlags {
    pub fn write_flags(&self) -> WriteFlags {
        WriteFlags {
            write_enabled: self.write_enabled,
            dry_run: self.dry_run,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database path; defaults to the data directory.
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Seconds a merged window stays cached.
    pub cache_ttl_secs: u64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// Days added after the padded current week when fetching.
    pub window_extension_days: u32,
}

/// One `[[ics]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcsFeedSettings {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// One `[[caldav]]` entry.
#[derive(Clone, Serialize, Deserialize)]
pub struct CalDavSettings {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Plain text or `env::VAR_NAME`.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub calendar_filter: Option<String>,
    #[serde(default)]
    pub write_policy: WritePolicy,
}

impl std::fmt::Debug for CalDavSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalDavSettings")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(calsync_core::mask_secret))
            .field("calendar_filter", &self.calendar_filter)
            .field("write_policy", &self.write_policy)
            .finish()
    }
}

impl IcsFeedSettings {
    pub fn to_source(&self) -> CalendarSource {
        let mut source = CalendarSource::new(SourceType::Ics, &self.name, ConnectionParams::new(&self.url));
        source.color = self.color.clone();
        source
    }
}

impl CalDavSettings {
    pub fn to_source(&self) -> CalendarSource {
        let connection = ConnectionParams {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            calendar_filter: self.calendar_filter.clone(),
        };
        let mut source = CalendarSource::new(SourceType::CalDav, &self.name, connection)
            .with_write_policy(self.write_policy);
        source.color = self.color.clone();
        source
    }
}

impl SyncConfig {
    /// Loads the default file, or defaults when it does not exist.
    pub fn load() -> ServerResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads a specific file.
    pub fn load_from(path: &Path) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ServerResult<Self> {
        toml::from_str(content).map_err(|e| ServerError::config(format!("failed to parse config: {}", e)))
    }

    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calsync")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calsync")
    }

    /// The configured database path, or `<data dir>/calsync.db`.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("calsync.db"))
    }

    pub fn merge_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.merge.cache_ttl_secs)
    }

    /// All configured sources, feeds first.
    pub fn sources(&self) -> Vec<CalendarSource> {
        self.ics
            .iter()
            .map(IcsFeedSettings::to_source)
            .chain(self.caldav.iter().map(CalDavSettings::to_source))
            .collect()
    }
}
