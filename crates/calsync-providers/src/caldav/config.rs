//! Per-source CalDAV connection settings.

use std::fmt;

use url::Url;

use calsync_core::{CalendarSource, mask_secret, secret};

use crate::error::{ProviderError, ProviderResult};

/// Connection settings resolved from a [`CalendarSource`].
#[derive(Clone)]
pub struct CalDavConfig {
    /// Principal or calendar collection URL.
    pub url: Url,
    pub username: Option<String>,
    /// Resolved password (secret references already expanded).
    pub password: Option<String>,
    /// Case-insensitive substring matched against name or href.
    pub calendar_filter: Option<String>,
}

impl CalDavConfig {
    pub fn new(url: impl AsRef<str>) -> ProviderResult<Self> {
        let url = Url::parse(url.as_ref()).map_err(|e| {
            ProviderError::configuration(format!("Invalid CalDAV URL: {}", e)).with_source(e)
        })?;
        Ok(Self {
            url,
            username: None,
            password: None,
            calendar_filter: None,
        })
    }

    /// Builds the settings of a source, resolving `env::` password references.
    pub fn from_source(source: &CalendarSource) -> ProviderResult<Self> {
        let params = &source.connection;
        let mut config = Self::new(&params.url)?;
        config.username = params.username.clone();
        config.password = params
            .password
            .as_deref()
            .map(secret::resolve)
            .transpose()
            .map_err(ProviderError::configuration)?;
        config.calendar_filter = params
            .calendar_filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);
        Ok(config)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_calendar_filter(mut self, filter: impl Into<String>) -> Self {
        self.calendar_filter = Some(filter.into());
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns true if a calendar passes the name filter.
    pub fn matches_filter(&self, display_name: Option<&str>, href: &str) -> bool {
        let Some(ref filter) = self.calendar_filter else {
            return true;
        };
        let filter = filter.to_lowercase();
        display_name.is_some_and(|n| n.to_lowercase().contains(&filter))
            || href.to_lowercase().contains(&filter)
    }
}

impl fmt::Debug for CalDavConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalDavConfig")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(mask_secret))
            .field("calendar_filter", &self.calendar_filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{ConnectionParams, SourceType};

    #[test]
    fn from_source_copies_connection() {
        let source = CalendarSource::new(
            SourceType::CalDav,
            "Work",
            ConnectionParams::new("https://dav.example.com/calendars/alice/")
                .with_credentials("alice", "hunter2secret")
                .with_calendar_filter("  Work "),
        );
        let config = CalDavConfig::from_source(&source).unwrap();
        assert!(config.has_credentials());
        assert_eq!(config.calendar_filter.as_deref(), Some("Work"));
        assert_eq!(config.url.path(), "/calendars/alice/");
    }

    #[test]
    fn debug_masks_password() {
        let config = CalDavConfig::new("https://dav.example.com/")
            .unwrap()
            .with_credentials("alice", "hunter2secret");
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2secret"));
        assert!(printed.contains("hu*********et"));
    }

    #[test]
    fn filter_matches_name_or_href() {
        let config = CalDavConfig::new("https://dav.example.com/")
            .unwrap()
            .with_calendar_filter("work");
        assert!(config.matches_filter(Some("Work Calendar"), "/cal/a/"));
        assert!(config.matches_filter(None, "/cal/WORK/"));
        assert!(!config.matches_filter(Some("Personal"), "/cal/home/"));

        let open = CalDavConfig::new("https://dav.example.com/").unwrap();
        assert!(open.matches_filter(None, "/anything/"));
    }

    #[test]
    fn invalid_url() {
        let err = CalDavConfig::new("not a url").unwrap_err();
        assert_eq!(err.code(), crate::ProviderErrorCode::ConfigurationError);
    }

    #[test]
    fn missing_env_secret_is_configuration_error() {
        let source = CalendarSource::new(
            SourceType::CalDav,
            "Work",
            ConnectionParams::new("https://dav.example.com/")
                .with_credentials("alice", "env::CALSYNC_TEST_UNSET_PASSWORD_VAR"),
        );
        assert!(CalDavConfig::from_source(&source).is_err());
    }
}
