//! Error types for source adapters and outbound writes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// High-level classification of a provider error.
///
/// The retry executor and the sync service branch on this code rather than
/// on message text whenever a code is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorCode {
    /// Credentials missing, invalid or expired (401).
    AuthenticationFailed,
    /// Authenticated but not permitted (403).
    AuthorizationFailed,
    /// Connection failure, timeout, DNS.
    NetworkError,
    /// 429.
    RateLimited,
    /// 5xx.
    ServerError,
    /// Unparseable body or unexpected status.
    InvalidResponse,
    /// 404.
    NotFound,
    /// 400 / 422.
    BadRequest,
    /// Missing or invalid configuration.
    ConfigurationError,
    /// No usable calendar behind the source.
    CalendarError,
    /// Unexpected internal state.
    InternalError,
    /// Input rejected before any I/O.
    Validation,
    /// Writes disabled globally or by the source's policy.
    WriteNotAllowed,
    /// The source's write bucket is empty.
    QuotaExceeded,
    /// The remote object changed since it was last read (409 / 412).
    Conflict,
}

impl ProviderErrorCode {
    /// Returns true if the failure is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::RateLimited | Self::ServerError
        )
    }

    /// Returns true if retrying can never help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Validation
                | Self::AuthenticationFailed
                | Self::AuthorizationFailed
                | Self::NotFound
                | Self::Conflict
                | Self::WriteNotAllowed
                | Self::QuotaExceeded
                | Self::BadRequest
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::AuthorizationFailed => "authorization_failed",
            Self::NetworkError => "network_error",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::InvalidResponse => "invalid_response",
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::ConfigurationError => "configuration_error",
            Self::CalendarError => "calendar_error",
            Self::InternalError => "internal_error",
            Self::Validation => "validation",
            Self::WriteNotAllowed => "write_not_allowed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller needs to resolve an optimistic-concurrency conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetails {
    /// The event as last known locally (pre-image).
    pub before: serde_json::Value,
    /// The changes that were being written.
    pub attempted: serde_json::Value,
    /// Human-readable description.
    pub summary: String,
}

/// An error raised while talking to a calendar source.
#[derive(Debug, Error)]
pub struct ProviderError {
    code: ProviderErrorCode,
    message: String,
    /// Adapter name (`ics`, `caldav`).
    provider: Option<String>,
    /// HTTP status that caused the error, if any.
    status: Option<u16>,
    conflict: Option<Box<ConflictDetails>>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider: None,
            status: None,
            conflict: None,
            source: None,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::AuthenticationFailed, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::AuthorizationFailed, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NetworkError, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::RateLimited, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ServerError, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InvalidResponse, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::BadRequest, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ConfigurationError, message)
    }

    pub fn calendar(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::CalendarError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InternalError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::Validation, message)
    }

    pub fn write_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::WriteNotAllowed, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::QuotaExceeded, message)
    }

    /// A conflict carrying the data needed to resolve it.
    pub fn conflict(details: ConflictDetails) -> Self {
        let mut err = Self::new(ProviderErrorCode::Conflict, details.summary.clone());
        err.conflict = Some(Box::new(details));
        err
    }

    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status: u16, context: impl fmt::Display) -> Self {
        let message = format!("HTTP {} {}", status, context);
        let err = match status {
            400 | 422 => Self::bad_request(message),
            401 => Self::authentication(message),
            403 => Self::authorization(message),
            404 | 410 => Self::not_found(message),
            409 | 412 => Self::new(ProviderErrorCode::Conflict, message),
            429 => Self::rate_limited(message),
            s if s >= 500 => Self::server(message),
            _ => Self::invalid_response(message),
        };
        err.with_status(status)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_conflict(mut self, details: ConflictDetails) -> Self {
        self.conflict = Some(Box::new(details));
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> ProviderErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn conflict_details(&self) -> Option<&ConflictDetails> {
        self.conflict.as_deref()
    }

    /// Takes the conflict details out of the error.
    pub fn into_conflict_details(self) -> Option<ConflictDetails> {
        self.conflict.map(|details| *details)
    }

    /// Splits off the conflict details, handing the error back if it has none.
    pub fn try_into_conflict(mut self) -> Result<Box<ConflictDetails>, Self> {
        match self.conflict.take() {
            Some(details) => Ok(details),
            None => Err(self),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Returns true for credential failures that need user action.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.code,
            ProviderErrorCode::AuthenticationFailed | ProviderErrorCode::AuthorizationFailed
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref provider) = self.provider {
            write!(f, "[{}] ", provider)?;
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A specialized Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;
