//! Server error types.

use calsync_providers::{ConflictDetails, ProviderError, ProviderErrorCode};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised by the store, the sync service and the admin API.
#[derive(Debug, Error)]
pub enum ServerError {
    /// SQLite failure.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Adapter failure that is not one of the variants below.
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// Input rejected before any I/O.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Writes disabled globally or by the source's policy.
    #[error("Write not allowed: {message}")]
    WriteNotAllowed { message: String },

    /// The source's write bucket is empty.
    #[error("Write quota exceeded for source {source_id}")]
    QuotaExceeded { source_id: String },

    /// The remote object changed since it was last read.
    #[error("Conflict: {}", .0.summary)]
    Conflict(Box<ConflictDetails>),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    /// JSON encoding of snapshots or connection parameters.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn quota_exceeded(source_id: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            source_id: source_id.into(),
        }
    }
}

impl From<ProviderError> for ServerError {
    fn from(err: ProviderError) -> Self {
        match err.code() {
            ProviderErrorCode::Validation => Self::validation(err.message()),
            ProviderErrorCode::WriteNotAllowed => Self::WriteNotAllowed {
                message: err.message().to_string(),
            },
            ProviderErrorCode::Conflict => match err.try_into_conflict() {
                Ok(details) => Self::Conflict(details),
                Err(err) => Self::Provider(err),
            },
            _ => Self::Provider(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_codes_map_to_variants() {
        let err: ServerError = ProviderError::write_not_allowed("read-only").into();
        assert!(matches!(err, ServerError::WriteNotAllowed { .. }));

        let err: ServerError = ProviderError::conflict(ConflictDetails {
            before: serde_json::json!({}),
            attempted: serde_json::json!({}),
            summary: "changed remotely".into(),
        })
        .into();
        assert_eq!(err.to_string(), "Conflict: changed remotely");

        // a bare 409 without details stays a provider error
        let err: ServerError = ProviderError::from_status(409, "PUT").into();
        assert!(matches!(err, ServerError::Provider(_)));
    }

    #[test]
    fn not_found_display() {
        let err = ServerError::not_found("source", "ics-1234");
        assert_eq!(err.to_string(), "source not found: ics-1234");
    }
}
