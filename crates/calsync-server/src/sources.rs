//! Source registry on top of the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use calsync_core::secret;
use calsync_core::{
    AuditActor, AuditEntry, AuditOperation, CalendarSource, SyncMetadata, WritePolicy, mask_secret,
};

use crate::error::{ServerError, ServerResult};
use crate::store::Store;

/// Fields an administrator may change on a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub write_policy: Option<WritePolicy>,
    pub enabled: Option<bool>,
    pub username: Option<String>,
    /// Plain text or a secret reference.
    pub password: Option<String>,
}

impl SourceUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn touches_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

/// Manages the persisted set of sources.
#[derive(Debug, Clone)]
pub struct SourceManager {
    store: Arc<Store>,
}

impl SourceManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Upserts configured sources.
    ///
    /// Connection details, name, color and policy come from the
    /// configuration. Sync metadata and the enabled flag of already known
    /// sources are preserved.
    pub fn bootstrap(&self, configured: &[CalendarSource]) -> ServerResult<Vec<CalendarSource>> {
        let mut result = Vec::with_capacity(configured.len());
        for source in configured {
            if let Some(password) = source.connection.password.as_deref()
                && let Err(reason) = secret::resolve(password)
            {
                warn!(
                    source_id = %source.id,
                    password = %mask_secret(password),
                    %reason,
                    "source credential cannot be resolved yet"
                );
            }

            let merged = match self.store.get_source(&source.id)? {
                Some(existing) => CalendarSource {
                    enabled: existing.enabled,
                    metadata: existing.metadata,
                    ..source.clone()
                },
                None => {
                    info!(source_id = %source.id, name = %source.name, kind = %source.source_type, "registering source");
                    source.clone()
                }
            };
            self.store.save_source(&merged)?;
            result.push(merged);
        }
        debug!(count = result.len(), "sources bootstrapped");
        Ok(result)
    }

    pub fn list(&self) -> ServerResult<Vec<CalendarSource>> {
        self.store.list_sources()
    }

    pub fn list_enabled(&self) -> ServerResult<Vec<CalendarSource>> {
        Ok(self.list()?.into_iter().filter(|s| s.enabled).collect())
    }

    pub fn get(&self, id: &str) -> ServerResult<CalendarSource> {
        self.store
            .get_source(id)?
            .ok_or_else(|| ServerError::not_found("source", id))
    }

    /// Registers a new source. Fails if the derived id already exists.
    pub fn create(&self, source: CalendarSource) -> ServerResult<CalendarSource> {
        if source.connection.url.trim().is_empty() {
            return Err(ServerError::validation("source URL must not be empty"));
        }
        if self.store.get_source(&source.id)?.is_some() {
            return Err(ServerError::validation(format!("source {} already exists", source.id)));
        }
        self.store.save_source(&source)?;
        self.store.append_audit(
            &AuditEntry::new(AuditOperation::SourceUpdate, AuditActor::User)
                .for_source(&source.id)
                .with_after(&redacted(&source)),
        )?;
        Ok(source)
    }

    /// Applies an update and records it.
    ///
    /// Touching the credentials clears the re-authentication flag and the
    /// error counter so the next cycle retries the source.
    pub fn update(&self, id: &str, update: &SourceUpdate) -> ServerResult<CalendarSource> {
        if update.is_empty() {
            return Err(ServerError::validation("source update has no changes"));
        }
        let before = self.get(id)?;
        let mut after = before.clone();
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(ServerError::validation("source name must not be empty"));
            }
            after.name = name.clone();
        }
        if let Some(color) = &update.color {
            after.color = Some(color.clone());
        }
        if let Some(policy) = update.write_policy {
            after.write_policy = policy;
        }
        if let Some(enabled) = update.enabled {
            after.enabled = enabled;
        }
        if update.touches_credentials() {
            if let Some(username) = &update.username {
                after.connection.username = Some(username.clone());
            }
            if let Some(password) = &update.password {
                after.connection.password = Some(password.clone());
            }
            after.metadata.needs_reauth = false;
            after.metadata.consecutive_errors = 0;
            info!(source_id = %id, password = ?after.connection.masked_password(), "source credentials updated");
        }

        self.store.save_source(&after)?;
        self.store.append_audit(
            &AuditEntry::new(AuditOperation::SourceUpdate, AuditActor::User)
                .for_source(id)
                .with_before(&redacted(&before))
                .with_after(&redacted(&after)),
        )?;
        Ok(after)
    }

    pub fn disable(&self, id: &str) -> ServerResult<CalendarSource> {
        self.update(
            id,
            &SourceUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
    }

    /// Stores a successful sync: tokens merged, error state cleared.
    pub fn record_success(
        &self,
        source: &CalendarSource,
        tokens: impl IntoIterator<Item = (String, String)>,
    ) -> ServerResult<SyncMetadata> {
        let mut metadata = self.get(&source.id)?.metadata;
        metadata.last_sync_at = Some(self.store.clock().now());
        metadata.last_error = None;
        metadata.consecutive_errors = 0;
        metadata.needs_reauth = false;
        metadata.change_tokens.extend(tokens);
        self.store.save_metadata(&source.id, &metadata)?;
        Ok(metadata)
    }

    /// Stores a failed sync attempt.
    pub fn record_failure(
        &self,
        source: &CalendarSource,
        message: &str,
        needs_reauth: bool,
    ) -> ServerResult<SyncMetadata> {
        let mut metadata = self.get(&source.id)?.metadata;
        metadata.last_error_at = Some(self.store.clock().now());
        metadata.last_error = Some(message.to_string());
        metadata.consecutive_errors = metadata.consecutive_errors.saturating_add(1);
        metadata.needs_reauth |= needs_reauth;
        self.store.save_metadata(&source.id, &metadata)?;
        Ok(metadata)
    }
}

/// Audit snapshots never carry the password.
fn redacted(source: &CalendarSource) -> CalendarSource {
    let mut copy = source.clone();
    copy.connection.password = copy.connection.masked_password();
    copy
}
