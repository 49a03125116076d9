//! Admin write API for local events and sources.
//!
//! Every event write runs the same pipeline: policy check, quota check,
//! local persist, audit, then (for CalDAV-backed events) a token is
//! consumed and the remote write goes through the retry executor. A failed
//! remote write leaves the local change in place with status `failed`,
//! except for deletes: those stay `cancelled` and the failure is audited.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use calsync_core::{
    AuditActor, AuditEntry, AuditOperation, CalendarSource, CalendarTombstone, EventChanges,
    EventContent, EventStatus, LocalEvent,
};
use calsync_providers::{
    Adapters, ProviderError, ProviderErrorCode, QuotaManager, RemoteEvent, RemoteWriter,
    RetryExecutor, WriteFlags, WriteOutcome,
};

use crate::error::{ServerError, ServerResult};
use crate::merger::EventMerger;
use crate::sources::{SourceManager, SourceUpdate};
use crate::store::Store;

/// The remote side of one admin write.
enum RemoteOp<'a> {
    Create,
    Update {
        before: &'a EventContent,
        changes: &'a EventChanges,
    },
    Delete,
}

/// Writes local events and mirrors them to CalDAV sources.
#[derive(Debug, Clone)]
pub struct AdminService {
    store: Arc<Store>,
    sources: SourceManager,
    adapters: Adapters,
    quota: Arc<QuotaManager>,
    retry: RetryExecutor,
    flags: WriteFlags,
    merger: Arc<EventMerger>,
}

impl AdminService {
    pub fn new(
        store: Arc<Store>,
        adapters: Adapters,
        quota: Arc<QuotaManager>,
        retry: RetryExecutor,
        flags: WriteFlags,
        merger: Arc<EventMerger>,
    ) -> Self {
        Self {
            sources: SourceManager::new(store.clone()),
            store,
            adapters,
            quota,
            retry,
            flags,
            merger,
        }
    }

    /// Creates a local event, optionally mirrored to `source_id`.
    pub async fn create_event(
        &self,
        source_id: Option<&str>,
        content: EventContent,
    ) -> ServerResult<LocalEvent> {
        validate_content(&content)?;
        let target = source_id.map(|id| self.writable_source(id)).transpose()?;

        let now = self.store.clock().now();
        let mut event = LocalEvent {
            id: Uuid::new_v4().to_string(),
            source_id: target.as_ref().map(|s| s.id.clone()),
            content,
            version: 1,
            etag: None,
            href: None,
            created_at: now,
            updated_at: now,
        };
        if target.is_some() {
            event.content.status = EventStatus::Pending;
        }
        self.store.insert_local_event(&event)?;
        self.store.append_audit(
            &AuditEntry::new(AuditOperation::Create, AuditActor::User)
                .for_event(&event.id)
                .with_after(&event),
        )?;
        info!(event_id = %event.id, source_id = ?event.source_id, "local event created");

        let result = match &target {
            Some(source) => self.push(source, event, RemoteOp::Create).await,
            None => Ok(event),
        };
        self.merger.invalidate();
        result
    }

    /// Applies `changes` to a local event.
    pub async fn update_event(&self, id: &str, changes: &EventChanges) -> ServerResult<LocalEvent> {
        if changes.is_empty() {
            return Err(ServerError::validation("event update has no changes"));
        }
        let before = self.local_event(id)?;
        let target = before
            .source_id
            .as_deref()
            .map(|sid| self.writable_source(sid))
            .transpose()?;

        let mut after = before.clone();
        after.content = changes.apply(&before.content);
        validate_content(&after.content)?;
        after.version += 1;
        after.updated_at = self.store.clock().now();
        if target.is_some() {
            after.content.status = EventStatus::Pending;
        }
        self.store.update_local_event(&after)?;
        self.store.append_audit(
            &AuditEntry::new(AuditOperation::Update, AuditActor::User)
                .for_event(id)
                .with_before(&before)
                .with_after(&after),
        )?;

        let result = match &target {
            Some(source) => {
                let op = RemoteOp::Update {
                    before: &before.content,
                    changes,
                };
                self.push(source, after, op).await
            }
            None => Ok(after),
        };
        self.merger.invalidate();
        result
    }

    /// Soft-deletes a local event: status `cancelled` plus a tombstone.
    pub async fn delete_event(&self, id: &str) -> ServerResult<LocalEvent> {
        let before = self.local_event(id)?;
        if before.content.status == EventStatus::Cancelled {
            return Err(ServerError::validation(format!("event {} is already deleted", id)));
        }
        let target = before
            .source_id
            .as_deref()
            .map(|sid| self.writable_source(sid))
            .transpose()?;

        let now = self.store.clock().now();
        let mut after = before.clone();
        after.content.status = EventStatus::Cancelled;
        after.version += 1;
        after.updated_at = now;
        self.store.update_local_event(&after)?;
        self.store.insert_tombstone(&CalendarTombstone {
            event_id: after.id.clone(),
            source_id: after.source_id.clone(),
            uid: after.id.clone(),
            last_etag: after.etag.clone(),
            deleted_at: now,
        })?;
        self.store.append_audit(
            &AuditEntry::new(AuditOperation::Delete, AuditActor::User)
                .for_event(id)
                .with_before(&before),
        )?;

        let result = match &target {
            Some(source) => self.push(source, after, RemoteOp::Delete).await,
            None => Ok(after),
        };
        self.merger.invalidate();
        result
    }

    /// Updates source metadata (name, color, policy, credentials).
    pub fn update_source(&self, id: &str, update: &SourceUpdate) -> ServerResult<CalendarSource> {
        let source = self.sources.update(id, update)?;
        self.merger.invalidate();
        Ok(source)
    }

    fn local_event(&self, id: &str) -> ServerResult<LocalEvent> {
        self.store
            .get_local_event(id)?
            .ok_or_else(|| ServerError::not_found("local event", id))
    }

    /// Loads a source and runs the checks that precede any local change.
    fn writable_source(&self, id: &str) -> ServerResult<CalendarSource> {
        let source = self.sources.get(id)?;
        if self.adapters.writer_for(source.source_type).is_none() {
            return Err(ServerError::WriteNotAllowed {
                message: format!("{} sources are read-only", source.source_type),
            });
        }
        self.flags.check(&source)?;
        if !self.quota.can_write(&source.id) {
            return Err(ServerError::quota_exceeded(&source.id));
        }
        Ok(source)
    }

    /// Sends the remote half of a write and records its outcome locally.
    async fn push(
        &self,
        source: &CalendarSource,
        mut event: LocalEvent,
        op: RemoteOp<'_>,
    ) -> ServerResult<LocalEvent> {
        let result = if self.quota.consume_token(&source.id) {
            self.send(source, &event, &op).await
        } else {
            Err(ProviderError::quota_exceeded(format!("write quota exhausted for {}", source.id)))
        };

        match result {
            Ok(outcome) => {
                if !outcome.dry_run {
                    event.etag = outcome.etag.or(event.etag);
                    event.href = outcome.href.or(event.href);
                }
                if !matches!(op, RemoteOp::Delete) {
                    event.content.status = EventStatus::Confirmed;
                }
                self.store.update_local_event(&event)?;
                info!(event_id = %event.id, source_id = %source.id, dry_run = outcome.dry_run, "remote write applied");
                Ok(event)
            }
            Err(e) => {
                warn!(event_id = %event.id, source_id = %source.id, error = %e, "remote write failed");
                if matches!(op, RemoteOp::Delete) {
                    // The row stays cancelled; the unfinished remote delete lives in the audit log.
                    self.store.append_audit(
                        &AuditEntry::new(AuditOperation::Delete, AuditActor::System)
                            .for_event(event.id.as_str())
                            .for_source(source.id.as_str())
                            .with_after(&json!({ "remote": "failed", "error": e.to_string() })),
                    )?;
                } else {
                    event.content.status = EventStatus::Failed;
                    self.store.update_local_event(&event)?;
                }
                match e.code() {
                    ProviderErrorCode::Conflict => Err(ServerError::from(e)),
                    ProviderErrorCode::QuotaExceeded => Err(ServerError::quota_exceeded(&source.id)),
                    _ => Ok(event),
                }
            }
        }
    }

    async fn send(
        &self,
        source: &CalendarSource,
        event: &LocalEvent,
        op: &RemoteOp<'_>,
    ) -> Result<WriteOutcome, ProviderError> {
        let writer: &dyn RemoteWriter = self
            .adapters
            .writer_for(source.source_type)
            .map(|w| w.as_ref())
            .ok_or_else(|| ProviderError::write_not_allowed("source type does not accept writes"))?;
        let flags = self.flags;
        let remote = RemoteEvent {
            uid: event.id.clone(),
            content: match op {
                RemoteOp::Update { before, .. } => (*before).clone(),
                _ => event.content.clone(),
            },
            href: event.href.clone(),
            etag: event.etag.clone(),
        };
        let remote = &remote;

        match op {
            RemoteOp::Create => {
                let mut created = remote.clone();
                created.content.status = EventStatus::Confirmed;
                let created = &created;
                self.retry
                    .execute(move || writer.create_event(source, flags, created), "create_event", &source.id)
                    .await
            }
            RemoteOp::Update { changes, .. } => {
                let changes: &EventChanges = changes;
                self.retry
                    .execute(
                        move || writer.update_event(source, flags, remote, changes),
                        "update_event",
                        &source.id,
                    )
                    .await
            }
            RemoteOp::Delete => {
                self.retry
                    .execute(move || writer.delete_event(source, flags, remote), "delete_event", &source.id)
                    .await
            }
        }
    }
}

fn validate_content(content: &EventContent) -> ServerResult<()> {
    if content.title.trim().is_empty() {
        return Err(ServerError::validation("event title must not be empty"));
    }
    if content.end < content.start {
        return Err(ServerError::validation("event end must not precede its start"));
    }
    Ok(())
}
