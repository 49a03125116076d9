//! `sync`, `health` and `sources`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use calsync_core::{CalendarSource, SourceType, WritePolicy};
use calsync_server::{Engine, SourceHealth, SyncConfig, SyncOutcome, SyncReport};

use crate::commands::print_json;
use crate::error::CliResult;

/// A source as shown to users; credentials are never printed.
#[derive(Debug, Serialize)]
pub struct SourceView {
    pub id: String,
    pub source_type: SourceType,
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub write_policy: WritePolicy,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub needs_reauth: bool,
}

impl From<&CalendarSource> for SourceView {
    fn from(source: &CalendarSource) -> Self {
        Self {
            id: source.id.clone(),
            source_type: source.source_type,
            name: source.name.clone(),
            url: source.connection.url.clone(),
            username: source.connection.username.clone(),
            write_policy: source.write_policy,
            enabled: source.enabled,
            last_sync_at: source.metadata.last_sync_at,
            consecutive_errors: source.metadata.consecutive_errors,
            needs_reauth: source.metadata.needs_reauth,
        }
    }
}

pub async fn sync(config: &SyncConfig, source_id: Option<&str>, json: bool) -> CliResult<()> {
    let engine = Engine::open(config)?;
    let reports = match source_id {
        Some(id) => {
            engine.sync.sources().bootstrap(&config.sources())?;
            let source = engine.sync.sources().get(id)?;
            vec![engine.sync.sync_source(&source).await]
        }
        None => engine.sync_once(config).await?,
    };

    if json {
        return print_json(&reports);
    }
    for report in &reports {
        println!("{:<24} {}", report.source_id, describe(report));
    }
    Ok(())
}

pub async fn health(config: &SyncConfig, source_id: Option<&str>, json: bool) -> CliResult<()> {
    let engine = Engine::open(config)?;
    let sources = engine.sync.sources().bootstrap(&config.sources())?;
    let ids: Vec<String> = match source_id {
        Some(id) => vec![id.to_string()],
        None => sources.into_iter().map(|s| s.id).collect(),
    };

    let mut results: Vec<SourceHealth> = Vec::with_capacity(ids.len());
    for id in &ids {
        results.push(engine.sync.health_check(id).await?);
    }

    if json {
        return print_json(&results);
    }
    for health in &results {
        println!(
            "{:<24} {:<20} {:<11} errors={} last_sync={}{}",
            health.source_id,
            health.name,
            if health.reachable { "reachable" } else { "unreachable" },
            health.consecutive_errors,
            health
                .last_sync_at
                .map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
            if health.needs_reauth { " (needs re-auth)" } else { "" },
        );
        if let Some(error) = &health.last_error {
            println!("{:<24} last error: {}", "", error);
        }
    }
    Ok(())
}

pub fn list(config: &SyncConfig, json: bool) -> CliResult<()> {
    let engine = Engine::open(config)?;
    engine.sync.sources().bootstrap(&config.sources())?;
    let views: Vec<SourceView> = engine.sync.sources().list()?.iter().map(SourceView::from).collect();

    if json {
        return print_json(&views);
    }
    if views.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }
    for view in &views {
        println!(
            "{:<24} {:<6} {:<20} {:<5} {}{}",
            view.id,
            view.source_type.as_str(),
            view.name,
            view.write_policy.as_str(),
            view.url,
            if view.enabled { "" } else { " (disabled)" },
        );
    }
    Ok(())
}

fn describe(report: &SyncReport) -> String {
    match &report.outcome {
        SyncOutcome::Synced(summary) => format!(
            "synced: {} new, {} updated, {} unchanged, {} failed",
            summary.inserted, summary.updated, summary.unchanged, summary.failed
        ),
        SyncOutcome::NotModified => "not modified".to_string(),
        SyncOutcome::Skipped { reason } => format!("skipped: {}", reason),
        SyncOutcome::Failed { error, needs_reauth } => {
            if *needs_reauth {
                format!("failed (needs re-auth): {}", error)
            } else {
                format!("failed: {}", error)
            }
        }
    }
}
