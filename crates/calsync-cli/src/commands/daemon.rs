//! `run`: the sync scheduler in the foreground.

use tracing::{info, warn};

use calsync_server::{Engine, SyncConfig};

use crate::error::CliResult;

/// Starts the scheduler and blocks until SIGINT or SIGTERM.
///
/// The in-flight cycle, if any, finishes before returning.
pub async fn run(config: &SyncConfig) -> CliResult<()> {
    let engine = Engine::open(config)?;
    let sources = config.sources();
    if sources.is_empty() {
        warn!("no sources configured; add [[ics]] or [[caldav]] entries to the config file");
    }
    info!(
        sources = sources.len(),
        write_enabled = config.features.write_enabled,
        dry_run = config.features.dry_run,
        "starting calsync"
    );

    engine.scheduler.start()?;
    wait_for_shutdown().await?;

    info!("shutting down");
    engine.scheduler.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C");
    Ok(())
}
