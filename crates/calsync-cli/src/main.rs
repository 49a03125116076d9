//! calsync CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use calsync_cli::cli::{Cli, Command};
use calsync_cli::commands;
use calsync_cli::error::CliResult;
use calsync_core::{TracingConfig, init_tracing};
use calsync_server::SyncConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = if cli.debug {
        TracingConfig::cli_debug()
    } else if matches!(cli.command, Command::Run) {
        TracingConfig::daemon()
    } else {
        TracingConfig::default().with_level(Level::WARN)
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = match cli.config {
        Some(ref path) => SyncConfig::load_from(path)?,
        None => SyncConfig::load()?,
    };

    match cli.command {
        Command::Run => commands::daemon::run(&config).await,
        Command::Sync { ref source } => commands::sources::sync(&config, source.as_deref(), cli.json).await,
        Command::Health { ref source } => commands::sources::health(&config, source.as_deref(), cli.json).await,
        Command::Sources => commands::sources::list(&config, cli.json),
        Command::Events { from, days } => commands::events::show(&config, from, days, cli.json),
        Command::NextDue {
            ref rule,
            anchor,
            previous,
            reference,
        } => commands::next_due::show(rule, anchor, previous, reference, cli.json),
    }
}
