//! Command-line interface definition.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// calsync - calendar sync and recurrence engine
#[derive(Debug, Parser)]
#[command(name = "calsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "CALSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sync scheduler in the foreground until interrupted
    Run,

    /// Run one sync cycle and print the per-source outcome
    Sync {
        /// Only sync this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Probe sources and show their sync state
    Health {
        /// Source id; all sources when omitted
        source: Option<String>,
    },

    /// List configured sources
    Sources,

    /// Show the merged timeline
    Events {
        /// First day to show (defaults to today)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Number of days to show
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Compute the next due date of a recurrence rule
    NextDue {
        /// RRULE text, e.g. FREQ=WEEKLY;BYDAY=FR
        #[arg(long)]
        rule: String,

        /// Date the series started on
        #[arg(long)]
        anchor: NaiveDate,

        /// Due date of the instance being closed
        #[arg(long)]
        previous: Option<NaiveDate>,

        /// Reference day (defaults to today)
        #[arg(long)]
        reference: Option<NaiveDate>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_next_due() {
        let cli = Cli::try_parse_from([
            "calsync",
            "next-due",
            "--rule",
            "FREQ=DAILY",
            "--anchor",
            "2025-01-13",
            "--reference",
            "2025-01-14",
        ])
        .unwrap();
        match cli.command {
            Command::NextDue { anchor, reference, .. } => {
                assert_eq!(anchor, NaiveDate::from_ymd_opt(2025, 1, 13).unwrap());
                assert_eq!(reference, NaiveDate::from_ymd_opt(2025, 1, 14));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["calsync", "sources", "--json", "--config", "/tmp/c.toml"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }
}
