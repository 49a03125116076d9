//! Subcommand implementations.

pub mod daemon;
pub mod events;
pub mod next_due;
pub mod sources;

use serde::Serialize;

use crate::error::CliResult;

/// Prints a value as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
