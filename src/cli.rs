//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "drive-revenant",
    about = "Keeps storage volumes awake with tiny scheduled probe I/O",
    version
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler in the foreground
    Run,

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Probe a single drive once and exit
    Ping {
        /// Drive letter, e.g. "E" or "E:"
        letter: String,
    },
}

/// Default location of the NDJSON event log.
pub fn default_event_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drive-revenant")
        .join("events.ndjson")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["drive-revenant", "run"]);
        assert!(matches!(cli.command, Some(Command::Run)));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_parses_ping_with_config() {
        let cli = Cli::parse_from(["drive-revenant", "-v", "-c", "dr.yml", "ping", "E:"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("dr.yml")));
        match cli.command {
            Some(Command::Ping { letter }) => assert_eq!(letter, "E:"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
