//! Command-line interface for bi-utils.
//!
//! This module provides the CLI structure for the `biu` binary. The command
//! handlers live in the binary itself.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::Verbosity;

pub use commands::{
    ConfigCommand, DbCommand, FilesCommand, FormatArg, QaCommand, QueryCommand, S3Command,
    SystemCommand,
};

/// biu - BI data plumbing
///
/// Moves tables between local CSV files, S3 and a Redshift warehouse, renders
/// query templates and runs data-quality checks.
#[derive(Debug, Parser)]
#[command(name = "biu")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace, -vvv also logs drivers)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Render SQL templates
    #[command(subcommand)]
    Query(QueryCommand),

    /// Inspect and name local data files
    #[command(subcommand)]
    Files(FilesCommand),

    /// Process memory and size helpers
    #[command(subcommand)]
    System(SystemCommand),

    /// Run data-quality checks over a CSV file
    Qa(QaCommand),

    /// Transfer files to and from S3
    #[command(subcommand)]
    S3(S3Command),

    /// Load, unload and modify warehouse tables
    #[command(subcommand)]
    Db(DbCommand),
}

impl Command {
    /// Whether the command talks to AWS or the warehouse.
    #[must_use]
    pub fn needs_aws(&self) -> bool {
        matches!(self, Self::S3(_) | Self::Db(_))
    }
}

impl Cli {
    /// Logging verbosity from the `-q`/`-v` flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::new(self.quiet, self.verbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::SqlValue;
    use clap::CommandFactory;

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "biu");
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity() {
        use tracing::Level;

        let level = |args: &[&str]| {
            let cli = Cli::try_parse_from(args).unwrap();
            (cli.verbosity().level(), cli.verbosity().driver_level())
        };
        assert_eq!(level(&["biu", "system", "ram"]), (Level::INFO, Level::WARN));
        assert_eq!(level(&["biu", "-q", "-v", "system", "ram"]), (Level::ERROR, Level::ERROR));
        assert_eq!(level(&["biu", "-v", "system", "ram"]), (Level::DEBUG, Level::WARN));
        assert_eq!(level(&["biu", "system", "ram", "-vvv"]), (Level::TRACE, Level::DEBUG));
    }

    #[test]
    fn test_parse_with_config() {
        let cli = Cli::try_parse_from(["biu", "-c", "/custom/config.toml", "config", "path"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
        assert!(!cli.command.needs_aws());
    }

    #[test]
    fn test_parse_query_render() {
        let cli = Cli::try_parse_from([
            "biu", "query", "render", "q.sql", "-a", "events", "-p", "date=2024-01-01",
        ])
        .unwrap();
        let Command::Query(cmd) = cli.command else {
            panic!("expected query command");
        };
        let QueryCommand::Render { path, args, params } = &cmd;
        assert_eq!(path, &PathBuf::from("q.sql"));
        assert_eq!(args, &vec!["events".to_string()]);
        assert_eq!(params, &vec![("date".to_string(), "2024-01-01".to_string())]);
    }

    #[test]
    fn test_parse_qa() {
        let cli = Cli::try_parse_from([
            "biu",
            "qa",
            "data.csv",
            "--unique",
            "date",
            "--threshold",
            "installs=0:100",
            "--strict",
        ])
        .unwrap();
        let Command::Qa(cmd) = cli.command else {
            panic!("expected qa command");
        };
        assert_eq!(cmd.threshold, vec![("installs".to_string(), 0.0, 100.0)]);
        assert!(cmd.qa_options().strict);
    }

    #[test]
    fn test_parse_db_delete() {
        let cli = Cli::try_parse_from([
            "biu", "db", "delete", "--schema", "dq", "--table", "events", "-w", "id=3", "-w",
            "source=fb",
        ])
        .unwrap();
        assert!(cli.command.needs_aws());
        let Command::Db(cmd) = cli.command else {
            panic!("expected db command");
        };
        assert_eq!(
            cmd.conditions(),
            vec![
                ("id".to_string(), SqlValue::Int(3)),
                ("source".to_string(), SqlValue::Text("fb".to_string())),
            ]
        );
    }

    #[test]
    fn test_db_delete_requires_condition() {
        let result = Cli::try_parse_from(["biu", "db", "delete", "--schema", "dq", "--table", "events"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_db_download_format() {
        let cli = Cli::try_parse_from(["biu", "db", "download", "SELECT 1", "-f", "parquet"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Db(DbCommand::Download {
                format: FormatArg::Parquet,
                ..
            })
        ));
    }
}
