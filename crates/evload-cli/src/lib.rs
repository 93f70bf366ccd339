//! evload CLI - command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod commands;

/// A high-performance ETL tool for EudraVigilance ICSR XML files
#[derive(Debug, Parser)]
#[command(name = "evload", version, about)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the full pipeline: discover, extract, transform, load
    Run {
        /// Load mode: 'delta' skips completed files, 'full' rebuilds targets
        #[arg(long, default_value = "delta")]
        mode: String,

        /// Worker pool size (defaults to host CPU count)
        #[arg(long)]
        workers: Option<usize>,

        /// Validate each file against the configured XSD before loading
        #[arg(long)]
        validate: bool,

        /// Source URI; overrides source_uri from the configuration
        source_uri: Option<String>,
    },

    /// Create all target tables (idempotent)
    InitDb,

    /// Validate files against an XSD without loading anything
    Validate {
        /// Path to the XSD schema
        #[arg(long)]
        schema: PathBuf,

        /// Source URI of the files to validate
        source_uri: String,
    },

    /// Compare the live database schema against the expected definition
    ValidateDbSchema,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults_to_delta() {
        let cli = Cli::parse_from(["evload", "run", "/data/in"]);
        match cli.command {
            Commands::Run {
                mode,
                workers,
                validate,
                source_uri,
            } => {
                assert_eq!(mode, "delta");
                assert_eq!(workers, None);
                assert!(!validate);
                assert_eq!(source_uri.as_deref(), Some("/data/in"));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_validate_requires_schema() {
        assert!(Cli::try_parse_from(["evload", "validate", "/data/in"]).is_err());
        let cli =
            Cli::parse_from(["evload", "validate", "--schema", "e2b.xsd", "/data/in"]);
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }
}
