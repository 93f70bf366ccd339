//! evload CLI - main entry point

use std::process;

use clap::Parser;
use evload_cli::{commands, Cli, Commands};
use evload_common::logging::{init_logging, LogConfig, LogLevel};
use evload_common::EtlError;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    // The CLI keeps working without logging
    let _ = init_logging(&log_config);

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<EtlError>() {
                Some(EtlError::ConfigInvalid { .. }) => 2,
                _ => 1,
            }
        }
    };
    process::exit(code);
}

async fn execute(cli: &Cli) -> anyhow::Result<i32> {
    let config = cli.config.as_deref();

    match &cli.command {
        Commands::Run {
            mode,
            workers,
            validate,
            source_uri,
        } => {
            let summary =
                commands::run(config, mode, *workers, *validate, source_uri.clone()).await?;
            Ok(if summary.all_succeeded() { 0 } else { 1 })
        }

        Commands::InitDb => {
            commands::init_db(config).await?;
            Ok(0)
        }

        Commands::Validate { schema, source_uri } => {
            let all_valid = commands::validate(schema, source_uri).await?;
            Ok(if all_valid { 0 } else { 1 })
        }

        Commands::ValidateDbSchema => {
            let matches = commands::validate_db_schema(config).await?;
            Ok(if matches { 0 } else { 1 })
        }
    }
}
