//! Command implementations

use std::path::Path;

use anyhow::Result;
use evload_common::EtlError;
use evload_core::config::Settings;
use evload_core::extract::validate::XsdValidator;
use evload_core::loader;
use evload_core::orchestrator::{run_etl, RunOptions, RunSummary};
use evload_core::source::FileSource;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// `evload run`: the full pipeline over every discovered file
pub async fn run(
    config: Option<&Path>,
    mode: &str,
    workers: Option<usize>,
    validate: bool,
    source_uri: Option<String>,
) -> Result<RunSummary> {
    let mut settings = Settings::load(config)?;
    if let Some(uri) = source_uri {
        settings.source_uri = Some(uri);
    }
    let mode = mode.parse().map_err(|_| {
        EtlError::config(
            format!("invalid load mode '{}'", mode),
            "use 'full' or 'delta'",
        )
    })?;

    // Surface Ctrl-C to in-flight workers; they abort their transactions
    // and journal the file as failed before exiting.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested; aborting in-flight files");
            on_signal.cancel();
        }
    });

    let summary = run_etl(
        &settings,
        RunOptions {
            mode,
            workers,
            validate,
        },
        cancel,
    )
    .await?;

    println!(
        "Processed {} file(s): {} succeeded, {} failed, {} skipped ({} rows, {} record errors).",
        summary.files_discovered,
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.rows_loaded,
        summary.record_errors,
    );
    Ok(summary)
}

/// `evload init-db`: idempotent DDL for all tables
pub async fn init_db(config: Option<&Path>) -> Result<()> {
    let settings = Settings::load(config)?;
    let loader = loader::loader_for_dsn(&settings.database.dsn).await?;
    loader.create_all_tables().await?;
    println!("All tables created or already exist.");
    Ok(())
}

/// `evload validate`: XSD validation pass without loading.
/// Returns whether every file validated.
pub async fn validate(schema: &Path, source_uri: &str) -> Result<bool> {
    let validator = XsdValidator::from_file(schema)?;
    let source = FileSource::parse(source_uri)?;
    let files = source.list().await?;

    let mut valid = 0usize;
    let mut invalid = 0usize;
    for file in files {
        let reader = std::io::BufReader::new(file.open().await?);
        let validator = validator.clone();
        let (ok, messages) = tokio::task::spawn_blocking(move || validator.validate(reader))
            .await?;
        if ok {
            println!("[VALID] {}", file.uri);
            valid += 1;
        } else {
            println!("[INVALID] {}: {}", file.uri, messages.join("; "));
            invalid += 1;
        }
    }

    println!(
        "Validation summary: {} file(s) valid, {} file(s) invalid.",
        valid, invalid
    );
    Ok(invalid == 0)
}

/// `evload validate-db-schema`: catalog comparison.
/// Returns whether the live schema matches.
pub async fn validate_db_schema(config: Option<&Path>) -> Result<bool> {
    let settings = Settings::load(config)?;
    let loader = loader::loader_for_dsn(&settings.database.dsn).await?;
    let matches = loader.validate_schema().await?;
    if matches {
        println!("Database schema matches the expected definition.");
    } else {
        println!("Database schema does NOT match the expected definition; see log for details.");
    }
    Ok(matches)
}
