//! Run orchestration
//!
//! Discovers files, hashes them, filters against the loader's history in
//! delta mode, and dispatches one isolated worker task per file. Workers
//! share nothing mutable: each opens its own stream, extracts and
//! transforms on a blocking thread, and loads over its own database
//! connection. A failed file is quarantined (when configured), durably
//! journaled as failed, and the remaining files continue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use evload_common::EtlError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::extract::validate::XsdValidator;
use crate::extract::{AuditStream, NormalizedStream};
use crate::loader::{self, LoadMode, Loader};
use crate::schema::SchemaType;
use crate::source::{FileSource, Quarantine, SourceFile};
use crate::transform::{transform_audit, transform_normalized};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub mode: LoadMode,
    /// Worker pool size; defaults to host parallelism
    pub workers: Option<usize>,
    /// Run the XSD validation pass before loading each file
    pub validate: bool,
}

/// Aggregate outcome of one run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub files_discovered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rows_loaded: u64,
    pub record_errors: usize,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

struct FileOutcome {
    uri: String,
    rows: u64,
    record_errors: usize,
    error: Option<String>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Run the full pipeline over every file the source URI resolves to.
pub async fn run_etl(
    settings: &Settings,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let source_uri = settings.source_uri.as_deref().ok_or_else(|| {
        EtlError::config(
            "source_uri is not set",
            "pass a SOURCE_URI argument or set source_uri in config.yaml",
        )
    })?;

    info!(
        mode = %options.mode,
        schema = %settings.schema_type,
        source = source_uri,
        "Starting ETL run"
    );

    let source = FileSource::parse(source_uri)?;

    let validator = match (options.validate, settings.xsd_schema_path.as_deref()) {
        (false, _) => None,
        (true, Some(path)) => Some(Arc::new(XsdValidator::from_file(path)?)),
        (true, None) => {
            return Err(EtlError::config(
                "xsd_schema_path is not set",
                "--validate requires xsd_schema_path in the configuration",
            )
            .into())
        }
    };

    let quarantine = match settings.quarantine_uri.as_deref() {
        Some(uri) => Some(Arc::new(Quarantine::parse(uri)?)),
        None => None,
    };

    let files = source.list().await?;
    info!(count = files.len(), "Discovered source files");

    let loader = loader::loader_for_dsn(&settings.database.dsn).await?;

    let mut summary = RunSummary {
        files_discovered: files.len(),
        ..Default::default()
    };

    // Hash every file up front; delta filtering happens before any parsing
    let completed = match options.mode {
        LoadMode::Delta => loader.get_completed_file_hashes().await?,
        LoadMode::Full => Default::default(),
    };

    let mut to_process: Vec<(SourceFile, String)> = Vec::new();
    for file in files {
        match file.sha256().await {
            Ok(hash) => {
                if options.mode == LoadMode::Delta && completed.contains(&hash) {
                    info!(file = %file.uri, "Skipping already completed file");
                    summary.skipped += 1;
                } else {
                    to_process.push((file, hash));
                }
            }
            Err(e) => {
                error!(file = %file.uri, error = %e, "Failed to hash file");
                summary.failed += 1;
            }
        }
    }

    // A full run resets the targets once; the history journal is kept
    if options.mode == LoadMode::Full {
        loader.truncate_all_targets(settings.schema_type).await?;
    }

    let workers = options
        .workers
        .or(settings.workers)
        .unwrap_or_else(default_workers)
        .max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    info!(workers, files = to_process.len(), "Dispatching worker pool");

    let mut handles = Vec::new();
    for (file, hash) in to_process {
        let semaphore = semaphore.clone();
        let loader = loader.clone();
        let settings = settings.clone();
        let validator = validator.clone();
        let quarantine = quarantine.clone();
        let cancel = cancel.clone();
        let mode = options.mode;

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();

            match process_file(
                &file,
                &hash,
                loader.as_ref(),
                &settings,
                mode,
                validator.as_deref(),
                cancel,
            )
            .await
            {
                Ok((rows, record_errors)) => FileOutcome {
                    uri: file.uri.clone(),
                    rows,
                    record_errors,
                    error: None,
                },
                Err(e) => {
                    let message = format!("{:#}", e);
                    if let Some(quarantine) = &quarantine {
                        match quarantine.store(&file, &hash, &message).await {
                            Ok(dest) => {
                                info!(file = %file.uri, dest = %dest, "Quarantined failed file")
                            }
                            Err(qe) => {
                                warn!(file = %file.uri, error = %qe, "Could not quarantine file")
                            }
                        }
                    }
                    if let Err(he) = loader.record_failure(&file.uri, &hash, &message).await {
                        error!(file = %file.uri, error = %he, "Could not record failure history");
                    }
                    FileOutcome {
                        uri: file.uri.clone(),
                        rows: 0,
                        record_errors: 0,
                        error: Some(message),
                    }
                }
            }
        }));
    }

    for handle in handles {
        match handle.await {
            Ok(outcome) => match outcome.error {
                Some(error) => {
                    error!(file = %outcome.uri, error = %error, "File failed");
                    summary.failed += 1;
                }
                None => {
                    info!(
                        file = %outcome.uri,
                        rows = outcome.rows,
                        record_errors = outcome.record_errors,
                        "File loaded"
                    );
                    summary.succeeded += 1;
                    summary.rows_loaded += outcome.rows;
                    summary.record_errors += outcome.record_errors;
                }
            },
            Err(e) => {
                error!(error = %e, "Worker task panicked");
                summary.failed += 1;
            }
        }
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        rows = summary.rows_loaded,
        record_errors = summary.record_errors,
        "ETL run finished"
    );
    Ok(summary)
}

/// One worker: validate (optionally), extract, transform, load.
/// Cancellation and the per-file timeout surface as ordinary failures, so
/// the transaction rolls back and the file is journaled failed.
async fn process_file(
    file: &SourceFile,
    file_hash: &str,
    loader: &dyn Loader,
    settings: &Settings,
    mode: LoadMode,
    validator: Option<&XsdValidator>,
    cancel: CancellationToken,
) -> Result<(u64, usize)> {
    let work = async {
        if let Some(validator) = validator {
            let reader = std::io::BufReader::new(file.open().await?);
            let validator = validator.clone();
            let (ok, messages) =
                tokio::task::spawn_blocking(move || validator.validate(reader))
                    .await
                    .context("validation task panicked")?;
            if !ok {
                return Err(EtlError::XsdValidationFailed { messages }.into());
            }
        }

        let reader = std::io::BufReader::new(file.open().await?);
        match settings.schema_type {
            SchemaType::Normalized => {
                let batch = tokio::task::spawn_blocking(move || {
                    transform_normalized(NormalizedStream::new(reader))
                })
                .await
                .context("extraction task panicked")??;

                for record_error in &batch.errors {
                    warn!(
                        file = %file.uri,
                        ordinal = record_error.ordinal,
                        reason = %record_error.reason,
                        "Skipped invalid ICSR record"
                    );
                }
                let rows = loader
                    .load_normalized_data(&batch, mode, &file.uri, file_hash)
                    .await?;
                Ok((rows, batch.errors.len()))
            }
            SchemaType::Audit => {
                let loaded_at = chrono::Utc::now();
                let batch = tokio::task::spawn_blocking(move || {
                    transform_audit(AuditStream::new(reader), loaded_at)
                })
                .await
                .context("extraction task panicked")??;

                for record_error in &batch.errors {
                    warn!(
                        file = %file.uri,
                        ordinal = record_error.ordinal,
                        reason = %record_error.reason,
                        "Skipped invalid ICSR record"
                    );
                }
                let rows = loader
                    .load_audit_data(&batch, mode, &file.uri, file_hash)
                    .await?;
                Ok((rows, batch.errors.len()))
            }
        }
    };

    let timed = async {
        match settings.file_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), work)
                .await
                .map_err(|_| anyhow!("file processing timed out after {}s", secs))?,
            None => work.await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("run cancelled")),
        result = timed => result,
    }
}
