//! PostgreSQL loader backend
//!
//! Bulk ingest uses `COPY ... FROM STDIN` on the raw driver connection;
//! merges are single set-based `INSERT ... ON CONFLICT` statements carrying
//! the version gate. Row-by-row inserts never happen here.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, warn};

use super::{LoadMode, Loader, LoaderFactory};
use crate::schema::{self, SchemaType, TableDef};
use crate::transform::{AuditBatch, NormalizedBatch};

const DEFAULT_MAX_CONNECTIONS: u32 = 16;

/// Transaction-scoped table capturing which safetyreportids passed the
/// master version gate; child-row replacement is restricted to these.
const APPLIED_REPORTS: &str = "applied_reports";

/// Factory registered for the `postgresql` dialect
pub struct PostgresFactory;

#[async_trait]
impl LoaderFactory for PostgresFactory {
    async fn connect(&self, dsn: &str) -> Result<Arc<dyn Loader>> {
        Ok(Arc::new(PostgresLoader::connect(dsn).await?))
    }
}

pub struct PostgresLoader {
    pool: PgPool,
}

impl PostgresLoader {
    /// Connect a pooled loader. Workers acquire their own connections from
    /// the pool; a connection is never shared between concurrent loads.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(dsn)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by the integration tests)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pre-loading step for one target table.
    ///
    /// Full mode truncates the target (cascading to children) and returns
    /// the target itself; delta mode creates a transaction-scoped staging
    /// table of the same shape and returns its name.
    pub async fn prepare_load(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target: &str,
        mode: LoadMode,
    ) -> Result<String> {
        match mode {
            LoadMode::Full => {
                sqlx::query(&format!("TRUNCATE TABLE {} CASCADE", target))
                    .execute(&mut **tx)
                    .await
                    .with_context(|| format!("Failed to truncate table '{}'", target))?;
                Ok(target.to_string())
            }
            LoadMode::Delta => {
                let staging = format!("staging_{}", target);
                sqlx::query(&format!(
                    "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
                    staging, target
                ))
                .execute(&mut **tx)
                .await
                .with_context(|| format!("Failed to create staging table for '{}'", target))?;
                Ok(staging)
            }
        }
    }

    /// Stream a CSV buffer into a table over the native COPY protocol.
    /// Does not commit.
    pub async fn bulk_load_native(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        data: &[u8],
        table: &str,
        columns: &[&str],
    ) -> Result<u64> {
        let column_sql = if columns.is_empty() {
            String::new()
        } else {
            format!(" ({})", columns.join(", "))
        };
        let statement = format!(
            "COPY {}{} FROM STDIN WITH (FORMAT csv, HEADER true)",
            table, column_sql
        );

        let mut copy = tx
            .copy_in_raw(&statement)
            .await
            .with_context(|| format!("Failed to start COPY into '{}'", table))?;
        copy.send(data)
            .await
            .with_context(|| format!("Failed to stream CSV into '{}'", table))?;
        let rows = copy
            .finish()
            .await
            .with_context(|| format!("Failed to finish COPY into '{}'", table))?;

        debug!(table = table, rows = rows, "Bulk loaded staging data");
        Ok(rows)
    }

    /// Merge a staging table into its target with one set-based statement.
    /// Does not commit.
    pub async fn handle_upsert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        staging: &str,
        table: &TableDef,
    ) -> Result<u64> {
        let result = sqlx::query(&build_merge_sql(table, staging))
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to merge '{}' into '{}'", staging, table.name))?;
        Ok(result.rows_affected())
    }

    async fn mark_history_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        filename: &str,
        file_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO etl_file_history (filename, file_hash, status) \
             VALUES ($1, $2, 'pending') \
             ON CONFLICT (file_hash) DO UPDATE \
             SET status = 'pending', filename = EXCLUDED.filename, \
                 rows_processed = NULL, load_timestamp = now()",
        )
        .bind(filename)
        .bind(file_hash)
        .execute(&mut **tx)
        .await
        .context("Failed to write pending history row")?;
        Ok(())
    }

    async fn mark_history_completed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        file_hash: &str,
        rows_processed: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE etl_file_history \
             SET status = 'completed', rows_processed = $2, load_timestamp = now() \
             WHERE file_hash = $1",
        )
        .bind(file_hash)
        .bind(rows_processed as i64)
        .execute(&mut **tx)
        .await
        .context("Failed to write completed history row")?;
        Ok(())
    }
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn create_all_tables(&self) -> Result<()> {
        for ddl in schema::ddl_statements() {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to create table")?;
        }
        Ok(())
    }

    async fn validate_schema(&self) -> Result<bool> {
        let mut matches = true;
        for table in schema::all_tables() {
            let columns: Vec<String> = sqlx::query_scalar(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1",
            )
            .bind(table.name)
            .fetch_all(&self.pool)
            .await
            .context("Failed to inspect database catalog")?;

            if columns.is_empty() {
                warn!(table = table.name, "Expected table is missing");
                matches = false;
                continue;
            }
            for column in table.columns {
                if !columns.iter().any(|c| c == column) {
                    warn!(
                        table = table.name,
                        column = column,
                        "Expected column is missing"
                    );
                    matches = false;
                }
            }
        }
        Ok(matches)
    }

    async fn get_completed_file_hashes(&self) -> Result<HashSet<String>> {
        let hashes: Vec<String> = sqlx::query_scalar(
            "SELECT file_hash FROM etl_file_history WHERE status = 'completed'",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch completed file hashes")?;
        Ok(hashes.into_iter().collect())
    }

    async fn truncate_all_targets(&self, schema_type: SchemaType) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start transaction")?;
        for table in schema::target_tables(schema_type) {
            self.prepare_load(&mut tx, table.name, LoadMode::Full).await?;
        }
        tx.commit().await.context("Failed to commit truncation")?;
        Ok(())
    }

    async fn load_normalized_data(
        &self,
        batch: &NormalizedBatch,
        mode: LoadMode,
        file_path: &str,
        file_hash: &str,
    ) -> Result<u64> {
        let filename = file_basename(file_path);
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start transaction")?;

        self.mark_history_pending(&mut tx, &filename, file_hash).await?;
        let total_rows = batch.total_rows();
        let row_count = |table: &TableDef| {
            batch.row_counts.get(table.name).copied().unwrap_or(0)
        };
        let buffer = |table: &TableDef| {
            batch
                .buffers
                .get(table.name)
                .ok_or_else(|| anyhow!("missing CSV buffer for table '{}'", table.name))
        };

        match mode {
            LoadMode::Full => {
                // Targets were truncated at run start; COPY straight into
                // them and skip the merge.
                for table in schema::NORMALIZED_TABLES {
                    if row_count(table) == 0 {
                        continue;
                    }
                    self.bulk_load_native(
                        &mut tx,
                        buffer(table)?.as_bytes(),
                        table.name,
                        table.columns,
                    )
                    .await?;
                }
            }
            LoadMode::Delta => {
                sqlx::query(&format!(
                    "CREATE TEMP TABLE {} (safetyreportid VARCHAR(255) PRIMARY KEY) \
                     ON COMMIT DROP",
                    APPLIED_REPORTS
                ))
                .execute(&mut *tx)
                .await
                .context("Failed to create applied_reports table")?;

                // Master first: its merge decides which reports apply
                let master = &schema::ICSR_MASTER;
                if row_count(master) > 0 {
                    let staging = self.prepare_load(&mut tx, master.name, mode).await?;
                    self.bulk_load_native(
                        &mut tx,
                        buffer(master)?.as_bytes(),
                        &staging,
                        master.columns,
                    )
                    .await?;
                    sqlx::query(&build_master_merge_sql(&staging))
                        .execute(&mut *tx)
                        .await
                        .context("Failed to merge icsr_master")?;
                }

                // Replace child rows for the reports that passed the gate
                for table in schema::CHILD_DELETE_ORDER {
                    sqlx::query(&build_child_delete_sql(table))
                        .execute(&mut *tx)
                        .await
                        .with_context(|| {
                            format!("Failed to clear stale rows from '{}'", table.name)
                        })?;
                }
                for table in schema::NORMALIZED_TABLES {
                    if table.name == master.name || row_count(table) == 0 {
                        continue;
                    }
                    let staging = self.prepare_load(&mut tx, table.name, mode).await?;
                    self.bulk_load_native(
                        &mut tx,
                        buffer(table)?.as_bytes(),
                        &staging,
                        table.columns,
                    )
                    .await?;
                    sqlx::query(&build_child_insert_sql(table, &staging))
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("Failed to apply rows into '{}'", table.name))?;
                }
            }
        }

        self.mark_history_completed(&mut tx, file_hash, total_rows).await?;
        tx.commit().await.context("Failed to commit file load")?;

        debug!(
            file = file_path,
            rows = total_rows,
            mode = %mode,
            "Normalized load committed"
        );
        Ok(total_rows)
    }

    async fn load_audit_data(
        &self,
        batch: &AuditBatch,
        mode: LoadMode,
        file_path: &str,
        file_hash: &str,
    ) -> Result<u64> {
        let filename = file_basename(file_path);
        let audit = &schema::ICSR_AUDIT_LOG;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start transaction")?;

        self.mark_history_pending(&mut tx, &filename, file_hash).await?;

        if batch.row_count > 0 {
            match mode {
                LoadMode::Full => {
                    self.bulk_load_native(
                        &mut tx,
                        batch.buffer.as_bytes(),
                        audit.name,
                        audit.columns,
                    )
                    .await?;
                }
                LoadMode::Delta => {
                    let staging = self.prepare_load(&mut tx, audit.name, mode).await?;
                    self.bulk_load_native(
                        &mut tx,
                        batch.buffer.as_bytes(),
                        &staging,
                        audit.columns,
                    )
                    .await?;
                    self.handle_upsert(&mut tx, &staging, audit).await?;
                }
            }
        }

        self.mark_history_completed(&mut tx, file_hash, batch.row_count as u64)
            .await?;
        tx.commit().await.context("Failed to commit file load")?;
        Ok(batch.row_count as u64)
    }

    async fn record_failure(&self, file_path: &str, file_hash: &str, error: &str) -> Result<()> {
        let filename = file_basename(file_path);
        sqlx::query(
            "INSERT INTO etl_file_history (filename, file_hash, status) \
             VALUES ($1, $2, 'failed') \
             ON CONFLICT (file_hash) DO UPDATE \
             SET status = 'failed', filename = EXCLUDED.filename, load_timestamp = now()",
        )
        .bind(&filename)
        .bind(file_hash)
        .execute(&self.pool)
        .await
        .context("Failed to write failed history row")?;

        warn!(file = file_path, error = error, "File marked failed");
        Ok(())
    }
}

fn file_basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// One set-based merge statement for a staging table and its target.
///
/// The version gate: a staged row applies when the target has no row for
/// the key, when its version column is strictly newer (a NULL stored
/// version never blocks), or when the staged row is a nullification.
/// Applied master updates COALESCE sparse staged columns against stored
/// values, keep the version column monotonic via GREATEST, and take
/// `is_nullified` from the staged row so a newer non-null version
/// reactivates a nullified case.
fn build_merge_sql(table: &TableDef, staging: &str) -> String {
    let target = table.name;
    let cols = table.columns.join(", ");
    let pk = table.primary_key.join(", ");

    let Some(version_key) = table.version_key else {
        return format!(
            "INSERT INTO {target} ({cols}) \
             SELECT {cols} FROM {staging} \
             ON CONFLICT ({pk}) DO NOTHING"
        );
    };

    let assignments: Vec<String> = table
        .columns
        .iter()
        .filter(|col| !table.primary_key.contains(*col))
        .map(|col| {
            if *col == version_key {
                format!("{col} = GREATEST({target}.{col}, EXCLUDED.{col})")
            } else if table.has_nullified_flag && *col == "is_nullified" {
                format!("{col} = EXCLUDED.{col}")
            } else if table.has_nullified_flag {
                format!("{col} = COALESCE(EXCLUDED.{col}, {target}.{col})")
            } else {
                format!("{col} = EXCLUDED.{col}")
            }
        })
        .collect();

    let mut gate = format!(
        "EXCLUDED.{version_key} > {target}.{version_key} OR {target}.{version_key} IS NULL"
    );
    if table.has_nullified_flag {
        gate.push_str(" OR EXCLUDED.is_nullified");
    }

    format!(
        "INSERT INTO {target} ({cols}) \
         SELECT {cols} FROM {staging} \
         ON CONFLICT ({pk}) DO UPDATE SET {assignments} \
         WHERE {gate}",
        assignments = assignments.join(", ")
    )
}

/// Master merge that also records which safetyreportids actually applied
/// (fresh insert or gate-passing update) for child-row replacement.
fn build_master_merge_sql(staging: &str) -> String {
    let merge = build_merge_sql(&schema::ICSR_MASTER, staging);
    format!(
        "WITH merged AS ({merge} RETURNING {target}.safetyreportid) \
         INSERT INTO {applied} (safetyreportid) \
         SELECT safetyreportid FROM merged \
         ON CONFLICT (safetyreportid) DO NOTHING",
        target = schema::ICSR_MASTER.name,
        applied = APPLIED_REPORTS,
    )
}

fn build_child_delete_sql(table: &TableDef) -> String {
    format!(
        "DELETE FROM {} WHERE safetyreportid IN (SELECT safetyreportid FROM {})",
        table.name, APPLIED_REPORTS
    )
}

fn build_child_insert_sql(table: &TableDef, staging: &str) -> String {
    let cols = table.columns.join(", ");
    let pk = table.primary_key.join(", ");
    format!(
        "INSERT INTO {target} ({cols}) \
         SELECT {cols} FROM {staging} \
         WHERE safetyreportid IN (SELECT safetyreportid FROM {applied}) \
         ON CONFLICT ({pk}) DO NOTHING",
        target = table.name,
        applied = APPLIED_REPORTS,
    )
}
