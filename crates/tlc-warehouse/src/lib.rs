//! Postgres side of a monthly load: table DDL, staging COPY, row-key
//! annotation and the conflict-safe merge into the append-only target.

use std::path::Path;
use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::Connection;
use thiserror::Error;
use tlc_core::{ExtractDescriptor, TaxiSchema};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "tlc-warehouse";

const COPY_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("staging load into {table} failed: {message}")]
    StagingLoad { table: &'static str, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl WarehouseError {
    fn staging(schema: &TaxiSchema, message: impl Into<String>) -> Self {
        WarehouseError::StagingLoad {
            table: schema.staging_table,
            message: message.into(),
        }
    }
}

/// Row counts of one database phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub rows_staged: u64,
    pub rows_annotated: u64,
    pub rows_inserted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRole {
    Target,
    Staging,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the discrete settings.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "ny_taxi".to_string(),
            user: "root".to_string(),
            password: "root".to_string(),
            max_connections: 2,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, WarehouseError> {
        if let Some(url) = &self.url {
            return Ok(PgConnectOptions::from_str(url)?);
        }
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password))
    }
}

pub fn create_table_sql(schema: &TaxiSchema, role: TableRole) -> String {
    let (table, key) = match role {
        TableRole::Target => (schema.target_table, "row_key text PRIMARY KEY"),
        TableRole::Staging => (schema.staging_table, "row_key text"),
    };
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {table} ({key}, source_filename text, {columns})")
}

pub fn truncate_staging_sql(schema: &TaxiSchema) -> String {
    format!("TRUNCATE TABLE {}", schema.staging_table)
}

pub fn copy_staging_sql(schema: &TaxiSchema) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        schema.staging_table,
        schema.column_names().collect::<Vec<_>>().join(", ")
    )
}

/// Single bulk update keying every staged row. `$1` is the source filename.
pub fn annotate_sql(schema: &TaxiSchema) -> String {
    let concat = schema
        .key_columns()
        .iter()
        .map(|c| format!("COALESCE(CAST({c} AS text), '')"))
        .collect::<Vec<_>>()
        .join(" || ");
    format!(
        "UPDATE {} SET row_key = encode(sha256(convert_to({concat}, 'UTF8')), 'hex'), source_filename = $1",
        schema.staging_table
    )
}

pub fn merge_sql(schema: &TaxiSchema) -> String {
    let columns = std::iter::once("row_key")
        .chain(std::iter::once("source_filename"))
        .chain(schema.column_names())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {target} ({columns}) SELECT {columns} FROM {staging} ON CONFLICT (row_key) DO NOTHING",
        target = schema.target_table,
        staging = schema.staging_table,
    )
}

/// Validate the extract header against the category's column order.
pub fn check_header(schema: &TaxiSchema, header_line: &str) -> Result<(), WarehouseError> {
    let line = header_line
        .trim_start_matches('\u{feff}')
        .trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(WarehouseError::staging(schema, "extract has no header line"));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    let record = match reader.records().next() {
        Some(Ok(record)) => record,
        Some(Err(err)) => {
            return Err(WarehouseError::staging(schema, format!("unreadable header: {err}")))
        }
        None => return Err(WarehouseError::staging(schema, "extract has no header line")),
    };

    if record.len() != schema.columns.len() {
        return Err(WarehouseError::staging(
            schema,
            format!(
                "expected {} columns, header has {}",
                schema.columns.len(),
                record.len()
            ),
        ));
    }
    for (idx, (found, expected)) in record.iter().zip(schema.column_names()).enumerate() {
        if !found.trim().eq_ignore_ascii_case(expected) {
            return Err(WarehouseError::staging(
                schema,
                format!("column {} is {found:?}, expected {expected:?}", idx + 1),
            ));
        }
    }
    Ok(())
}

/// Create target and staging tables if absent.
pub async fn ensure_schema(conn: &mut PgConnection, schema: &TaxiSchema) -> Result<(), WarehouseError> {
    for role in [TableRole::Target, TableRole::Staging] {
        sqlx::query(&create_table_sql(schema, role))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Truncate the staging table and COPY the extract into it, header skipped.
pub async fn stage_file(
    conn: &mut PgConnection,
    schema: &TaxiSchema,
    path: &Path,
) -> Result<u64, WarehouseError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|err| WarehouseError::staging(schema, format!("opening {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut header = String::new();
    reader
        .read_line(&mut header)
        .await
        .map_err(|err| WarehouseError::staging(schema, format!("reading header: {err}")))?;
    check_header(schema, &header)?;

    sqlx::query(&truncate_staging_sql(schema))
        .execute(&mut *conn)
        .await?;

    let mut copy = conn.copy_in_raw(&copy_staging_sql(schema)).await?;
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                let message = format!("reading {}: {err}", path.display());
                let _ = copy.abort(message.clone()).await;
                return Err(WarehouseError::staging(schema, message));
            }
        };
        copy.send(&buf[..n]).await?;
    }
    copy.finish().await.map_err(|err| copy_error(schema, err))
}

/// A data exception raised while COPYing means the extract does not fit the
/// staging table.
fn copy_error(schema: &TaxiSchema, err: sqlx::Error) -> WarehouseError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().is_some_and(|code| code.starts_with("22")) {
            return WarehouseError::staging(schema, db.message().to_string());
        }
    }
    WarehouseError::Database(err)
}

pub async fn annotate_staging(
    conn: &mut PgConnection,
    schema: &TaxiSchema,
    source_filename: &str,
) -> Result<u64, WarehouseError> {
    let sql = annotate_sql(schema);
    let result = sqlx::query(&sql)
        .bind(source_filename)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Insert staged rows whose `row_key` is not yet in the target.
pub async fn merge_into_target(conn: &mut PgConnection, schema: &TaxiSchema) -> Result<u64, WarehouseError> {
    let sql = merge_sql(schema);
    let result = sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Ensure schema, stage, annotate and merge inside one transaction on `conn`.
/// Any error drops the transaction, which rolls it back.
pub async fn load_and_merge_on(
    conn: &mut PgConnection,
    descriptor: &ExtractDescriptor,
    extract_path: &Path,
) -> Result<MergeReport, WarehouseError> {
    let schema = descriptor.schema();
    let filename = descriptor.filename();
    let mut tx = conn.begin().await?;

    info!(table = schema.target_table, "ensuring tables");
    ensure_schema(&mut tx, schema).await?;

    info!(table = schema.staging_table, path = %extract_path.display(), "staging extract");
    let rows_staged = stage_file(&mut tx, schema, extract_path).await?;

    let rows_annotated = annotate_staging(&mut tx, schema, &filename).await?;
    info!(rows_staged, rows_annotated, "staged rows keyed");

    let rows_inserted = merge_into_target(&mut tx, schema).await?;
    tx.commit().await?;
    info!(rows_inserted, table = schema.target_table, "merge committed");

    Ok(MergeReport {
        rows_staged,
        rows_annotated,
        rows_inserted,
    })
}

#[derive(Debug, Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
}

impl PostgresWarehouse {
    /// Builds the pool without connecting; the first statement opens it.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_lazy_with(config.connect_options()?);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self, schema: &TaxiSchema) -> Result<(), WarehouseError> {
        let mut tx = self.pool.begin().await?;
        ensure_schema(&mut tx, schema).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_and_merge(
        &self,
        descriptor: &ExtractDescriptor,
        extract_path: &Path,
    ) -> Result<MergeReport, WarehouseError> {
        let span = info_span!(
            "warehouse_load",
            category = %descriptor.category,
            period = %descriptor.period,
        );
        async {
            let mut conn = self.pool.acquire().await?;
            load_and_merge_on(&mut conn, descriptor, extract_path).await
        }
        .instrument(span)
        .await
    }
}
