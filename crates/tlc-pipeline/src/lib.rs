//! Monthly load-and-merge job: validates the request, fetches the extract,
//! hands it to the warehouse and reports a structured outcome. Also wires the
//! monthly cron schedules.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tlc_core::{run_key, Category, ExtractDescriptor, Period, UnsupportedCategoryError};
use tlc_storage::{DownloadError, ExtractFetcher, ExtractStore, FetchedExtract, HttpClientConfig};
use tlc_warehouse::{DatabaseConfig, MergeReport, PostgresWarehouse, WarehouseError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tlc-pipeline";

pub const DEFAULT_SOURCE_BASE_URL: &str =
    "https://github.com/DataTalksClub/nyc-tlc-data/releases/download";

pub const DEFAULT_SCHEDULE_TZ: &str = "Asia/Ho_Chi_Minh";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_base_url: String,
    pub storage_dir: PathBuf,
    pub database: DatabaseConfig,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
    pub scheduler_enabled: bool,
    pub green_cron: String,
    pub yellow_cron: String,
    /// IANA zone the crons fire in; also decides which month a trigger loads.
    pub schedule_tz: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            source_base_url: lookup("TLC_SOURCE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SOURCE_BASE_URL.to_string()),
            storage_dir: lookup("TLC_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./storage")),
            database: DatabaseConfig {
                url: lookup("DATABASE_URL"),
                host: lookup("POSTGRES_HOST").unwrap_or(defaults.host),
                port: lookup("POSTGRES_PORT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.port),
                database: lookup("POSTGRES_DB").unwrap_or(defaults.database),
                user: lookup("POSTGRES_USER").unwrap_or(defaults.user),
                password: lookup("POSTGRES_PASSWORD").unwrap_or(defaults.password),
                max_connections: defaults.max_connections,
            },
            user_agent: lookup("TLC_USER_AGENT").unwrap_or_else(|| "tlc-loader/0.1".to_string()),
            http_timeout_secs: lookup("TLC_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            scheduler_enabled: lookup("TLC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            green_cron: lookup("TLC_GREEN_CRON").unwrap_or_else(|| "0 0 9 1 * *".to_string()),
            yellow_cron: lookup("TLC_YELLOW_CRON").unwrap_or_else(|| "0 0 10 1 * *".to_string()),
            schedule_tz: lookup("TLC_SCHEDULE_TZ").unwrap_or_else(|| DEFAULT_SCHEDULE_TZ.to_string()),
        }
    }

    pub fn schedules(&self) -> [(Category, &str); 2] {
        [
            (Category::Green, self.green_cron.as_str()),
            (Category::Yellow, self.yellow_cron.as_str()),
        ]
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    UnsupportedCategory(#[from] UnsupportedCategoryError),
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("staging load into {table} failed: {message}")]
    StagingLoad { table: &'static str, message: String },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::UnsupportedCategory(_) => "unsupported_category",
            JobError::Download(_) => "download",
            JobError::StagingLoad { .. } => "staging_load",
            JobError::Database(_) => "database",
        }
    }
}

impl From<WarehouseError> for JobError {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::StagingLoad { table, message } => JobError::StagingLoad { table, message },
            WarehouseError::Database(err) => JobError::Database(err),
        }
    }
}

/// Where monthly extracts come from.
#[async_trait]
pub trait ExtractSource: Send + Sync {
    async fn fetch(&self, descriptor: &ExtractDescriptor) -> Result<FetchedExtract, DownloadError>;
}

/// Where fetched extracts are merged.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_schema(&self, category: Category) -> Result<(), WarehouseError>;

    async fn load_and_merge(
        &self,
        descriptor: &ExtractDescriptor,
        extract: &FetchedExtract,
    ) -> Result<MergeReport, WarehouseError>;
}

#[async_trait]
impl ExtractSource for ExtractFetcher {
    async fn fetch(&self, descriptor: &ExtractDescriptor) -> Result<FetchedExtract, DownloadError> {
        ExtractFetcher::fetch(self, descriptor).await
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn ensure_schema(&self, category: Category) -> Result<(), WarehouseError> {
        PostgresWarehouse::ensure_schema(self, category.schema()).await
    }

    async fn load_and_merge(
        &self,
        descriptor: &ExtractDescriptor,
        extract: &FetchedExtract,
    ) -> Result<MergeReport, WarehouseError> {
        PostgresWarehouse::load_and_merge(self, descriptor, &extract.path).await
    }
}

/// Parameters supplied by whoever triggers a run. The category stays a raw
/// string so it is validated by the job itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub category: String,
    pub period: Period,
}

impl RunRequest {
    pub fn new(category: impl Into<String>, period: Period) -> Self {
        Self {
            category: category.into(),
            period,
        }
    }

    pub fn run_key(&self) -> String {
        run_key(&self.category, self.period)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded { rows_staged: u64, rows_inserted: u64 },
    Failed { error_kind: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub run_key: String,
    pub category: String,
    pub period: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RunStatus,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded { .. })
    }

    pub fn rows_inserted(&self) -> Option<u64> {
        match self.status {
            RunStatus::Succeeded { rows_inserted, .. } => Some(rows_inserted),
            RunStatus::Failed { .. } => None,
        }
    }
}

/// One async lock per category: the staging table is shared scratch space, so
/// runs for the same category must not interleave.
#[derive(Debug, Default)]
struct CategoryLocks {
    locks: Mutex<HashMap<Category, Arc<Mutex<()>>>>,
}

impl CategoryLocks {
    async fn acquire(&self, category: Category) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(category).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct MonthlyLoadJob {
    source: Arc<dyn ExtractSource>,
    warehouse: Arc<dyn Warehouse>,
    locks: CategoryLocks,
}

impl MonthlyLoadJob {
    pub fn new(source: Arc<dyn ExtractSource>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            source,
            warehouse,
            locks: CategoryLocks::default(),
        }
    }

    /// Builds the HTTP fetcher and a lazily-connecting Postgres warehouse;
    /// no network or database traffic happens here.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let fetcher = ExtractFetcher::new(
            HttpClientConfig {
                timeout: config.http_timeout_secs.map(Duration::from_secs),
                user_agent: Some(config.user_agent.clone()),
            },
            config.source_base_url.clone(),
            ExtractStore::new(config.storage_dir.clone()),
        )?;
        let warehouse =
            PostgresWarehouse::connect_lazy(&config.database).context("configuring postgres pool")?;
        Ok(Self::new(Arc::new(fetcher), Arc::new(warehouse)))
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Validate, fetch, then load and merge. Errors are terminal; nothing is
    /// retried here.
    pub async fn execute(&self, category: &str, period: Period) -> Result<MergeReport, JobError> {
        let category: Category = category.parse()?;
        let descriptor = ExtractDescriptor::new(category, period);
        let _guard = self.locks.acquire(category).await;

        let extract = self.source.fetch(&descriptor).await?;
        info!(path = %extract.path.display(), bytes = extract.byte_size, "extract ready");

        let report = self.warehouse.load_and_merge(&descriptor, &extract).await?;
        Ok(report)
    }

    pub async fn run(&self, request: &RunRequest) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let run_key = request.run_key();
        let started_at = Utc::now();
        let span = info_span!("monthly_load", %run_id, run_key = %run_key);

        let result = self
            .execute(&request.category, request.period)
            .instrument(span.clone())
            .await;

        let status = match result {
            Ok(report) => {
                span.in_scope(|| {
                    info!(
                        rows_staged = report.rows_staged,
                        rows_inserted = report.rows_inserted,
                        "run succeeded"
                    )
                });
                RunStatus::Succeeded {
                    rows_staged: report.rows_staged,
                    rows_inserted: report.rows_inserted,
                }
            }
            Err(err) => {
                span.in_scope(|| warn!(error_kind = err.kind(), error = %err, "run failed"));
                RunStatus::Failed {
                    error_kind: err.kind().to_string(),
                    message: err.to_string(),
                }
            }
        };

        RunOutcome {
            run_id,
            run_key,
            category: request.category.clone(),
            period: request.period.to_string(),
            started_at,
            finished_at: Utc::now(),
            status,
        }
    }
}

/// Register one monthly job per category. Each trigger loads the year-month
/// of the trigger time in the schedule's zone.
pub async fn build_scheduler(job: Arc<MonthlyLoadJob>, config: &PipelineConfig) -> Result<JobScheduler> {
    let tz: Tz = config
        .schedule_tz
        .parse()
        .map_err(|err| anyhow!("unknown schedule time zone {:?}: {err}", config.schedule_tz))?;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (category, cron) in config.schedules() {
        let job = Arc::clone(&job);
        let scheduled = Job::new_async_tz(cron, tz, move |_uuid, _lock| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                let period = match Period::from_datetime(&Utc::now().with_timezone(&tz)) {
                    Ok(period) => period,
                    Err(err) => {
                        warn!(%category, %err, "skipping scheduled run");
                        return;
                    }
                };
                let request = RunRequest::new(category.as_str(), period);
                let outcome = job.run(&request).await;
                match serde_json::to_string(&outcome) {
                    Ok(line) => info!(outcome = %line, "scheduled run finished"),
                    Err(err) => warn!(%err, "serializing run outcome"),
                }
            })
        })
        .with_context(|| format!("creating {category} job for cron {cron}"))?;
        sched.add(scheduled).await.context("adding scheduler job")?;
        info!(%category, cron, %tz, "monthly schedule registered");
    }
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    job: Arc<MonthlyLoadJob>,
    config: &PipelineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(job, config).await.map(Some)
}

pub async fn run_once_from_env(category: &str, period: Period) -> Result<RunOutcome> {
    let config = PipelineConfig::from_env();
    let job = MonthlyLoadJob::from_config(&config)?;
    Ok(job.run(&RunRequest::new(category, period)).await)
}
