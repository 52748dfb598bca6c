//! Ingestion orchestration: upload, backup, snapshot, parse, persist.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cutoff_core::Branch;
use cutoff_parse::{
    parse_batch, read_header, upload_reader, BatchTarget, HeaderError, ReferenceIndex, RowParseError,
    RowParser,
};
use cutoff_store::{HttpTransport, PocketbaseClient, RankStore, StoreConfig, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

mod backup;
mod upsert;

pub use backup::{
    backup_name, oldest_backup, sanitize_actor, BackupError, BackupGuard, BackupReport, BackupStage,
    BACKUP_TIMESTAMP_FORMAT, DEFAULT_BACKUP_CAP,
};
pub use upsert::{
    upsert_one, Persisted, UpsertExecutor, UpsertFailure, UpsertReport, DEFAULT_UPSERT_CONCURRENCY,
};

pub const CRATE_NAME: &str = "cutoff-sync";

pub const DEFAULT_ERROR_REPORT_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub store: StoreConfig,
    pub upsert_concurrency: usize,
    pub backup_cap: usize,
    pub error_report_limit: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            upsert_concurrency: DEFAULT_UPSERT_CONCURRENCY,
            backup_cap: DEFAULT_BACKUP_CAP,
            error_report_limit: DEFAULT_ERROR_REPORT_LIMIT,
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig::from_env(),
            upsert_concurrency: env_usize("CUTOFF_UPSERT_CONCURRENCY", DEFAULT_UPSERT_CONCURRENCY),
            backup_cap: env_usize("CUTOFF_BACKUP_CAP", DEFAULT_BACKUP_CAP),
            error_report_limit: env_usize("CUTOFF_ERROR_REPORT_LIMIT", DEFAULT_ERROR_REPORT_LIMIT),
        }
    }
}

/// Where the uploaded CSV comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    Path(PathBuf),
    /// Attachment URL, fetched with the store transport's retry policy.
    Url(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub actor: String,
    pub target: BatchTarget,
    pub upload: UploadSource,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("could not read upload {path}: {source}")]
    UploadRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not fetch upload {url}: {source}")]
    UploadFetch {
        url: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("backup failed, nothing was ingested: {0}")]
    Backup(#[from] BackupError),
    #[error("could not load colleges and branches: {0}")]
    Snapshot(#[source] StoreError),
    #[error("Invalid {field} format")]
    InvalidParameter { field: &'static str, value: String },
}

/// Validates the textual year and round of an ingest command.
pub fn parse_target(year: &str, round: &str) -> Result<BatchTarget, IngestError> {
    let parse = |field: &'static str, raw: &str| {
        raw.trim().parse::<u32>().map_err(|_| IngestError::InvalidParameter {
            field,
            value: raw.to_string(),
        })
    };
    Ok(BatchTarget {
        year: parse("year", year)?,
        round: parse("round", round)?,
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub actor: String,
    pub target: BatchTarget,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub upload_sha256: String,
    pub backup: BackupReport,
    pub parsed_rows: usize,
    pub created_branches: Vec<Branch>,
    pub row_errors: Vec<RowParseError>,
    /// Set when a stream failure cut the upload short.
    pub truncated: bool,
    pub upsert: UpsertReport,
}

impl IngestSummary {
    pub fn is_success(&self) -> bool {
        self.row_errors.is_empty() && self.upsert.is_success()
    }

    /// First `limit` row errors as `Line Number:` blocks; empty when none.
    pub fn row_error_report(&self, limit: usize) -> String {
        render_report(
            self.row_errors
                .iter()
                .map(|e| (e.file_line().to_string(), e.message())),
            self.row_errors.len(),
            limit,
        )
    }

    pub fn upsert_failure_report(&self, limit: usize) -> String {
        render_report(
            self.upsert.failures.iter().map(|f| {
                (
                    format!("{} ({} / {})", f.key, f.college_name, f.branch_code),
                    f.error.clone(),
                )
            }),
            self.upsert.failures.len(),
            limit,
        )
    }
}

fn render_report<I>(entries: I, total: usize, limit: usize) -> String
where
    I: Iterator<Item = (String, String)>,
{
    let mut out = String::new();
    if total > limit {
        let _ = writeln!(out, "First {limit} errors out of {total}:");
    }
    for (location, message) in entries.take(limit) {
        let _ = writeln!(out, "Line Number: {location}\n{message}\n");
    }
    out
}

/// Runs ingestion against any `RankStore`.
pub struct IngestPipeline<S: RankStore + 'static> {
    store: Arc<S>,
    config: IngestConfig,
}

impl<S: RankStore + 'static> IngestPipeline<S> {
    pub fn new(store: Arc<S>, config: IngestConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub async fn run(&self, request: IngestRequest) -> Result<IngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, actor = %request.actor);
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: IngestRequest) -> Result<IngestSummary, IngestError> {
        let started_at = Utc::now();
        let bytes = self.load_upload(&request.upload).await?;
        let upload_sha256 = sha256_hex(&bytes);
        info!(bytes = bytes.len(), sha256 = %upload_sha256, year = request.target.year, round = request.target.round, "upload loaded");

        let mut reader = upload_reader(bytes.as_slice());
        read_header(&mut reader)?;

        let backup = BackupGuard::new(self.config.backup_cap)
            .secure(self.store.as_ref(), &request.actor, started_at)
            .await?;

        let (colleges, branches) = tokio::try_join!(self.store.list_colleges(), self.store.list_branches())
            .map_err(IngestError::Snapshot)?;
        info!(colleges = colleges.len(), branches = branches.len(), "reference snapshot loaded");

        let mut index = ReferenceIndex::new(colleges, branches);
        let outcome = {
            let mut parser = RowParser::new(&mut index, self.store.as_ref(), request.target);
            parse_batch(&mut reader, &mut parser).await
        };
        info!(
            parsed = outcome.ranks.len(),
            rejected = outcome.errors.len(),
            created_branches = index.created_branches().len(),
            "upload parsed"
        );

        let parsed_rows = outcome.ranks.len();
        let upsert = UpsertExecutor::new(self.config.upsert_concurrency)
            .persist(Arc::clone(&self.store), outcome.ranks)
            .await;

        Ok(IngestSummary {
            run_id,
            actor: request.actor,
            target: request.target,
            started_at,
            finished_at: Utc::now(),
            upload_sha256,
            backup,
            parsed_rows,
            created_branches: index.created_branches().to_vec(),
            row_errors: outcome.errors,
            truncated: outcome.truncated,
            upsert,
        })
    }

    async fn load_upload(&self, source: &UploadSource) -> Result<Vec<u8>, IngestError> {
        match source {
            UploadSource::Bytes(bytes) => Ok(bytes.clone()),
            UploadSource::Path(path) => tokio::fs::read(path).await.map_err(|source| IngestError::UploadRead {
                path: path.clone(),
                source,
            }),
            UploadSource::Url(url) => {
                let fetch_err = |source| IngestError::UploadFetch {
                    url: url.clone(),
                    source,
                };
                let transport = HttpTransport::new(&self.config.store).map_err(fetch_err)?;
                transport.fetch_bytes(url).await.map_err(fetch_err)
            }
        }
    }
}

/// Connects to the configured PocketBase instance and runs one ingestion.
pub async fn run_ingest_from_env(request: IngestRequest) -> anyhow::Result<IngestSummary> {
    let config = IngestConfig::from_env();
    let client = PocketbaseClient::connect(&config.store)
        .await
        .with_context(|| format!("connecting to store at {}", config.store.base_url))?;
    let pipeline = IngestPipeline::new(Arc::new(client), config);
    pipeline.run(request).await.context("ingestion aborted")
}
