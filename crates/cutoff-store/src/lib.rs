//! Record-store access for cutoff data: the `RankStore` seam, a retrying HTTP
//! transport, the PocketBase client and an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cutoff_core::{BackupDescriptor, Branch, College, NewBranch, RankKey, RankRecord};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

mod memory;
mod pocketbase;

pub use memory::{Fault, MemoryStore};
pub use pocketbase::{parse_store_timestamp, quote_filter_value, PocketbaseClient};

pub const CRATE_NAME: &str = "cutoff-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding {what}: {message}")]
    Decode { what: String, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("store rejected the operation: {0}")]
    Rejected(String),
    #[error("request limiter closed")]
    Closed,
}

impl StoreError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub(crate) fn decode(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            what: what.into(),
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD seam over the remote record store.
///
/// `list_ranks` returns records sorted newest `(year, round)` first with the
/// college and branch of every record resolved.
#[async_trait]
pub trait RankStore: Send + Sync {
    async fn list_colleges(&self) -> StoreResult<Vec<College>>;
    async fn list_branches(&self) -> StoreResult<Vec<Branch>>;
    async fn list_ranks(&self) -> StoreResult<Vec<RankRecord>>;

    async fn get_college(&self, id: &str) -> StoreResult<Option<College>>;
    async fn get_branch(&self, id: &str) -> StoreResult<Option<Branch>>;
    async fn find_rank(&self, key: &RankKey) -> StoreResult<Option<RankRecord>>;

    async fn create_branch(&self, branch: &NewBranch) -> StoreResult<Branch>;
    /// Inserts `record` and returns it with the store-assigned id.
    async fn create_rank(&self, record: &RankRecord) -> StoreResult<RankRecord>;

    async fn list_backups(&self) -> StoreResult<Vec<BackupDescriptor>>;
    async fn delete_backup(&self, key: &str) -> StoreResult<()>;
    async fn create_backup(&self, name: &str) -> StoreResult<()>;
}

#[async_trait]
impl<S: RankStore + ?Sized> RankStore for Arc<S> {
    async fn list_colleges(&self) -> StoreResult<Vec<College>> {
        (**self).list_colleges().await
    }
    async fn list_branches(&self) -> StoreResult<Vec<Branch>> {
        (**self).list_branches().await
    }
    async fn list_ranks(&self) -> StoreResult<Vec<RankRecord>> {
        (**self).list_ranks().await
    }
    async fn get_college(&self, id: &str) -> StoreResult<Option<College>> {
        (**self).get_college(id).await
    }
    async fn get_branch(&self, id: &str) -> StoreResult<Option<Branch>> {
        (**self).get_branch(id).await
    }
    async fn find_rank(&self, key: &RankKey) -> StoreResult<Option<RankRecord>> {
        (**self).find_rank(key).await
    }
    async fn create_branch(&self, branch: &NewBranch) -> StoreResult<Branch> {
        (**self).create_branch(branch).await
    }
    async fn create_rank(&self, record: &RankRecord) -> StoreResult<RankRecord> {
        (**self).create_rank(record).await
    }
    async fn list_backups(&self) -> StoreResult<Vec<BackupDescriptor>> {
        (**self).list_backups().await
    }
    async fn delete_backup(&self, key: &str) -> StoreResult<()> {
        (**self).delete_backup(key).await
    }
    async fn create_backup(&self, name: &str) -> StoreResult<()> {
        (**self).create_backup(name).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Page size for college/branch listings; large enough for one call.
    pub list_page_size: u32,
    /// Page size for rank listings; further pages are fetched concurrently.
    pub rank_page_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            admin_email: None,
            admin_password: None,
            timeout: Duration::from_secs(20),
            user_agent: Some("cutoff-bot/0.1".to_string()),
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
            list_page_size: 10_000,
            rank_page_size: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("CUTOFF_BASE_URL").unwrap_or(defaults.base_url),
            admin_email: std::env::var("CUTOFF_ADMIN_EMAIL")
                .ok()
                .filter(|v| !v.is_empty()),
            admin_password: std::env::var("CUTOFF_ADMIN_PASSWORD")
                .ok()
                .filter(|v| !v.is_empty()),
            timeout: std::env::var("CUTOFF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("CUTOFF_USER_AGENT")
                .ok()
                .or(defaults.user_agent),
            ..defaults
        }
    }
}

/// Shared reqwest client with a global request limit and retry policy.
///
/// Only idempotent requests are retried; callers say which ones are.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends the request produced by `build`, rebuilding it for each retry.
    pub async fn execute<F>(&self, retryable: bool, build: F) -> StoreResult<Vec<u8>>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = self.limit.acquire().await.map_err(|_| StoreError::Closed)?;
        let mut attempt = 0usize;

        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if retryable
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, status = status.as_u16(), attempt, "retrying store request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body: truncate_body(body),
                    });
                }
                Err(err) => {
                    if retryable
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying store request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }
    }

    /// Plain GET of an arbitrary URL, e.g. an uploaded attachment.
    pub async fn fetch_bytes(&self, url: &str) -> StoreResult<Vec<u8>> {
        self.execute(true, |client| client.get(url)).await
    }
}

fn truncate_body(mut body: String) -> String {
    const MAX: usize = 512;
    if body.len() > MAX {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_retry() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn long_error_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        let out = truncate_body(body);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 515);
    }

    #[test]
    fn status_is_exposed_for_http_failures() {
        let err = StoreError::HttpStatus {
            status: 401,
            url: "http://x".into(),
            body: String::new(),
        };
        assert_eq!(err.status(), Some(401));
        assert_eq!(StoreError::Closed.status(), None);
    }
}
