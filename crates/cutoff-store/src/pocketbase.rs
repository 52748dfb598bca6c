//! PocketBase REST client.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cutoff_core::{BackupDescriptor, Branch, College, NewBranch, RankBounds, RankKey, RankRecord};
use futures::future::try_join_all;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{HttpTransport, RankStore, StoreConfig, StoreError, StoreResult};

const COLLEGES: &str = "colleges";
const BRANCHES: &str = "branches";
const RANKS: &str = "ranks";
const RANK_SORT: &str = "-year,-round";
const RANK_EXPAND: &str = "college,branch";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage<T> {
    items: Vec<T>,
    #[serde(default)]
    per_page: u32,
    #[serde(default)]
    total_items: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct RankRow {
    id: String,
    year: u32,
    round: u32,
    #[serde(default)]
    jee_open: u32,
    #[serde(default)]
    jee_close: u32,
    #[serde(default)]
    dasa_open: u32,
    #[serde(default)]
    dasa_close: u32,
    college: String,
    branch: String,
    #[serde(default)]
    expand: Option<RankExpand>,
}

#[derive(Debug, Clone, Deserialize)]
struct RankExpand {
    college: Option<College>,
    branch: Option<Branch>,
}

impl RankRow {
    fn into_record(self) -> StoreResult<RankRecord> {
        let expand = self.expand.unwrap_or(RankExpand {
            college: None,
            branch: None,
        });
        let college = expand.college.ok_or_else(|| {
            StoreError::decode(
                format!("rank {}", self.id),
                format!("college {} was not expanded", self.college),
            )
        })?;
        let branch = expand.branch.ok_or_else(|| {
            StoreError::decode(
                format!("rank {}", self.id),
                format!("branch {} was not expanded", self.branch),
            )
        })?;
        Ok(RankRecord {
            id: Some(self.id),
            year: self.year,
            round: self.round,
            primary: RankBounds::new(self.jee_open, self.jee_close),
            secondary: RankBounds::new(self.dasa_open, self.dasa_close),
            college,
            branch,
        })
    }
}

#[derive(Debug, Serialize)]
struct RankCreate<'a> {
    year: u32,
    round: u32,
    jee_open: u32,
    jee_close: u32,
    dasa_open: u32,
    dasa_close: u32,
    college: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BackupRow {
    key: String,
    modified: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Serialize)]
struct PasswordAuth<'a> {
    identity: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct BackupCreate<'a> {
    name: &'a str,
}

/// Client for a PocketBase instance holding `colleges`, `branches` and
/// `ranks` collections.
#[derive(Debug)]
pub struct PocketbaseClient {
    transport: HttpTransport,
    base_url: String,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
    list_page_size: u32,
    rank_page_size: u32,
}

impl PocketbaseClient {
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        let credentials = match (&config.admin_email, &config.admin_password) {
            (Some(email), Some(password)) => Some((email.clone(), password.clone())),
            _ => None,
        };
        Ok(Self {
            transport: HttpTransport::new(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
            list_page_size: config.list_page_size.max(1),
            rank_page_size: config.rank_page_size.max(1),
        })
    }

    /// Builds the client and signs in when credentials are configured.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let client = Self::new(config)?;
        if client.credentials.is_some() {
            client.authenticate().await?;
        }
        Ok(client)
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    pub async fn authenticate(&self) -> StoreResult<()> {
        let Some((email, password)) = &self.credentials else {
            return Err(StoreError::Auth("no admin credentials configured".into()));
        };
        let url = self.endpoint("/api/collections/_superusers/auth-with-password");
        let body = PasswordAuth {
            identity: email,
            password,
        };
        let bytes = self
            .transport
            .execute(false, |client| client.post(&url).json(&body))
            .await
            .map_err(|err| StoreError::Auth(err.to_string()))?;
        let auth: AuthResponse =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::decode("auth response", e))?;
        *self.token.write().await = Some(auth.token);
        info!(base_url = %self.base_url, "authenticated against record store");
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn records_path(collection: &str) -> String {
        format!("/api/collections/{collection}/records")
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> StoreResult<Vec<u8>> {
        let token = self.token.read().await.clone();
        let retryable = *method == Method::GET || *method == Method::DELETE;
        self.transport
            .execute(retryable, |client| {
                let mut req = client.request(method.clone(), url).query(query);
                if let Some(token) = &token {
                    req = req.header(reqwest::header::AUTHORIZATION, token);
                }
                if let Some(body) = body {
                    req = req.json(body);
                }
                req
            })
            .await
    }

    /// Sends a request, re-authenticating once when the token has expired.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> StoreResult<Vec<u8>> {
        let url = self.endpoint(path);
        debug!(%method, %url, "store request");
        match self.send_once(&method, &url, query, body.as_ref()).await {
            Err(err) if err.status() == Some(401) && self.credentials.is_some() => {
                self.authenticate().await?;
                self.send_once(&method, &url, query, body.as_ref()).await
            }
            other => other,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> StoreResult<T> {
        let bytes = self.send(Method::GET, path, query, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::decode(path, e))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> StoreResult<T> {
        let body = serde_json::to_value(body).map_err(|e| StoreError::decode(path, e))?;
        let bytes = self.send(Method::POST, path, query, Some(body)).await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::decode(path, e))
    }

    async fn get_by_id<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> StoreResult<Option<T>> {
        let path = format!("{}/{}", Self::records_path(collection), id);
        match self.get_json(&path, &[]).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_page<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        per_page: u32,
        page: u32,
        extra: &[(&str, &str)],
    ) -> StoreResult<ListPage<T>> {
        let mut query = vec![("perPage", per_page.to_string()), ("page", page.to_string())];
        query.extend(extra.iter().map(|(name, value)| (*name, value.to_string())));
        self.get_json(&Self::records_path(collection), &query).await
    }

    /// Every record of `collection`, fetching the pages after the first concurrently.
    async fn list_all<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        per_page: u32,
        extra: &[(&str, &str)],
    ) -> StoreResult<Vec<T>> {
        let first: ListPage<T> = self.list_page(collection, per_page, 1, extra).await?;
        let pages = page_count(first.total_items, first.per_page, per_page);

        let mut items = first.items;
        if pages > 1 {
            let rest = try_join_all(
                (2..=pages).map(|page| self.list_page::<T>(collection, per_page, page, extra)),
            )
            .await?;
            for page in rest {
                items.extend(page.items);
            }
        }
        debug!(collection, items = items.len(), pages, "listed records");
        Ok(items)
    }
}

/// Pages needed for `total_items`. A zero `per_page` from the server means
/// the requested size was used.
fn page_count(total_items: u32, per_page: u32, requested: u32) -> u32 {
    let per_page = if per_page == 0 { requested.max(1) } else { per_page };
    total_items.div_ceil(per_page)
}

/// Converts listed rows, dropping any whose relations were not expanded.
fn rows_into_records(rows: Vec<RankRow>) -> Vec<RankRecord> {
    rows.into_iter()
        .filter_map(|row| match row.into_record() {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(error = %err, "skipping rank without expanded relations");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RankStore for PocketbaseClient {
    async fn list_colleges(&self) -> StoreResult<Vec<College>> {
        self.list_all(COLLEGES, self.list_page_size, &[]).await
    }

    async fn list_branches(&self) -> StoreResult<Vec<Branch>> {
        self.list_all(BRANCHES, self.list_page_size, &[]).await
    }

    async fn list_ranks(&self) -> StoreResult<Vec<RankRecord>> {
        let rows: Vec<RankRow> = self
            .list_all(
                RANKS,
                self.rank_page_size,
                &[("expand", RANK_EXPAND), ("sort", RANK_SORT)],
            )
            .await?;
        Ok(rows_into_records(rows))
    }

    async fn get_college(&self, id: &str) -> StoreResult<Option<College>> {
        self.get_by_id(COLLEGES, id).await
    }

    async fn get_branch(&self, id: &str) -> StoreResult<Option<Branch>> {
        self.get_by_id(BRANCHES, id).await
    }

    async fn find_rank(&self, key: &RankKey) -> StoreResult<Option<RankRecord>> {
        let filter = format!(
            "year={} && round={} && college.id={} && branch.id={} && branch.ciwg={}",
            key.year,
            key.round,
            quote_filter_value(&key.college_id),
            quote_filter_value(&key.branch_id),
            key.ciwg
        );
        let page: ListPage<RankRow> = self
            .get_json(
                &Self::records_path(RANKS),
                &[
                    ("filter", filter),
                    ("perPage", "1".to_string()),
                    ("expand", RANK_EXPAND.to_string()),
                ],
            )
            .await?;
        page.items
            .into_iter()
            .next()
            .map(RankRow::into_record)
            .transpose()
    }

    async fn create_branch(&self, branch: &NewBranch) -> StoreResult<Branch> {
        self.post_json(&Self::records_path(BRANCHES), &[], branch)
            .await
    }

    async fn create_rank(&self, record: &RankRecord) -> StoreResult<RankRecord> {
        let body = RankCreate {
            year: record.year,
            round: record.round,
            jee_open: record.primary.open,
            jee_close: record.primary.close,
            dasa_open: record.secondary.open,
            dasa_close: record.secondary.close,
            college: &record.college.id,
            branch: &record.branch.id,
        };
        let created: CreatedRow = self
            .post_json(&Self::records_path(RANKS), &[], &body)
            .await?;
        Ok(RankRecord {
            id: Some(created.id),
            ..record.clone()
        })
    }

    async fn list_backups(&self) -> StoreResult<Vec<BackupDescriptor>> {
        let rows: Vec<BackupRow> = self.get_json("/api/backups", &[]).await?;
        rows.into_iter()
            .map(|row| {
                let modified = parse_store_timestamp(&row.modified).ok_or_else(|| {
                    StoreError::decode(
                        format!("backup {}", row.key),
                        format!("unrecognized timestamp {:?}", row.modified),
                    )
                })?;
                Ok(BackupDescriptor {
                    key: row.key,
                    modified,
                    size: row.size,
                })
            })
            .collect()
    }

    async fn delete_backup(&self, key: &str) -> StoreResult<()> {
        self.send(Method::DELETE, &format!("/api/backups/{key}"), &[], None)
            .await?;
        Ok(())
    }

    async fn create_backup(&self, name: &str) -> StoreResult<()> {
        let body = serde_json::to_value(BackupCreate { name })
            .map_err(|e| StoreError::decode("backup create", e))?;
        self.send(Method::POST, "/api/backups", &[], Some(body))
            .await?;
        Ok(())
    }
}

/// Quotes a value for a PocketBase filter expression.
pub fn quote_filter_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Accepts RFC 3339 and PocketBase's `2024-05-18 10:00:00.123Z` form.
pub fn parse_store_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|ts| ts.and_utc())
}
