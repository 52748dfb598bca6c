//! Bounded-concurrency idempotent persistence of parsed rank records.

use std::collections::HashSet;
use std::sync::Arc;

use cutoff_core::{RankKey, RankRecord};
use cutoff_store::{RankStore, StoreResult};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const DEFAULT_UPSERT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Created,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertFailure {
    pub key: RankKey,
    pub college_name: String,
    pub branch_code: String,
    pub error: String,
}

impl UpsertFailure {
    fn for_record(record: &RankRecord, error: String) -> Self {
        Self {
            key: record.key(),
            college_name: record.college.name.clone(),
            branch_code: record.branch.code.clone(),
            error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub attempted: usize,
    pub created: usize,
    pub skipped: usize,
    pub failures: Vec<UpsertFailure>,
}

impl UpsertReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Looks the record up by its composite key and creates it only when absent.
pub async fn upsert_one<S: RankStore + ?Sized>(store: &S, record: &RankRecord) -> StoreResult<Persisted> {
    if store.find_rank(&record.key()).await?.is_some() {
        return Ok(Persisted::Skipped);
    }
    store.create_rank(record).await?;
    Ok(Persisted::Created)
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertExecutor {
    concurrency: usize,
}

impl Default for UpsertExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_UPSERT_CONCURRENCY)
    }
}

impl UpsertExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawns one task per distinct record key, at most `concurrency` of them
    /// talking to the store at once, and waits for all of them. Repeats of a
    /// key already in the batch count as skipped.
    pub async fn persist<S>(&self, store: Arc<S>, records: Vec<RankRecord>) -> UpsertReport
    where
        S: RankStore + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut report = UpsertReport {
            attempted: records.len(),
            ..UpsertReport::default()
        };
        let mut seen: HashSet<RankKey> = HashSet::with_capacity(records.len());
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            if !seen.insert(record.key()) {
                debug!(key = %record.key(), "duplicate rank in batch");
                report.skipped += 1;
                continue;
            }
            let store = Arc::clone(&store);
            let semaphore = Arc::clone(&semaphore);
            let fallback = record.clone();
            let handle = tokio::spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => upsert_one(store.as_ref(), &record)
                        .await
                        .map_err(|err| err.to_string()),
                    Err(_) => Err("upsert executor closed".to_string()),
                };
                (record, outcome)
            });
            handles.push((fallback, handle));
        }

        for (fallback, handle) in handles {
            let (record, outcome) = match handle.await {
                Ok(joined) => joined,
                Err(join_err) => (fallback, Err(format!("upsert task failed: {join_err}"))),
            };
            match outcome {
                Ok(Persisted::Created) => report.created += 1,
                Ok(Persisted::Skipped) => report.skipped += 1,
                Err(error) => {
                    warn!(key = %record.key(), college = %record.college.name, branch = %record.branch.code, %error, "failed to persist rank");
                    report.failures.push(UpsertFailure::for_record(&record, error));
                }
            }
        }

        info!(
            attempted = report.attempted,
            created = report.created,
            skipped = report.skipped,
            failed = report.failures.len(),
            "upsert finished"
        );
        report
    }
}
