//! Backup rotation that must succeed before any bulk write.

use std::fmt;

use chrono::{DateTime, Utc};
use cutoff_core::BackupDescriptor;
use cutoff_store::{RankStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_BACKUP_CAP: usize = 3;
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%d_%m_%Y_%H_%M_%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStage {
    List,
    Delete,
    Create,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::List => "listing backups",
            Self::Delete => "deleting oldest backup",
            Self::Create => "creating backup",
        })
    }
}

#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct BackupError {
    pub stage: BackupStage,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub created: String,
    pub deleted: Option<String>,
    /// Backups present before rotation.
    pub existing: usize,
}

/// Lower-cases and drops everything outside `[a-z0-9]`.
pub fn sanitize_actor(actor: &str) -> String {
    actor
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

pub fn backup_name(actor: &str, at: DateTime<Utc>) -> String {
    let actor = sanitize_actor(actor);
    let actor = if actor.is_empty() { "anonymous" } else { actor.as_str() };
    format!("{actor}_{}.zip", at.format(BACKUP_TIMESTAMP_FORMAT))
}

/// Oldest by `modified`; on a tie the entry listed last wins.
pub fn oldest_backup(backups: &[BackupDescriptor]) -> Option<&BackupDescriptor> {
    backups.iter().rev().min_by_key(|b| b.modified)
}

#[derive(Debug, Clone, Copy)]
pub struct BackupGuard {
    cap: usize,
}

impl Default for BackupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_BACKUP_CAP)
    }
}

impl BackupGuard {
    pub fn new(cap: usize) -> Self {
        Self { cap }
    }

    /// Lists, deletes the oldest backup when more than `cap` exist, then
    /// creates a fresh one. Any failing step aborts with that stage.
    pub async fn secure<S: RankStore + ?Sized>(
        &self,
        store: &S,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<BackupReport, BackupError> {
        let backups = store.list_backups().await.map_err(|source| BackupError {
            stage: BackupStage::List,
            source,
        })?;

        let mut deleted = None;
        if backups.len() > self.cap {
            if let Some(oldest) = oldest_backup(&backups) {
                store
                    .delete_backup(&oldest.key)
                    .await
                    .map_err(|source| BackupError {
                        stage: BackupStage::Delete,
                        source,
                    })?;
                info!(key = %oldest.key, existing = backups.len(), cap = self.cap, "deleted oldest backup");
                deleted = Some(oldest.key.clone());
            }
        }

        let created = backup_name(actor, now);
        store
            .create_backup(&created)
            .await
            .map_err(|source| BackupError {
                stage: BackupStage::Create,
                source,
            })?;
        info!(name = %created, "created backup");

        Ok(BackupReport {
            created,
            deleted,
            existing: backups.len(),
        })
    }
}
