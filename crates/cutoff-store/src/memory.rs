//! In-process `RankStore` with fault injection, used by tests and local runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cutoff_core::{BackupDescriptor, Branch, College, NewBranch, RankKey, RankRecord};
use tokio::sync::Mutex;

use crate::{RankStore, StoreError, StoreResult};

/// Operation that the memory store should fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    ListColleges,
    ListBranches,
    ListBackups,
    DeleteBackup,
    CreateBackup,
    CreateBranch { code: String },
    CreateRank { branch_code: String },
    FindRank { branch_code: String },
}

#[derive(Debug, Default)]
struct State {
    colleges: Vec<College>,
    branches: Vec<Branch>,
    ranks: Vec<RankRecord>,
    backups: Vec<BackupDescriptor>,
    next_id: u64,
}

impl State {
    fn mint_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012}", self.next_id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Vec<Fault>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_colleges(mut self, colleges: Vec<College>) -> Self {
        self.state.get_mut().colleges = colleges;
        self
    }

    pub fn with_branches(mut self, branches: Vec<Branch>) -> Self {
        self.state.get_mut().branches = branches;
        self
    }

    pub fn with_ranks(mut self, ranks: Vec<RankRecord>) -> Self {
        self.state.get_mut().ranks = ranks;
        self
    }

    pub fn with_backups(mut self, backups: Vec<BackupDescriptor>) -> Self {
        self.state.get_mut().backups = backups;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Delays every rank lookup and insert, to make overlap observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn colleges(&self) -> Vec<College> {
        self.state.lock().await.colleges.clone()
    }

    pub async fn branches(&self) -> Vec<Branch> {
        self.state.lock().await.branches.clone()
    }

    pub async fn ranks(&self) -> Vec<RankRecord> {
        self.state.lock().await.ranks.clone()
    }

    pub async fn backups(&self) -> Vec<BackupDescriptor> {
        self.state.lock().await.backups.clone()
    }

    /// Highest number of rank operations observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.faults.contains(&fault) {
            Err(StoreError::Rejected(format!("injected fault: {fault:?}")))
        } else {
            Ok(())
        }
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RankStore for MemoryStore {
    async fn list_colleges(&self) -> StoreResult<Vec<College>> {
        self.check(Fault::ListColleges)?;
        Ok(self.colleges().await)
    }

    async fn list_branches(&self) -> StoreResult<Vec<Branch>> {
        self.check(Fault::ListBranches)?;
        Ok(self.branches().await)
    }

    async fn list_ranks(&self) -> StoreResult<Vec<RankRecord>> {
        let mut ranks = self.ranks().await;
        ranks.sort_by(|a, b| b.year_round().cmp(&a.year_round()));
        Ok(ranks)
    }

    async fn get_college(&self, id: &str) -> StoreResult<Option<College>> {
        let state = self.state.lock().await;
        Ok(state.colleges.iter().find(|c| c.id == id).cloned())
    }

    async fn get_branch(&self, id: &str) -> StoreResult<Option<Branch>> {
        let state = self.state.lock().await;
        Ok(state.branches.iter().find(|b| b.id == id).cloned())
    }

    async fn find_rank(&self, key: &RankKey) -> StoreResult<Option<RankRecord>> {
        let _guard = self.enter().await;
        let state = self.state.lock().await;
        let found = state.ranks.iter().find(|r| &r.key() == key).cloned();
        if let Some(branch) = state.branches.iter().find(|b| b.id == key.branch_id) {
            self.check(Fault::FindRank {
                branch_code: branch.code.clone(),
            })?;
        }
        Ok(found)
    }

    async fn create_branch(&self, branch: &NewBranch) -> StoreResult<Branch> {
        self.check(Fault::CreateBranch {
            code: branch.code.clone(),
        })?;
        let mut state = self.state.lock().await;
        let created = Branch {
            id: state.mint_id("br"),
            name: branch.name.clone(),
            code: branch.code.clone(),
            ciwg: branch.ciwg,
        };
        state.branches.push(created.clone());
        Ok(created)
    }

    async fn create_rank(&self, record: &RankRecord) -> StoreResult<RankRecord> {
        let _guard = self.enter().await;
        self.check(Fault::CreateRank {
            branch_code: record.branch.code.clone(),
        })?;
        let mut state = self.state.lock().await;
        if !state.colleges.iter().any(|c| c.id == record.college.id) {
            return Err(StoreError::Rejected(format!(
                "unknown college {}",
                record.college.id
            )));
        }
        if !state.branches.iter().any(|b| b.id == record.branch.id) {
            return Err(StoreError::Rejected(format!(
                "unknown branch {}",
                record.branch.id
            )));
        }
        let created = RankRecord {
            id: Some(state.mint_id("rk")),
            ..record.clone()
        };
        state.ranks.push(created.clone());
        Ok(created)
    }

    async fn list_backups(&self) -> StoreResult<Vec<BackupDescriptor>> {
        self.check(Fault::ListBackups)?;
        Ok(self.backups().await)
    }

    async fn delete_backup(&self, key: &str) -> StoreResult<()> {
        self.check(Fault::DeleteBackup)?;
        let mut state = self.state.lock().await;
        let before = state.backups.len();
        state.backups.retain(|b| b.key != key);
        if state.backups.len() == before {
            return Err(StoreError::HttpStatus {
                status: 404,
                url: format!("memory://backups/{key}"),
                body: "backup not found".into(),
            });
        }
        Ok(())
    }

    async fn create_backup(&self, name: &str) -> StoreResult<()> {
        self.check(Fault::CreateBackup)?;
        let mut state = self.state.lock().await;
        state.backups.push(BackupDescriptor {
            key: name.to_string(),
            modified: Utc::now(),
            size: 0,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutoff_core::RankBounds;

    fn seeded() -> MemoryStore {
        MemoryStore::new()
            .with_colleges(vec![College {
                id: "c1".into(),
                name: "NIT Trichy".into(),
                alias: "NITT".into(),
            }])
            .with_branches(vec![Branch {
                id: "b1".into(),
                name: "Computer Science".into(),
                code: "CS".into(),
                ciwg: false,
            }])
    }

    async fn record(store: &MemoryStore, year: u32, round: u32) -> RankRecord {
        RankRecord {
            id: None,
            year,
            round,
            primary: RankBounds::new(1, 2),
            secondary: RankBounds::ZERO,
            college: store.colleges().await.remove(0),
            branch: store.branches().await.remove(0),
        }
    }

    #[tokio::test]
    async fn created_ranks_are_found_by_key_and_listed_newest_first() {
        let store = seeded();
        let older = record(&store, 2023, 3).await;
        let newer = record(&store, 2024, 1).await;
        store.create_rank(&older).await.unwrap();
        let created = store.create_rank(&newer).await.unwrap();
        assert!(created.id.is_some());

        let found = store.find_rank(&newer.key()).await.unwrap();
        assert_eq!(found.and_then(|r| r.id), created.id);

        let listed = store.list_ranks().await.unwrap();
        assert_eq!(listed[0].year_round(), (2024, 1));
        assert_eq!(listed[1].year_round(), (2023, 3));
    }

    #[tokio::test]
    async fn dangling_references_are_rejected() {
        let store = seeded();
        let mut rank = record(&store, 2024, 1).await;
        rank.branch.id = "missing".into();
        let err = store.create_rank(&rank).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn injected_faults_fail_only_their_target() {
        let store = seeded().with_fault(Fault::CreateBranch { code: "EE".into() });
        let ok = store
            .create_branch(&NewBranch {
                name: "Mechanical".into(),
                code: "ME".into(),
                ciwg: false,
            })
            .await;
        assert!(ok.is_ok());
        let err = store
            .create_branch(&NewBranch {
                name: "Electrical".into(),
                code: "EE".into(),
                ciwg: false,
            })
            .await;
        assert!(matches!(err, Err(StoreError::Rejected(_))));
        assert_eq!(store.branches().await.len(), 2);
    }

    #[tokio::test]
    async fn deleting_unknown_backup_is_not_found() {
        let store = MemoryStore::new();
        store.create_backup("a.zip").await.unwrap();
        assert_eq!(store.list_backups().await.unwrap().len(), 1);
        let err = store.delete_backup("b.zip").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        store.delete_backup("a.zip").await.unwrap();
        assert!(store.list_backups().await.unwrap().is_empty());
    }
}
