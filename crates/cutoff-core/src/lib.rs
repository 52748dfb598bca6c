//! Core domain model for admission cutoff data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cutoff-core";

/// Reference college. Created out-of-band; never written by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct College {
    pub id: String,
    pub name: String,
    /// Comma-joined alias list, e.g. `"NITT,NIT Trichy"`.
    #[serde(default)]
    pub alias: String,
}

impl College {
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.alias
            .split(',')
            .map(str::trim)
            .filter(|alias| !alias.is_empty())
    }

    /// Exact, case-insensitive alias membership.
    pub fn has_alias(&self, alias: &str) -> bool {
        let alias = alias.trim();
        self.aliases().any(|a| a.eq_ignore_ascii_case(alias))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub name: String,
    pub code: String,
    /// Distinct admission category that partitions cutoffs.
    #[serde(default)]
    pub ciwg: bool,
}

/// Create payload for a branch that has no match in the store yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewBranch {
    pub name: String,
    pub code: String,
    pub ciwg: bool,
}

impl From<&Branch> for NewBranch {
    fn from(branch: &Branch) -> Self {
        Self {
            name: branch.name.clone(),
            code: branch.code.clone(),
            ciwg: branch.ciwg,
        }
    }
}

/// Opening/closing rank pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankBounds {
    pub open: u32,
    pub close: u32,
}

impl RankBounds {
    pub const ZERO: Self = Self { open: 0, close: 0 };

    pub fn new(open: u32, close: u32) -> Self {
        Self { open, close }
    }

    pub fn is_zero(&self) -> bool {
        self.open == 0 && self.close == 0
    }
}

/// Identity tuple used for idempotent persistence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RankKey {
    pub year: u32,
    pub round: u32,
    pub college_id: String,
    pub branch_id: String,
    pub ciwg: bool,
}

impl fmt::Display for RankKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "year={} round={} college={} branch={} ciwg={}",
            self.year, self.round, self.college_id, self.branch_id, self.ciwg
        )
    }
}

/// One (year, round, college, branch) cutoff entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    /// Store-assigned id; `None` until persisted.
    #[serde(default)]
    pub id: Option<String>,
    pub year: u32,
    pub round: u32,
    /// JEE opening/closing ranks; the admission criterion for matching.
    pub primary: RankBounds,
    /// DASA opening/closing ranks.
    pub secondary: RankBounds,
    pub college: College,
    pub branch: Branch,
}

impl RankRecord {
    pub fn key(&self) -> RankKey {
        RankKey {
            year: self.year,
            round: self.round,
            college_id: self.college.id.clone(),
            branch_id: self.branch.id.clone(),
            ciwg: self.branch.ciwg,
        }
    }

    /// Zero/zero rows are placeholders for seats that were never filled.
    pub fn is_placeholder(&self) -> bool {
        self.primary.is_zero()
    }

    pub fn year_round(&self) -> (u32, u32) {
        (self.year, self.round)
    }
}

/// Backup entry as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub key: String,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
}
