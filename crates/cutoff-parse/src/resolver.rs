//! Per-run reference snapshot and resolution of college/branch references.

use std::collections::HashMap;

use cutoff_core::{Branch, College, NewBranch};
use cutoff_store::RankStore;
use strsim::jaro_winkler;
use tracing::info;

use crate::RowError;

/// Minimum Jaro-Winkler score for a "did you mean" college suggestion.
pub const SUGGESTION_THRESHOLD: f64 = 0.85;

pub fn normalize_college_name(name: &str) -> String {
    name.replace(',', "").trim().to_lowercase()
}

/// Composite branch lookup key: case-folded name and code plus category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchKey {
    name: String,
    code: String,
    ciwg: bool,
}

impl BranchKey {
    pub fn new(name: &str, code: &str, ciwg: bool) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            code: code.trim().to_lowercase(),
            ciwg,
        }
    }
}

impl From<&Branch> for BranchKey {
    fn from(branch: &Branch) -> Self {
        Self::new(&branch.name, &branch.code, branch.ciwg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollegeRef<'a> {
    Id(&'a str),
    Name(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRef<'a> {
    Id(&'a str),
    Triple {
        name: &'a str,
        code: &'a str,
        ciwg: bool,
    },
}

/// College/branch indexes owned by a single ingestion run.
///
/// Name and key indexes map to id lists so duplicates in the store surface as
/// ambiguity errors instead of an arbitrary pick.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    colleges_by_id: HashMap<String, College>,
    college_ids_by_name: HashMap<String, Vec<String>>,
    branches_by_id: HashMap<String, Branch>,
    branch_ids_by_key: HashMap<BranchKey, Vec<String>>,
    created_branches: Vec<Branch>,
}

impl ReferenceIndex {
    pub fn new(colleges: Vec<College>, branches: Vec<Branch>) -> Self {
        let mut index = Self::default();
        for college in colleges {
            index
                .college_ids_by_name
                .entry(normalize_college_name(&college.name))
                .or_default()
                .push(college.id.clone());
            index.colleges_by_id.insert(college.id.clone(), college);
        }
        for branch in branches {
            index.insert_branch(branch);
        }
        index
    }

    pub fn college_count(&self) -> usize {
        self.colleges_by_id.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches_by_id.len()
    }

    /// Branches created through the store during this run, in creation order.
    pub fn created_branches(&self) -> &[Branch] {
        &self.created_branches
    }

    pub fn college(&self, id: &str) -> Option<&College> {
        self.colleges_by_id.get(id)
    }

    pub fn branch(&self, id: &str) -> Option<&Branch> {
        self.branches_by_id.get(id)
    }

    fn insert_branch(&mut self, branch: Branch) {
        self.branch_ids_by_key
            .entry(BranchKey::from(&branch))
            .or_default()
            .push(branch.id.clone());
        self.branches_by_id.insert(branch.id.clone(), branch);
    }

    pub fn resolve_college(&self, reference: CollegeRef<'_>) -> Result<College, RowError> {
        match reference {
            CollegeRef::Id(id) => self
                .colleges_by_id
                .get(id)
                .cloned()
                .ok_or_else(|| RowError::UnknownCollegeId { id: id.to_string() }),
            CollegeRef::Name(name) => {
                let ids = self
                    .college_ids_by_name
                    .get(&normalize_college_name(name))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                match ids {
                    [id] => self
                        .colleges_by_id
                        .get(id)
                        .cloned()
                        .ok_or_else(|| RowError::UnknownCollegeId { id: id.clone() }),
                    [] => Err(RowError::UnknownCollegeName {
                        name: name.to_string(),
                        suggestion: self.suggest_college(name),
                    }),
                    many => Err(RowError::AmbiguousCollegeName {
                        name: name.to_string(),
                        count: many.len(),
                    }),
                }
            }
        }
    }

    /// Closest known college name, if any is similar enough.
    pub fn suggest_college(&self, name: &str) -> Option<String> {
        let wanted = normalize_college_name(name);
        self.colleges_by_id
            .values()
            .map(|c| (jaro_winkler(&wanted, &normalize_college_name(&c.name)), c))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|(a, ca), (b, cb)| a.total_cmp(b).then_with(|| cb.name.cmp(&ca.name)))
            .map(|(_, c)| c.name.clone())
    }

    fn lookup_branch(&self, key: &BranchKey) -> Result<Option<Branch>, usize> {
        match self
            .branch_ids_by_key
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            [] => Ok(None),
            [id] => Ok(self.branches_by_id.get(id).cloned()),
            many => Err(many.len()),
        }
    }
}

/// Resolves row references against a run's index, creating missing branches
/// through the store.
pub struct ReferenceResolver<'a, S: RankStore + ?Sized> {
    index: &'a mut ReferenceIndex,
    store: &'a S,
}

impl<'a, S: RankStore + ?Sized> ReferenceResolver<'a, S> {
    pub fn new(index: &'a mut ReferenceIndex, store: &'a S) -> Self {
        Self { index, store }
    }

    pub fn index(&self) -> &ReferenceIndex {
        self.index
    }

    pub async fn resolve(
        &mut self,
        college: CollegeRef<'_>,
        branch: BranchRef<'_>,
    ) -> Result<(College, Branch), RowError> {
        let college = self.index.resolve_college(college)?;
        let branch = self.resolve_branch(branch, &college.id).await?;
        Ok((college, branch))
    }

    async fn resolve_branch(
        &mut self,
        reference: BranchRef<'_>,
        college_id: &str,
    ) -> Result<Branch, RowError> {
        match reference {
            BranchRef::Id(id) => {
                self.index
                    .branch(id)
                    .cloned()
                    .ok_or_else(|| RowError::UnknownBranchId {
                        id: id.to_string(),
                        college_id: college_id.to_string(),
                    })
            }
            BranchRef::Triple { name, code, ciwg } => {
                let key = BranchKey::new(name, code, ciwg);
                match self.index.lookup_branch(&key) {
                    Ok(Some(branch)) => Ok(branch),
                    Ok(None) => self.create_branch(name, code, ciwg).await,
                    Err(count) => Err(RowError::AmbiguousBranch {
                        name: name.to_string(),
                        code: code.to_string(),
                        ciwg,
                        count,
                    }),
                }
            }
        }
    }

    async fn create_branch(&mut self, name: &str, code: &str, ciwg: bool) -> Result<Branch, RowError> {
        let request = NewBranch {
            name: name.to_string(),
            code: code.to_string(),
            ciwg,
        };
        let created = self
            .store
            .create_branch(&request)
            .await
            .map_err(|err| RowError::BranchCreateFailed {
                code: code.to_string(),
                message: err.to_string(),
            })?;
        info!(branch_id = %created.id, code, name, ciwg, "created branch");
        self.index.created_branches.push(created.clone());
        self.index.insert_branch(created.clone());
        Ok(created)
    }
}
