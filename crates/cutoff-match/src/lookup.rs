//! Read-only queries over the cached college list and rank dataset.

use std::collections::BTreeSet;

use cutoff_core::{Branch, College, RankRecord};
use serde::Serialize;
use thiserror::Error;

pub const SEARCH_LIMIT: usize = 25;
pub const NAME_DISPLAY_LIMIT: usize = 100;
pub const COLLEGE_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("Invalid rank {0:?}")]
    InvalidRank(String),
    #[error("no college id or name provided")]
    EmptyCollege,
    #[error("no college found with {0:?}")]
    NoCollege(String),
    #[error("no cutoff for college {college_id} branch {branch_code} (ciwg={ciwg}) in {year} round {round}")]
    NoCutoff {
        college_id: String,
        branch_code: String,
        ciwg: bool,
        year: u32,
        round: u32,
    },
}

/// Parses user-typed ranks such as `1,00,000` or `1.000`.
pub fn parse_rank_text(text: &str) -> Result<u32, LookupError> {
    let cleaned: String = text.trim().chars().filter(|c| !matches!(c, ',' | '.')).collect();
    cleaned
        .parse()
        .map_err(|_| LookupError::InvalidRank(text.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollegeHit {
    pub id: String,
    pub name: String,
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Case-insensitive substring search over names and aliases.
pub fn search_colleges(colleges: &[College], term: &str, limit: usize) -> Vec<CollegeHit> {
    let term = term.trim().to_lowercase();
    colleges
        .iter()
        .filter(|c| {
            term.is_empty()
                || c.name.to_lowercase().contains(&term)
                || c.aliases().any(|a| a.to_lowercase().contains(&term))
        })
        .take(limit)
        .map(|c| CollegeHit {
            id: c.id.clone(),
            name: truncate_chars(&c.name, NAME_DISPLAY_LIMIT),
        })
        .collect()
}

pub fn colleges_by_alias<'a>(colleges: &'a [College], alias: &str) -> Vec<&'a College> {
    colleges.iter().filter(|c| c.has_alias(alias)).collect()
}

/// One page of the full college listing. `page` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollegePage<'a> {
    pub page: usize,
    pub page_count: usize,
    pub colleges: &'a [College],
}

impl CollegePage<'_> {
    pub fn label(&self) -> String {
        format!("Page {}/{}", self.page + 1, self.page_count)
    }

    pub fn prev(&self) -> Option<usize> {
        self.page.checked_sub(1)
    }

    pub fn next(&self) -> Option<usize> {
        (self.page + 1 < self.page_count).then_some(self.page + 1)
    }
}

/// Pages through every college in store order. Out-of-range pages are
/// clamped to the nearest one.
pub fn college_page(colleges: &[College], page: usize) -> CollegePage<'_> {
    let page_count = colleges.len().div_ceil(COLLEGE_PAGE_SIZE).max(1);
    let page = page.min(page_count - 1);
    let start = page * COLLEGE_PAGE_SIZE;
    let end = (start + COLLEGE_PAGE_SIZE).min(colleges.len());
    CollegePage {
        page,
        page_count,
        colleges: &colleges[start..end],
    }
}

pub fn college_detail(college: &College) -> String {
    format!("College: {}\nAlias: {}", college.name, college.alias)
}

/// Input without spaces is treated as an id, anything else as a full name.
pub fn find_college<'a>(colleges: &'a [College], id_or_name: &str) -> Result<&'a College, LookupError> {
    let wanted = id_or_name.trim();
    if wanted.is_empty() {
        return Err(LookupError::EmptyCollege);
    }
    let found = if wanted.contains(' ') {
        let wanted = wanted.to_lowercase();
        colleges.iter().find(|c| c.name.to_lowercase() == wanted)
    } else {
        colleges.iter().find(|c| c.id == wanted)
    };
    found.ok_or_else(|| LookupError::NoCollege(wanted.to_string()))
}

pub fn available_years(dataset: &[RankRecord]) -> Vec<u32> {
    dataset
        .iter()
        .map(|r| r.year)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn in_scope(record: &RankRecord, college_id: &str, ciwg: bool, year: u32, round: u32) -> bool {
    record.college.id == college_id
        && record.branch.ciwg == ciwg
        && record.year_round() == (year, round)
}

pub fn branches_for_college<'a>(
    dataset: &'a [RankRecord],
    college_id: &str,
    ciwg: bool,
    year: u32,
    round: u32,
) -> Vec<&'a Branch> {
    dataset
        .iter()
        .filter(|r| in_scope(r, college_id, ciwg, year, round))
        .map(|r| &r.branch)
        .collect()
}

/// The cutoff row for one college/branch/category in a given round. When the
/// dataset holds duplicates the last one wins.
pub fn cutoff_for<'a>(
    dataset: &'a [RankRecord],
    college_id: &str,
    branch_code: &str,
    ciwg: bool,
    year: u32,
    round: u32,
) -> Result<&'a RankRecord, LookupError> {
    dataset
        .iter()
        .rfind(|r| in_scope(r, college_id, ciwg, year, round) && r.branch.code == branch_code)
        .ok_or_else(|| LookupError::NoCutoff {
            college_id: college_id.to_string(),
            branch_code: branch_code.to_string(),
            ciwg,
            year,
            round,
        })
}
