//! Proximity matching of a candidate rank against the latest cutoffs.

use cutoff_core::{Branch, RankRecord};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

mod cursor;
pub mod lookup;
mod presets;

pub use cursor::{CursorError, PageCursor, CURSOR_PREFIX};
pub use presets::{BranchPreset, BranchPresets};

pub const CRATE_NAME: &str = "cutoff-match";

pub const PAGE_SIZE: usize = 10;
pub const DEFAULT_DEVIATION: u32 = 10;
/// Deviation percentages offered to callers.
pub const DEVIATION_CHOICES: [u32; 5] = [5, 10, 15, 20, 25];

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no colleges found near that rank for the selected branch")]
    NoMatches,
    #[error("branch selection has no keywords")]
    EmptyBranchQuery,
    #[error("invalid branch keyword {keyword:?}: {source}")]
    Keyword {
        keyword: String,
        #[source]
        source: regex::Error,
    },
}

/// `target - target * deviation / 100`, truncating, never below zero.
pub fn lower_bound(target: u32, deviation: u32) -> u32 {
    let target = u64::from(target);
    let bound = target.saturating_sub(target * u64::from(deviation) / 100);
    // bound <= target, so it always fits back.
    u32::try_from(bound).unwrap_or(0)
}

/// Keyword set parsed from a branch specification.
///
/// `"Label: kw1, kw2"` uses the comma list after the first `:`; anything
/// else is a single keyword. Each keyword must appear as a whole word in the
/// branch name or code.
#[derive(Debug, Clone)]
pub struct BranchQuery {
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl BranchQuery {
    pub fn parse(spec: &str) -> Result<Self, MatchError> {
        let keywords: Vec<String> = match spec.split_once(':') {
            Some((_, list)) => list
                .split(',')
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .collect(),
            None => Some(spec.trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .into_iter()
                .collect(),
        };
        if keywords.is_empty() {
            return Err(MatchError::EmptyBranchQuery);
        }

        let patterns = keywords
            .iter()
            .map(|kw| {
                Regex::new(&format!(
                    r"(?i)(?:^|[^[:alnum:]]){}(?:$|[^[:alnum:]])",
                    regex::escape(kw)
                ))
                .map_err(|source| MatchError::Keyword {
                    keyword: kw.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { keywords, patterns })
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn matches_text(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    pub fn matches(&self, branch: &Branch) -> bool {
        self.matches_text(&branch.name) || self.matches_text(&branch.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRequest {
    pub target_rank: u32,
    pub deviation: u32,
    pub branch_spec: String,
    pub ciwg: bool,
}

impl MatchRequest {
    pub fn new(target_rank: u32, branch_spec: impl Into<String>, ciwg: bool) -> Self {
        Self {
            target_rank,
            deviation: DEFAULT_DEVIATION,
            branch_spec: branch_spec.into(),
            ciwg,
        }
    }

    pub fn with_deviation(mut self, deviation: u32) -> Self {
        self.deviation = deviation;
        self
    }

    pub fn lower_bound(&self) -> u32 {
        lower_bound(self.target_rank, self.deviation)
    }
}

/// Matches chunked into fixed-size pages. Never empty.
#[derive(Debug, Clone, Serialize)]
pub struct MatchPages {
    pub year: u32,
    pub round: u32,
    pub lower_bound: u32,
    pages: Vec<Vec<RankRecord>>,
}

impl MatchPages {
    pub fn page(&self, index: usize) -> Option<&[RankRecord]> {
        self.pages.get(index).map(Vec::as_slice)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn total(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    pub fn pages(&self) -> &[Vec<RankRecord>] {
        &self.pages
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankRecord> {
        self.pages.iter().flatten()
    }
}

/// Filters `dataset` (newest year/round first, as the store lists it) down to
/// the records near `request.target_rank`.
///
/// Only the year and round of the first record are considered. A record
/// qualifies when its category flag matches, it is not a zero/zero
/// placeholder, a keyword matches its branch, and its primary close rank is
/// at or above the lower bound.
pub fn match_ranks(dataset: &[RankRecord], request: &MatchRequest) -> Result<MatchPages, MatchError> {
    let query = BranchQuery::parse(&request.branch_spec)?;
    let Some((year, round)) = dataset.first().map(RankRecord::year_round) else {
        return Err(MatchError::NoMatches);
    };
    let bound = request.lower_bound();

    let mut matches: Vec<RankRecord> = dataset
        .iter()
        .filter(|r| r.year_round() == (year, round))
        .filter(|r| r.branch.ciwg == request.ciwg)
        .filter(|r| !r.is_placeholder())
        .filter(|r| r.primary.close >= bound)
        .filter(|r| query.matches(&r.branch))
        .cloned()
        .collect();

    if matches.is_empty() {
        return Err(MatchError::NoMatches);
    }

    matches.sort_by(|a, b| {
        a.primary
            .close
            .cmp(&b.primary.close)
            .then_with(|| a.college.name.cmp(&b.college.name))
            .then_with(|| a.branch.code.cmp(&b.branch.code))
    });

    debug!(
        year,
        round,
        lower_bound = bound,
        keywords = ?query.keywords(),
        matched = matches.len(),
        "matched ranks"
    );

    let pages = matches.chunks(PAGE_SIZE).map(<[RankRecord]>::to_vec).collect();
    Ok(MatchPages {
        year,
        round,
        lower_bound: bound,
        pages,
    })
}

#[cfg(test)]
pub(crate) mod testdata {
    use cutoff_core::{Branch, College, RankBounds, RankRecord};

    pub fn record(year: u32, round: u32, college: &str, code: &str, name: &str, ciwg: bool, close: u32) -> RankRecord {
        RankRecord {
            id: Some(format!("{college}-{code}-{year}-{round}")),
            year,
            round,
            primary: RankBounds::new(close / 2, close),
            secondary: RankBounds::ZERO,
            college: College {
                id: college.to_lowercase(),
                name: college.into(),
                alias: String::new(),
            },
            branch: Branch {
                id: format!("{code}-{ciwg}"),
                name: name.into(),
                code: code.into(),
                ciwg,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testdata::record;
    use super::*;
    use cutoff_core::RankBounds;

    fn cs(college: &str, close: u32) -> RankRecord {
        record(2024, 2, college, "CS", "Computer Science", false, close)
    }

    #[test]
    fn lower_bound_truncates_and_saturates() {
        assert_eq!(lower_bound(100_000, 10), 90_000);
        assert_eq!(lower_bound(999, 15), 850);
        assert_eq!(lower_bound(50, 250), 0);
        assert_eq!(lower_bound(u32::MAX, 0), u32::MAX);
    }

    #[test]
    fn deviation_window_uses_close_rank() {
        let data = vec![cs("Near", 95_000), cs("Far", 85_000), cs("Above", 150_000)];
        let pages = match_ranks(&data, &MatchRequest::new(100_000, "cs", false)).unwrap();
        let names: Vec<&str> = pages.iter().map(|r| r.college.name.as_str()).collect();
        assert_eq!(names, vec!["Near", "Above"]);
        assert_eq!(pages.lower_bound, 90_000);
    }

    #[test]
    fn twenty_three_matches_make_three_pages() {
        let data: Vec<RankRecord> = (0..23).rev().map(|i| cs(&format!("College {i:02}"), 1_000 + i)).collect();
        let pages = match_ranks(&data, &MatchRequest::new(1_000, "Computer Science", false)).unwrap();

        let sizes: Vec<usize> = pages.pages().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        let closes: Vec<u32> = pages.iter().map(|r| r.primary.close).collect();
        assert!(closes.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(pages.page(2).map(|p| p[0].primary.close), Some(1_020));
        assert!(pages.page(3).is_none());
        assert_eq!(pages.total(), 23);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let query = BranchQuery::parse("cs").unwrap();
        assert!(query.matches_text("CS"));
        assert!(query.matches_text("B.Tech (CS)"));
        assert!(!query.matches_text("Basics"));
        assert!(!query.matches_text("Physics"));

        let query = BranchQuery::parse("Computer Science: cs, computer science").unwrap();
        assert_eq!(query.keywords(), ["cs", "computer science"]);
        assert!(query.matches_text("Computer Science and Engineering"));
        assert!(!query.matches_text("Computer Sciences"));
    }

    #[test]
    fn empty_keyword_lists_are_rejected() {
        for spec in ["", "   ", "Label:", "Label: , ,"] {
            assert!(matches!(BranchQuery::parse(spec), Err(MatchError::EmptyBranchQuery)), "{spec:?}");
        }
    }

    #[test]
    fn scope_is_latest_round_and_requested_category() {
        let data = vec![
            record(2024, 3, "Latest", "CS", "Computer Science", false, 5_000),
            record(2024, 3, "Ciwg", "CS", "Computer Science", true, 5_000),
            record(2024, 2, "Older", "CS", "Computer Science", false, 5_000),
        ];
        let pages = match_ranks(&data, &MatchRequest::new(5_000, "cs", false)).unwrap();
        assert_eq!((pages.year, pages.round), (2024, 3));
        assert_eq!(pages.total(), 1);
        assert_eq!(pages.iter().next().map(|r| r.college.name.as_str()), Some("Latest"));

        let ciwg = match_ranks(&data, &MatchRequest::new(5_000, "cs", true)).unwrap();
        assert_eq!(ciwg.iter().next().map(|r| r.college.name.as_str()), Some("Ciwg"));
    }

    #[test]
    fn placeholders_and_empty_results_are_no_matches() {
        let mut placeholder = cs("Unfilled", 0);
        placeholder.primary = RankBounds::ZERO;
        let err = match_ranks(&[placeholder], &MatchRequest::new(0, "cs", false)).unwrap_err();
        assert!(matches!(err, MatchError::NoMatches));

        let err = match_ranks(&[], &MatchRequest::new(10, "cs", false)).unwrap_err();
        assert!(matches!(err, MatchError::NoMatches));
    }

    #[test]
    fn ties_break_on_college_then_branch() {
        let data = vec![
            record(2024, 1, "Beta", "CS", "Computer Science", false, 700),
            record(2024, 1, "Alpha", "IT", "Information Technology", false, 700),
            record(2024, 1, "Alpha", "CS", "Computer Science", false, 700),
        ];
        let pages = match_ranks(&data, &MatchRequest::new(700, "Computing: cs, it", false)).unwrap();
        let order: Vec<(&str, &str)> = pages
            .iter()
            .map(|r| (r.college.name.as_str(), r.branch.code.as_str()))
            .collect();
        assert_eq!(order, vec![("Alpha", "CS"), ("Alpha", "IT"), ("Beta", "CS")]);
    }
}
