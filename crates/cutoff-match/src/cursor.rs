use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::MatchRequest;

pub const CURSOR_PREFIX: &str = "analyze";

/// Every parameter needed to re-run a match and show one page of it.
///
/// Round-trips through `analyze|<rank>|<ciwg>|<dev>|<page>|<branch>`; the
/// branch specification is last so it may itself contain `|`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageCursor {
    pub target_rank: u32,
    pub ciwg: bool,
    pub deviation: u32,
    pub page: usize,
    pub branch_spec: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor {0:?} is not an analyze cursor")]
    Prefix(String),
    #[error("cursor {cursor:?} has a bad {field} field")]
    Field { cursor: String, field: &'static str },
}

impl PageCursor {
    pub fn first(request: &MatchRequest) -> Self {
        Self {
            target_rank: request.target_rank,
            ciwg: request.ciwg,
            deviation: request.deviation,
            page: 0,
            branch_spec: request.branch_spec.clone(),
        }
    }

    pub fn request(&self) -> MatchRequest {
        MatchRequest {
            target_rank: self.target_rank,
            deviation: self.deviation,
            branch_spec: self.branch_spec.clone(),
            ciwg: self.ciwg,
        }
    }

    pub fn with_page(&self, page: usize) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }

    /// Cursor for the following page, if `page_count` has one.
    pub fn next(&self, page_count: usize) -> Option<Self> {
        let page = self.page.checked_add(1)?;
        (page < page_count).then(|| self.with_page(page))
    }

    pub fn prev(&self) -> Option<Self> {
        self.page.checked_sub(1).map(|page| self.with_page(page))
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CURSOR_PREFIX}|{}|{}|{}|{}|{}",
            self.target_rank, self.ciwg, self.deviation, self.page, self.branch_spec
        )
    }
}

impl FromStr for PageCursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const FIELDS: [&str; 5] = ["rank", "ciwg", "deviation", "page", "branch"];

        let parts: Vec<&str> = s.splitn(6, '|').collect();
        if parts.first() != Some(&CURSOR_PREFIX) {
            return Err(CursorError::Prefix(s.to_string()));
        }
        let bad = |field: &'static str| CursorError::Field {
            cursor: s.to_string(),
            field,
        };
        if let Some(missing) = FIELDS.get(parts.len() - 1) {
            return Err(bad(*missing));
        }

        Ok(Self {
            target_rank: parts[1].parse().map_err(|_| bad("rank"))?,
            ciwg: parts[2].parse().map_err(|_| bad("ciwg"))?,
            deviation: parts[3].parse().map_err(|_| bad("deviation"))?,
            page: parts[4].parse().map_err(|_| bad("page"))?,
            branch_spec: parts[5].to_string(),
        })
    }
}
