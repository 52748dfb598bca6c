use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Optional id overrides carried in the 7th upload column.
///
/// Grammar: empty | `b-<branchID>` | `c-<collegeID>` | `b-<branchID>:c-<collegeID>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExtraIds {
    NoOverride,
    CollegeOverride(String),
    BranchOverride(String),
    /// `(branch id, college id)`, in column order.
    BothOverride(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid extra id directive {value:?}")]
pub struct ExtraIdsError {
    pub value: String,
}

impl ExtraIds {
    pub fn college_id(&self) -> Option<&str> {
        match self {
            Self::CollegeOverride(id) | Self::BothOverride(_, id) => Some(id),
            _ => None,
        }
    }

    pub fn branch_id(&self) -> Option<&str> {
        match self {
            Self::BranchOverride(id) | Self::BothOverride(id, _) => Some(id),
            _ => None,
        }
    }
}

fn tagged_id<'a>(part: &'a str, prefix: &str) -> Option<&'a str> {
    let id = part.strip_prefix(prefix)?;
    let valid = !id.is_empty() && !id.chars().any(|c| c.is_whitespace() || c == ':');
    valid.then_some(id)
}

impl FromStr for ExtraIds {
    type Err = ExtraIdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Ok(Self::NoOverride);
        }

        let parsed = match raw.split_once(':') {
            Some((branch, college)) => tagged_id(branch, "b-")
                .zip(tagged_id(college, "c-"))
                .map(|(b, c)| Self::BothOverride(b.to_string(), c.to_string())),
            None => tagged_id(raw, "c-")
                .map(|id| Self::CollegeOverride(id.to_string()))
                .or_else(|| tagged_id(raw, "b-").map(|id| Self::BranchOverride(id.to_string()))),
        };

        parsed.ok_or_else(|| ExtraIdsError {
            value: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_directive_means_no_override() {
        assert_eq!("".parse::<ExtraIds>().unwrap(), ExtraIds::NoOverride);
        assert_eq!("  ".parse::<ExtraIds>().unwrap(), ExtraIds::NoOverride);
    }

    #[test]
    fn single_overrides() {
        let college: ExtraIds = "c-7".parse().unwrap();
        assert_eq!(college, ExtraIds::CollegeOverride("7".into()));
        assert_eq!(college.college_id(), Some("7"));
        assert_eq!(college.branch_id(), None);

        let branch: ExtraIds = "b-42".parse().unwrap();
        assert_eq!(branch.branch_id(), Some("42"));
        assert_eq!(branch.college_id(), None);
    }

    #[test]
    fn both_overrides_keep_column_order() {
        let both: ExtraIds = "b-42:c-7".parse().unwrap();
        assert_eq!(both, ExtraIds::BothOverride("42".into(), "7".into()));
        assert_eq!(both.branch_id(), Some("42"));
        assert_eq!(both.college_id(), Some("7"));
    }

    #[test]
    fn anything_else_is_rejected() {
        for bad in ["x-1", "c-", "b-", "c-7:b-42", "b-1:c-", "b-1:c-2:c-3", "b 1", "b-1 2", "42"] {
            let err = bad.parse::<ExtraIds>().unwrap_err();
            assert_eq!(err.value, bad.trim(), "{bad}");
        }
    }
}
