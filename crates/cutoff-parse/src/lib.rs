//! Upload parsing: per-row validation, reference resolution and batch
//! collection of cutoff rows.
//!
//! Upload layout (after a discarded header line):
//! `college_name, branch_code, branch_name, is_ciwg, first_rank, last_rank, extra_id`.

use std::io;

use cutoff_core::{RankBounds, RankRecord};
use cutoff_store::RankStore;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

mod extra_ids;
mod resolver;

pub use extra_ids::{ExtraIds, ExtraIdsError};
pub use resolver::{
    normalize_college_name, BranchKey, BranchRef, CollegeRef, ReferenceIndex, ReferenceResolver,
    SUGGESTION_THRESHOLD,
};

pub const CRATE_NAME: &str = "cutoff-parse";

pub const MIN_COLUMNS: usize = 7;

const COLLEGE_NAME: usize = 0;
const BRANCH_CODE: usize = 1;
const BRANCH_NAME: usize = 2;
const IS_CIWG: usize = 3;
const FIRST_RANK: usize = 4;
const LAST_RANK: usize = 5;
const EXTRA_ID: usize = 6;

/// Why a single upload row was rejected. `Display` is the user-facing text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowError {
    #[error("Malformed row with {columns} columns")]
    MalformedRow { columns: usize },
    #[error("Empty '{field}' value")]
    EmptyField { field: &'static str },
    #[error("Invalid 'is_ciwg' value: {value:?}")]
    InvalidFlag { value: String },
    #[error("Invalid '{field}' value: {value:?}")]
    InvalidRank { field: &'static str, value: String },
    #[error("Invalid 'extra_id' value: {value}")]
    InvalidExtraId { value: String },
    #[error("Invalid 'college_id' value: {id}")]
    UnknownCollegeId { id: String },
    #[error("{}", unknown_college_message(.name, .suggestion))]
    UnknownCollegeName {
        name: String,
        suggestion: Option<String>,
    },
    #[error("College name **{name}** matches {count} colleges. Add the college id with c-(collegeID) in the 7th column")]
    AmbiguousCollegeName { name: String, count: usize },
    #[error("Invalid 'branch_id' value: {id} for 'college id' {college_id}")]
    UnknownBranchId { id: String, college_id: String },
    #[error("Branch {name:?} ({code}, ciwg={ciwg}) matches {count} branches. Add the branch id with b-(branchID) in the 7th column")]
    AmbiguousBranch {
        name: String,
        code: String,
        ciwg: bool,
        count: usize,
    },
    #[error("Error creating branch {code}: {message}")]
    BranchCreateFailed { code: String, message: String },
    #[error("Error reading record: {message}")]
    Read { message: String },
}

fn unknown_college_message(name: &str, suggestion: &Option<String>) -> String {
    let mut message = format!("College of name **{name}** doesn't exist.");
    if let Some(suggestion) = suggestion {
        message.push_str(&format!(" Did you mean **{suggestion}**?"));
    }
    message.push_str(" Try adding the college id with c-(collegeID) in the 7th column");
    message
}

/// A rejected row. `line` counts data rows from 1, header excluded.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("line {}: {error}", .line + 1)]
pub struct RowParseError {
    pub line: usize,
    pub record: Option<Vec<String>>,
    pub error: RowError,
}

impl RowParseError {
    /// Line number within the uploaded file, counting the header line.
    pub fn file_line(&self) -> usize {
        self.line + 1
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

/// Year and round every row of one upload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchTarget {
    pub year: u32,
    pub round: u32,
}

/// Boolean literals accepted in the `is_ciwg` column.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn required<'r>(fields: &'r [String], index: usize, field: &'static str) -> Result<&'r str, RowError> {
    let value = fields[index].trim();
    if value.is_empty() {
        Err(RowError::EmptyField { field })
    } else {
        Ok(value)
    }
}

fn parse_rank(fields: &[String], index: usize, field: &'static str) -> Result<u32, RowError> {
    let raw = fields[index].trim();
    raw.parse().map_err(|_| RowError::InvalidRank {
        field,
        value: raw.to_string(),
    })
}

/// Turns raw rows into resolved rank records for one batch target.
pub struct RowParser<'a, S: RankStore + ?Sized> {
    resolver: ReferenceResolver<'a, S>,
    target: BatchTarget,
}

impl<'a, S: RankStore + ?Sized> RowParser<'a, S> {
    pub fn new(index: &'a mut ReferenceIndex, store: &'a S, target: BatchTarget) -> Self {
        Self {
            resolver: ReferenceResolver::new(index, store),
            target,
        }
    }

    pub fn target(&self) -> BatchTarget {
        self.target
    }

    pub fn index(&self) -> &ReferenceIndex {
        self.resolver.index()
    }

    pub async fn parse(&mut self, line: usize, record: Vec<String>) -> Result<RankRecord, RowParseError> {
        match self.parse_fields(&record).await {
            Ok(rank) => Ok(rank),
            Err(error) => Err(RowParseError {
                line,
                record: Some(record),
                error,
            }),
        }
    }

    async fn parse_fields(&mut self, fields: &[String]) -> Result<RankRecord, RowError> {
        if fields.len() < MIN_COLUMNS {
            return Err(RowError::MalformedRow {
                columns: fields.len(),
            });
        }

        let college_name = required(fields, COLLEGE_NAME, "college_name")?;
        let branch_code = required(fields, BRANCH_CODE, "branch_code")?;
        let branch_name = required(fields, BRANCH_NAME, "branch_name")?;

        let flag = fields[IS_CIWG].trim();
        let ciwg = parse_flag(flag).ok_or_else(|| RowError::InvalidFlag {
            value: flag.to_string(),
        })?;

        let first_rank = parse_rank(fields, FIRST_RANK, "first_rank")?;
        let last_rank = parse_rank(fields, LAST_RANK, "last_rank")?;

        let extra: ExtraIds = fields[EXTRA_ID]
            .parse()
            .map_err(|err: ExtraIdsError| RowError::InvalidExtraId { value: err.value })?;

        let college_ref = match extra.college_id() {
            Some(id) => CollegeRef::Id(id),
            None => CollegeRef::Name(college_name),
        };
        let branch_ref = match extra.branch_id() {
            Some(id) => BranchRef::Id(id),
            None => BranchRef::Triple {
                name: branch_name,
                code: branch_code,
                ciwg,
            },
        };

        let (college, branch) = self.resolver.resolve(college_ref, branch_ref).await?;

        Ok(RankRecord {
            id: None,
            year: self.target.year,
            round: self.target.round,
            primary: RankBounds::new(first_rank, last_rank),
            secondary: RankBounds::ZERO,
            college,
            branch,
        })
    }
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("upload is empty; expected a header line")]
    Missing,
    #[error("could not read header from upload: {0}")]
    Read(#[from] csv::Error),
}

/// CSV reader configured for uploads: no implicit header, ragged rows
/// allowed, fields trimmed.
pub fn upload_reader<R: io::Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input)
}

/// Consumes the header line. Its contents are not validated.
pub fn read_header<R: io::Read>(reader: &mut csv::Reader<R>) -> Result<Vec<String>, HeaderError> {
    let mut header = csv::StringRecord::new();
    if !reader.read_record(&mut header)? {
        return Err(HeaderError::Missing);
    }
    Ok(header.iter().map(str::to_string).collect())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub ranks: Vec<RankRecord>,
    pub errors: Vec<RowParseError>,
    /// Set when an I/O failure stopped iteration before the end of input.
    pub truncated: bool,
}

impl BatchOutcome {
    pub fn rows_seen(&self) -> usize {
        self.ranks.len() + self.errors.len()
    }
}

/// Runs every remaining record through `parser`.
///
/// Bad data never aborts the batch; only an I/O failure of the underlying
/// stream stops iteration, recorded as a terminal row error.
pub async fn parse_batch<R, S>(reader: &mut csv::Reader<R>, parser: &mut RowParser<'_, S>) -> BatchOutcome
where
    R: io::Read,
    S: RankStore + ?Sized,
{
    let mut outcome = BatchOutcome::default();
    let mut record = csv::StringRecord::new();
    let mut line = 0usize;

    loop {
        line += 1;
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                let fields = record.iter().map(str::to_string).collect();
                match parser.parse(line, fields).await {
                    Ok(rank) => outcome.ranks.push(rank),
                    Err(err) => {
                        warn!(line = err.file_line(), error = %err.error, "rejected upload row");
                        outcome.errors.push(err);
                    }
                }
            }
            Err(err) => {
                let fatal = matches!(err.kind(), csv::ErrorKind::Io(_));
                warn!(line = line + 1, error = %err, fatal, "could not read upload row");
                outcome.errors.push(RowParseError {
                    line,
                    record: None,
                    error: RowError::Read {
                        message: err.to_string(),
                    },
                });
                if fatal {
                    outcome.truncated = true;
                    break;
                }
            }
        }
    }

    debug!(
        parsed = outcome.ranks.len(),
        rejected = outcome.errors.len(),
        truncated = outcome.truncated,
        "parsed upload batch"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutoff_core::{Branch, College};
    use cutoff_store::MemoryStore;

    const TARGET: BatchTarget = BatchTarget {
        year: 2024,
        round: 2,
    };

    fn seeded_index() -> ReferenceIndex {
        ReferenceIndex::new(
            vec![
                College {
                    id: "7".into(),
                    name: "NIT Trichy".into(),
                    alias: "NITT".into(),
                },
                College {
                    id: "8".into(),
                    name: "NIT Warangal".into(),
                    alias: "NITW".into(),
                },
            ],
            vec![
                Branch {
                    id: "41".into(),
                    name: "Computer Science".into(),
                    code: "CS".into(),
                    ciwg: false,
                },
                Branch {
                    id: "42".into(),
                    name: "Electronics".into(),
                    code: "EC".into(),
                    ciwg: true,
                },
            ],
        )
    }

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    async fn parse_one(fields: &[&str]) -> Result<RankRecord, RowParseError> {
        let store = MemoryStore::new();
        let mut index = seeded_index();
        let mut parser = RowParser::new(&mut index, &store, TARGET);
        parser.parse(1, row(fields)).await
    }

    #[tokio::test]
    async fn valid_row_resolves_by_name() {
        let rank = parse_one(&["NIT Trichy", "CS", "Computer Science", "false", "120", "4500", ""])
            .await
            .unwrap();
        assert_eq!(rank.year, 2024);
        assert_eq!(rank.round, 2);
        assert_eq!(rank.college.id, "7");
        assert_eq!(rank.branch.id, "41");
        assert_eq!(rank.primary, RankBounds::new(120, 4500));
        assert_eq!(rank.secondary, RankBounds::ZERO);
    }

    #[tokio::test]
    async fn short_rows_report_column_count() {
        let err = parse_one(&["NIT Trichy", "CS", "Computer Science"]).await.unwrap_err();
        assert_eq!(err.error, RowError::MalformedRow { columns: 3 });
        assert_eq!(err.message(), "Malformed row with 3 columns");
        assert_eq!(err.file_line(), 2);
    }

    #[tokio::test]
    async fn first_failing_check_wins() {
        let err = parse_one(&["NIT Trichy", "", "", "maybe", "x", "y", "zz"]).await.unwrap_err();
        assert_eq!(err.error, RowError::EmptyField { field: "branch_code" });

        let err = parse_one(&["NIT Trichy", "CS", "Computer Science", "maybe", "x", "y", "zz"])
            .await
            .unwrap_err();
        assert_eq!(err.error, RowError::InvalidFlag { value: "maybe".into() });

        let err = parse_one(&["NIT Trichy", "CS", "Computer Science", "T", "10", "-5", "zz"])
            .await
            .unwrap_err();
        assert_eq!(
            err.error,
            RowError::InvalidRank {
                field: "last_rank",
                value: "-5".into()
            }
        );

        let err = parse_one(&["NIT Trichy", "CS", "Computer Science", "T", "10", "50", "zz"])
            .await
            .unwrap_err();
        assert_eq!(err.error, RowError::InvalidExtraId { value: "zz".into() });
        assert_eq!(err.record.as_ref().map(Vec::len), Some(7));
    }

    #[tokio::test]
    async fn extra_ids_bypass_name_lookup() {
        // Names point at NIT Warangal / CS, ids at NIT Trichy / EC.
        let rank = parse_one(&["NIT Warangal", "CS", "Computer Science", "false", "1", "2", "b-42:c-7"])
            .await
            .unwrap();
        assert_eq!(rank.college.id, "7");
        assert_eq!(rank.branch.id, "42");
        assert!(rank.branch.ciwg);
    }

    #[tokio::test]
    async fn college_override_lets_unknown_names_through() {
        let rank = parse_one(&["Some Old Name", "CS", "Computer Science", "0", "1", "2", "c-8"])
            .await
            .unwrap();
        assert_eq!(rank.college.name, "NIT Warangal");

        let err = parse_one(&["Some Old Name", "CS", "Computer Science", "0", "1", "2", ""])
            .await
            .unwrap_err();
        assert!(matches!(err.error, RowError::UnknownCollegeName { .. }));
    }

    #[tokio::test]
    async fn batch_collects_successes_and_errors_in_order() {
        let csv = "\
college_name,branch_code,branch_name,is_ciwg,first_rank,last_rank,extra_id
NIT Trichy,CS,Computer Science,false,10,500,
NIT Trichy,CS
NIT Warangal,ME,Mechanical,false,900,4000,
NIT Warangal,CS,Computer Science,false,abc,4000,
NIT Warangal,ME,Mechanical,false,950,4100,
";
        let store = MemoryStore::new();
        let mut index = seeded_index();
        let mut reader = upload_reader(csv.as_bytes());
        let header = read_header(&mut reader).unwrap();
        assert_eq!(header[0], "college_name");

        let mut parser = RowParser::new(&mut index, &store, TARGET);
        let outcome = parse_batch(&mut reader, &mut parser).await;

        assert!(!outcome.truncated);
        assert_eq!(outcome.rows_seen(), 5);
        let closes: Vec<u32> = outcome.ranks.iter().map(|r| r.primary.close).collect();
        assert_eq!(closes, vec![500, 4000, 4100]);
        let lines: Vec<usize> = outcome.errors.iter().map(|e| e.file_line()).collect();
        assert_eq!(lines, vec![3, 5]);

        // Mechanical was created once and reused by the later row.
        assert_eq!(store.branches().await.len(), 1);
        assert_eq!(outcome.ranks[1].branch.id, outcome.ranks[2].branch.id);
        assert_eq!(index.created_branches().len(), 1);
    }

    #[test]
    fn empty_upload_has_no_header() {
        let mut reader = upload_reader("".as_bytes());
        assert!(matches!(read_header(&mut reader), Err(HeaderError::Missing)));
    }

    #[tokio::test]
    async fn invalid_utf8_row_is_recorded_and_skipped() {
        let mut bytes = b"h\nNIT Trichy,CS,Computer Science,false,10,500,\n".to_vec();
        bytes.extend_from_slice(b"NIT \xff,CS,Computer Science,false,10,500,\n");
        bytes.extend_from_slice(b"NIT Warangal,CS,Computer Science,false,20,600,\n");

        let store = MemoryStore::new();
        let mut index = seeded_index();
        let mut reader = upload_reader(bytes.as_slice());
        read_header(&mut reader).unwrap();
        let mut parser = RowParser::new(&mut index, &store, TARGET);
        let outcome = parse_batch(&mut reader, &mut parser).await;

        assert_eq!(outcome.ranks.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].file_line(), 3);
        assert!(matches!(outcome.errors[0].error, RowError::Read { .. }));
        assert!(!outcome.truncated);
    }

    struct FailingAfter<'a> {
        data: &'a [u8],
    }

    impl io::Read for FailingAfter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "upload stream reset"));
            }
            let n = buf.len().min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[tokio::test]
    async fn stream_failure_stops_iteration_with_terminal_error() {
        let input = FailingAfter {
            data: b"h\nNIT Trichy,CS,Computer Science,false,10,500,\n",
        };
        let store = MemoryStore::new();
        let mut index = seeded_index();
        let mut reader = upload_reader(input);
        read_header(&mut reader).unwrap();
        let mut parser = RowParser::new(&mut index, &store, TARGET);
        let outcome = parse_batch(&mut reader, &mut parser).await;

        assert!(outcome.truncated);
        assert_eq!(outcome.ranks.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].message().starts_with("Error reading record"));
    }

    #[test]
    fn flag_literals_follow_parse_bool() {
        for yes in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_flag(yes), Some(true));
        }
        for no in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_flag(no), Some(false));
        }
        assert_eq!(parse_flag("yes"), None);
        assert_eq!(parse_flag("tRuE"), None);
    }
}
