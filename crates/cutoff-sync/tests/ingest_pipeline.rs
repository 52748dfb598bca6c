use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use cutoff_core::{BackupDescriptor, Branch, College};
use cutoff_parse::{BatchTarget, RowError};
use cutoff_store::MemoryStore;
use cutoff_sync::{IngestConfig, IngestPipeline, IngestRequest, UploadSource};

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample_upload.csv")
}

fn college(id: &str, name: &str, alias: &str) -> College {
    College {
        id: id.into(),
        name: name.into(),
        alias: alias.into(),
    }
}

fn branch(id: &str, name: &str, code: &str) -> Branch {
    Branch {
        id: id.into(),
        name: name.into(),
        code: code.into(),
        ciwg: false,
    }
}

fn seeded_store() -> MemoryStore {
    let old = |day: u32, key: &str| BackupDescriptor {
        key: key.into(),
        modified: Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).single().unwrap(),
        size: 1024,
    };
    MemoryStore::new()
        .with_colleges(vec![
            college("nitt", "National Institute of Technology, Trichy", "NITT,NIT Trichy"),
            college("nitw", "National Institute of Technology Warangal", "NITW"),
            college("nitk", "National Institute of Technology Karnataka Surathkal", "NITK"),
        ])
        .with_branches(vec![
            branch("b-cs", "Computer Science and Engineering", "CS"),
            branch("b-ec", "Electronics and Communication Engineering", "EC"),
        ])
        .with_backups(vec![
            old(3, "ops_03_01_2026_12_00_00.zip"),
            old(1, "ops_01_01_2026_12_00_00.zip"),
            old(4, "ops_04_01_2026_12_00_00.zip"),
            old(2, "ops_02_01_2026_12_00_00.zip"),
        ])
}

#[tokio::test]
async fn fixture_upload_is_ingested_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let upload = dir.path().join("round1.csv");
    std::fs::copy(fixture_path(), &upload).unwrap();

    let store = Arc::new(seeded_store());
    let pipeline = IngestPipeline::new(Arc::clone(&store), IngestConfig::default());
    let summary = pipeline
        .run(IngestRequest {
            actor: "Seat.Matrix-Admin".into(),
            target: BatchTarget { year: 2025, round: 1 },
            upload: UploadSource::Path(upload),
        })
        .await
        .unwrap();

    // Backup rotation: oldest of four dropped, one new created.
    assert_eq!(summary.backup.deleted.as_deref(), Some("ops_01_01_2026_12_00_00.zip"));
    assert!(summary.backup.created.starts_with("seatmatrixadmin_"));
    assert_eq!(store.backups().await.len(), 4);

    assert_eq!(summary.parsed_rows, 6);
    assert_eq!(summary.upsert.created, 6);
    assert!(summary.upsert.is_success());
    assert!(!summary.truncated);
    assert!(!summary.is_success());

    let lines: Vec<usize> = summary.row_errors.iter().map(|e| e.file_line()).collect();
    assert_eq!(lines, vec![8, 9, 10, 11]);
    match &summary.row_errors[0].error {
        RowError::UnknownCollegeName { suggestion, .. } => assert_eq!(
            suggestion.as_deref(),
            Some("National Institute of Technology Warangal")
        ),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(summary.row_errors[1].error, RowError::MalformedRow { columns: 2 });
    assert!(matches!(summary.row_errors[2].error, RowError::InvalidFlag { .. }));
    assert!(matches!(summary.row_errors[3].error, RowError::UnknownBranchId { .. }));

    // Mechanical was created once per category flag.
    let created: Vec<(&str, bool)> = summary
        .created_branches
        .iter()
        .map(|b| (b.code.as_str(), b.ciwg))
        .collect();
    assert_eq!(created, vec![("ME", false), ("ME", true)]);

    let ranks = store.ranks().await;
    assert_eq!(ranks.len(), 6);
    assert!(ranks.iter().all(|r| r.year_round() == (2025, 1) && r.secondary.is_zero()));
    assert!(ranks.iter().any(|r| r.college.id == "nitk" && r.primary.close == 2600));

    let report = summary.row_error_report(10);
    assert!(report.starts_with("Line Number: 8\n"));
    assert_eq!(summary.upsert_failure_report(10), "");
    assert_eq!(summary.upload_sha256.len(), 64);
}

#[tokio::test]
async fn reingesting_the_same_upload_creates_nothing() {
    let bytes = std::fs::read(fixture_path()).unwrap();
    let store = Arc::new(seeded_store());
    let pipeline = IngestPipeline::new(Arc::clone(&store), IngestConfig::default());
    let request = IngestRequest {
        actor: "admin".into(),
        target: BatchTarget { year: 2025, round: 2 },
        upload: UploadSource::Bytes(bytes),
    };

    let first = pipeline.run(request.clone()).await.unwrap();
    let second = pipeline.run(request).await.unwrap();

    assert_eq!(first.upsert.created, 6);
    assert_eq!(second.upsert.created, 0);
    assert_eq!(second.upsert.skipped, 6);
    assert!(second.created_branches.is_empty());
    assert_eq!(first.upload_sha256, second.upload_sha256);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(store.ranks().await.len(), 6);
    assert_eq!(store.branches().await.len(), 4);
}
