// Tests for the file-presence checkpoint and stage files

use canopy_core::checkpoint::CheckpointStore;
use canopy_core::model::HarvestRecord;
use canopy_core::stage::{ORDERS_STAGE, StageStore, plan_stage};
use canopy_core::HarvestError;
use canopy_scanner::OrderRecord;
use chrono::Utc;
use std::fs;
use tempfile::TempDir;

fn record(id: &str, body: &str) -> HarvestRecord {
    HarvestRecord {
        id: id.to_string(),
        url: format!("https://www.inaturalist.org/taxa/{}", id),
        scraped_at: Utc::now(),
        raw_content: body.to_string(),
        structured: None,
    }
}

// ============================================================================
// CheckpointStore
// ============================================================================

#[test]
fn test_open_creates_directory() {
    let dir = TempDir::new().unwrap();
    let pages = dir.path().join("bronze").join("pages");
    let store = CheckpointStore::open(&pages).unwrap();
    assert!(pages.is_dir());
    assert_eq!(store.dir(), pages.as_path());
}

#[test]
fn test_open_fails_when_path_is_a_file() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("pages");
    fs::write(&file, "not a dir").unwrap();

    let result = CheckpointStore::open(&file);
    assert!(matches!(result, Err(HarvestError::OutputDir { .. })));
}

#[test]
fn test_commit_marks_done() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();

    assert!(!store.is_done("6930"));
    assert!(store.commit(&record("6930", "<html>duck</html>")).unwrap());
    assert!(store.is_done("6930"));

    let loaded = store.load("6930").unwrap();
    assert_eq!(loaded.raw_content, "<html>duck</html>");
}

#[test]
fn test_commit_never_overwrites() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();

    assert!(store.commit(&record("1", "first")).unwrap());
    assert!(!store.commit(&record("1", "second")).unwrap());
    assert_eq!(store.load("1").unwrap().raw_content, "first");
}

#[test]
fn test_commit_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    store.commit(&record("1", "a")).unwrap();
    store.commit(&record("2", "b")).unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| n.ends_with(".json") && !n.starts_with('.')));
}

#[test]
fn test_artifacts_ignore_foreign_files() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    store.commit(&record("2", "b")).unwrap();
    store.commit(&record("1", "a")).unwrap();
    fs::write(dir.path().join(".1.json.abcd.tmp"), "partial").unwrap();
    fs::write(dir.path().join("notes.txt"), "hello").unwrap();

    let artifacts = store.artifacts().unwrap();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts[0].ends_with("1.json"));

    let ids = store.done_ids().unwrap();
    assert!(ids.contains("1") && ids.contains("2"));
}

#[test]
fn test_older_page_format_is_read() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    fs::write(
        store.path_for("42"),
        r#"{"id": "42", "url": "https://www.inaturalist.org/taxa/42", "scraped_at": 1712345678.12, "raw_html_content": "<p>old</p>"}"#,
    )
    .unwrap();

    let loaded = store.load("42").unwrap();
    assert_eq!(loaded.raw_content, "<p>old</p>");
    assert_eq!(loaded.scraped_at.timestamp_millis(), 1_712_345_678_120);
    assert!(loaded.structured.is_none());
}

#[test]
fn test_scraped_at_accepts_rfc3339_and_integer_epoch() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    fs::write(
        store.path_for("1"),
        r#"{"id": "1", "url": "u", "scraped_at": "2025-01-01T10:00:00Z", "raw_content": "a"}"#,
    )
    .unwrap();
    fs::write(
        store.path_for("2"),
        r#"{"id": "2", "url": "u", "scraped_at": 1700000000, "raw_content": "b"}"#,
    )
    .unwrap();
    fs::write(
        store.path_for("3"),
        r#"{"id": "3", "url": "u", "scraped_at": "yesterday", "raw_content": "c"}"#,
    )
    .unwrap();

    assert_eq!(store.load("1").unwrap().scraped_at.timestamp(), 1_735_725_600);
    assert_eq!(store.load("2").unwrap().scraped_at.timestamp(), 1_700_000_000);
    assert!(store.load("3").is_err());
}

#[test]
fn test_committed_record_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    let original = record("5", "x");
    store.commit(&original).unwrap();
    assert_eq!(store.load("5").unwrap(), original);
}

#[test]
fn test_ids_differing_only_in_symbols_do_not_collide() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();

    store.commit(&record("a/b", "slashed")).unwrap();
    assert!(store.is_done("a/b"));
    assert!(!store.is_done("ab"));

    assert!(store.commit(&record("ab", "plain")).unwrap());
    assert_eq!(store.load("a/b").unwrap().raw_content, "slashed");
    assert_eq!(store.load("ab").unwrap().raw_content, "plain");

    let ids = store.done_ids().unwrap();
    assert!(ids.contains("a/b") && ids.contains("ab"));
}

#[test]
fn test_remove() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    store.commit(&record("7", "x")).unwrap();
    store.remove("7").unwrap();
    assert!(!store.is_done("7"));
}

// ============================================================================
// StageStore
// ============================================================================

#[test]
fn test_stage_round_trip() {
    let dir = TempDir::new().unwrap();
    let stages = StageStore::open(dir.path().join("0_planning")).unwrap();
    let orders = vec![OrderRecord {
        id: "6912".to_string(),
        name: "Anseriformes".to_string(),
        url: "https://www.inaturalist.org/taxa/6912".to_string(),
    }];

    let path = stages.write(ORDERS_STAGE, &orders).unwrap();
    assert!(path.ends_with("1_orders.json"));
    assert!(stages.exists(ORDERS_STAGE));

    let back: Vec<OrderRecord> = stages.read(ORDERS_STAGE).unwrap();
    assert_eq!(back, orders);

    // Pretty-printed for hand inspection.
    assert!(fs::read_to_string(path).unwrap().contains("\n  "));
}

#[test]
fn test_missing_stage_is_input_error() {
    let dir = TempDir::new().unwrap();
    let stages = StageStore::open(dir.path()).unwrap();
    let result: Result<Vec<OrderRecord>, _> = stages.read(&plan_stage("3"));
    assert!(matches!(result, Err(HarvestError::Input { .. })));
}
