// Tests for the harvest worker pool

use async_trait::async_trait;
use canopy_core::checkpoint::CheckpointStore;
use canopy_core::harvest::{HarvestOptions, Orchestrator, SessionFactory};
use canopy_core::model::HarvestRecord;
use canopy_core::telemetry::TelemetrySnapshot;
use canopy_scanner::{Entity, FetchOutcome, Identity, PoliteDelay, RetryPolicy, ScanError, Target, Transport};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ============================================================================
// Mock sessions
// ============================================================================

#[derive(Clone, Default)]
struct MockFactory {
    calls: Arc<AtomicUsize>,
    failing_ids: HashSet<String>,
    broken_workers: HashSet<usize>,
    /// Raise `stop` once this many attempts have been made.
    stop_after: Option<(usize, Arc<AtomicBool>)>,
    closed: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    /// Number of `open` calls that fail before sessions start working.
    failed_opens: usize,
    /// Another process saving these ids while the first fetch is in flight.
    saved_elsewhere: Option<(CheckpointStore, Vec<String>)>,
}

fn saved_record(id: &str) -> HarvestRecord {
    HarvestRecord {
        id: id.to_string(),
        url: format!("http://mock.test/taxa/{}", id),
        scraped_at: Utc::now(),
        raw_content: "<html></html>".to_string(),
        structured: None,
    }
}

struct MockTransport {
    factory: MockFactory,
}

#[async_trait]
impl SessionFactory for MockFactory {
    type Transport = MockTransport;

    async fn open(&self, worker_id: usize, _identity: &Identity) -> Result<MockTransport, ScanError> {
        let opened = self.opens.fetch_add(1, Ordering::SeqCst);
        if self.broken_workers.contains(&worker_id) || opened < self.failed_opens {
            return Err(ScanError::Browser(format!("worker {} failed to launch", worker_id)));
        }
        Ok(MockTransport {
            factory: self.clone(),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn attempt(&mut self, target: &Target) -> FetchOutcome {
        let made = self.factory.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, stop)) = &self.factory.stop_after
            && made >= *limit
        {
            stop.store(true, Ordering::SeqCst);
        }

        let id = target.url.rsplit('/').next().unwrap_or_default().to_string();
        if made == 1
            && let Some((store, ids)) = &self.factory.saved_elsewhere
        {
            for other in ids.iter().filter(|other| **other != id) {
                store.commit(&saved_record(other)).unwrap();
            }
        }
        if self.factory.failing_ids.contains(&id) {
            return FetchOutcome::ServerError(500);
        }
        FetchOutcome::success(format!(
            r#"<div id="TaxonDetail"><div id="TaxonHeader"><h1><span class="comname">Bird {id}</span><span class="sciname">Avis {id}</span></h1></div></div>"#
        ))
    }

    async fn close(&mut self) {
        self.factory.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn entities(count: usize) -> Vec<Entity> {
    (1..=count)
        .map(|i| Entity {
            id: i.to_string(),
            name: format!("Bird {}", i),
            scientific_name: format!("Avis {}", i),
            parent_family: "Anatidae".to_string(),
            parent_order: "Anseriformes".to_string(),
            detail_url: format!("http://mock.test/taxa/{}", i),
            api_image_url: None,
        })
        .collect()
}

fn options() -> HarvestOptions {
    HarvestOptions {
        report_every: 2,
        retry: RetryPolicy::from_secs(&[0, 0, 0]),
        delay: PoliteDelay::none(),
        ready_selector: None,
        seed: Some(7),
        ..HarvestOptions::default()
    }
}

fn store(dir: &TempDir) -> CheckpointStore {
    CheckpointStore::open(dir.path().join("pages")).unwrap()
}

// ============================================================================
// Runs
// ============================================================================

#[tokio::test]
async fn test_end_to_end_counts() {
    let dir = TempDir::new().unwrap();
    let checkpoint = store(&dir);
    checkpoint.commit(&saved_record("1")).unwrap();

    let factory = MockFactory {
        failing_ids: HashSet::from(["5".to_string()]),
        ..MockFactory::default()
    };
    let calls = factory.calls.clone();
    let progress_calls = Arc::new(AtomicUsize::new(0));
    let progress_clone = progress_calls.clone();

    let orchestrator = Orchestrator::new(factory, checkpoint.clone(), options())
        .with_progress_callback(Arc::new(move |_snap: &TelemetrySnapshot| {
            progress_clone.fetch_add(1, Ordering::SeqCst);
        }));
    let snap = orchestrator.run(entities(5), 2).await.unwrap();

    assert_eq!(snap.ok, 3);
    assert_eq!(snap.error, 1);
    assert_eq!(snap.skipped, 1);
    assert_eq!(snap.resumed, 1);
    assert_eq!(snap.not_found, 0);
    // Three successes plus the full schedule for the failing one.
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(progress_calls.load(Ordering::SeqCst), 4);

    assert!(!checkpoint.is_done("5"));
    let stored = checkpoint.load("2").unwrap();
    assert_eq!(stored.url, "http://mock.test/taxa/2");
    let structured = stored.structured.unwrap();
    assert_eq!(structured.common_name.as_deref(), Some("Bird 2"));
    assert_eq!(structured.source_id.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_second_run_fetches_nothing() {
    let dir = TempDir::new().unwrap();
    let checkpoint = store(&dir);

    let first = MockFactory::default();
    let snap = Orchestrator::new(first, checkpoint.clone(), options())
        .run(entities(6), 3)
        .await
        .unwrap();
    assert_eq!(snap.ok, 6);

    let second = MockFactory::default();
    let calls = second.calls.clone();
    let snap = Orchestrator::new(second, checkpoint.clone(), options())
        .run(entities(6), 3)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(snap.ok, 0);
    assert_eq!(snap.skipped, 6);
    assert_eq!(snap.resumed, 6);
}

#[tokio::test]
async fn test_interrupted_run_resumes_to_same_artifacts() {
    let reference_dir = TempDir::new().unwrap();
    let reference = store(&reference_dir);
    Orchestrator::new(MockFactory::default(), reference.clone(), options())
        .run(entities(10), 2)
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let checkpoint = store(&dir);
    let stop = Arc::new(AtomicBool::new(false));
    let interrupted = MockFactory {
        stop_after: Some((3, stop.clone())),
        ..MockFactory::default()
    };
    let snap = Orchestrator::new(interrupted, checkpoint.clone(), options())
        .with_stop_signal(stop.clone())
        .run(entities(10), 2)
        .await
        .unwrap();
    assert!(stop.load(Ordering::SeqCst));
    assert!(snap.ok < 10);
    let partial = checkpoint.done_ids().unwrap().len();

    let snap = Orchestrator::new(MockFactory::default(), checkpoint.clone(), options())
        .run(entities(10), 2)
        .await
        .unwrap();
    assert_eq!(snap.resumed as usize, partial);
    assert_eq!(snap.ok as usize, 10 - partial);

    assert_eq!(checkpoint.done_ids().unwrap(), reference.done_ids().unwrap());
}

#[tokio::test]
async fn test_duplicate_entities_are_fetched_once() {
    let dir = TempDir::new().unwrap();
    let mut input = entities(3);
    input.extend(entities(3));

    let factory = MockFactory::default();
    let calls = factory.calls.clone();
    let snap = Orchestrator::new(factory, store(&dir), options())
        .run(input, 2)
        .await
        .unwrap();

    assert_eq!(snap.ok, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_failed_session_only_fails_its_own_items() {
    let dir = TempDir::new().unwrap();
    let factory = MockFactory {
        broken_workers: HashSet::from([0]),
        ..MockFactory::default()
    };
    let closed = factory.closed.clone();

    let snap = Orchestrator::new(factory, store(&dir), options())
        .run(entities(4), 2)
        .await
        .unwrap();

    assert_eq!(snap.ok, 2);
    assert_eq!(snap.error, 2);
    // Only the worker that opened a session has one to close.
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_open_is_retried() {
    let dir = TempDir::new().unwrap();
    let checkpoint = store(&dir);
    let factory = MockFactory {
        failed_opens: 1,
        ..MockFactory::default()
    };
    let opens = factory.opens.clone();
    let closed = factory.closed.clone();

    let snap = Orchestrator::new(factory, checkpoint.clone(), options())
        .run(entities(3), 1)
        .await
        .unwrap();

    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert_eq!(snap.ok, 3);
    assert_eq!(snap.error, 0);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(checkpoint.done_ids().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_session_open_waits_out_the_schedule() {
    let dir = TempDir::new().unwrap();
    let factory = MockFactory {
        broken_workers: HashSet::from([0]),
        ..MockFactory::default()
    };
    let opens = factory.opens.clone();
    let options = HarvestOptions {
        retry: RetryPolicy::from_secs(&[0, 5, 15]),
        ..options()
    };

    let started = tokio::time::Instant::now();
    let snap = Orchestrator::new(factory, store(&dir), options)
        .run(entities(2), 1)
        .await
        .unwrap();

    assert_eq!(opens.load(Ordering::SeqCst), 3);
    assert_eq!(snap.error, 2);
    assert!(started.elapsed() >= std::time::Duration::from_secs(20));
}

#[tokio::test]
async fn test_items_saved_elsewhere_still_report_progress() {
    let dir = TempDir::new().unwrap();
    let checkpoint = store(&dir);
    let ids: Vec<String> = (1..=4).map(|i| i.to_string()).collect();
    let factory = MockFactory {
        saved_elsewhere: Some((checkpoint.clone(), ids)),
        ..MockFactory::default()
    };
    let calls = factory.calls.clone();
    let progress_calls = Arc::new(AtomicUsize::new(0));
    let progress_clone = progress_calls.clone();

    let snap = Orchestrator::new(factory, checkpoint.clone(), options())
        .with_progress_callback(Arc::new(move |_snap: &TelemetrySnapshot| {
            progress_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .run(entities(4), 1)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(snap.ok, 1);
    assert_eq!(snap.skipped, 3);
    assert_eq!(snap.resumed, 0);
    assert_eq!(progress_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_sessions_are_closed() {
    let dir = TempDir::new().unwrap();
    let factory = MockFactory::default();
    let closed = factory.closed.clone();

    Orchestrator::new(factory, store(&dir), options())
        .run(entities(9), 3)
        .await
        .unwrap();

    assert_eq!(closed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_empty_input() {
    let dir = TempDir::new().unwrap();
    let snap = Orchestrator::new(MockFactory::default(), store(&dir), options())
        .run(Vec::new(), 4)
        .await
        .unwrap();

    assert_eq!(snap.ok + snap.error + snap.skipped, 0);
}

#[tokio::test]
async fn test_not_found_counts_as_error() {
    struct MissingFactory {
        seen: Arc<Mutex<Vec<String>>>,
    }

    struct MissingTransport {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SessionFactory for MissingFactory {
        type Transport = MissingTransport;

        async fn open(&self, _worker_id: usize, _identity: &Identity) -> Result<MissingTransport, ScanError> {
            Ok(MissingTransport {
                seen: self.seen.clone(),
            })
        }
    }

    #[async_trait]
    impl Transport for MissingTransport {
        async fn attempt(&mut self, target: &Target) -> FetchOutcome {
            self.seen.lock().unwrap().push(target.url.clone());
            FetchOutcome::NotFound
        }
    }

    let dir = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let snap = Orchestrator::new(MissingFactory { seen: seen.clone() }, store(&dir), options())
        .run(entities(2), 1)
        .await
        .unwrap();

    assert_eq!(snap.error, 2);
    assert_eq!(snap.not_found, 2);
    // 404 is never retried.
    assert_eq!(seen.lock().unwrap().len(), 2);
}
