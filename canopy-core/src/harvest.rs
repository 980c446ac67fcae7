use crate::checkpoint::CheckpointStore;
use crate::error::Result;
use crate::extract::extract_harvest;
use crate::model::{HarvestRecord, WorkItem};
use crate::telemetry::{Telemetry, TelemetrySnapshot, format_duration};
use async_trait::async_trait;
use canopy_scanner::{
    BrowserOptions, BrowserTransport, ChromeDriver, Entity, FetchResult, Fetcher, HttpTransport,
    Identity, IdentityPool, PoliteDelay, RetryPolicy, ScanError, Target, Transport,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Opens the per-worker session a transport lives in.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn open(
        &self,
        worker_id: usize,
        identity: &Identity,
    ) -> std::result::Result<Self::Transport, ScanError>;
}

/// One reqwest client per worker.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    pub timeout: Duration,
}

impl Default for HttpSessionFactory {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    type Transport = HttpTransport;

    async fn open(
        &self,
        _worker_id: usize,
        identity: &Identity,
    ) -> std::result::Result<HttpTransport, ScanError> {
        HttpTransport::new(identity, self.timeout)
    }
}

/// One Chrome process per worker.
#[derive(Debug, Clone)]
pub struct BrowserSessionFactory {
    pub options: BrowserOptions,
    pub ready_timeout: Duration,
}

#[async_trait]
impl SessionFactory for BrowserSessionFactory {
    type Transport = BrowserTransport<ChromeDriver>;

    async fn open(
        &self,
        worker_id: usize,
        identity: &Identity,
    ) -> std::result::Result<Self::Transport, ScanError> {
        let driver = ChromeDriver::launch(worker_id, identity.clone(), self.options.clone()).await?;
        Ok(BrowserTransport::new(driver, self.ready_timeout))
    }
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Completions between two progress log lines.
    pub report_every: u64,
    pub retry: RetryPolicy,
    pub delay: PoliteDelay,
    pub attempt_timeout: Duration,
    /// Rendered fetches wait for this selector; `None` fetches over plain HTTP.
    pub ready_selector: Option<String>,
    /// Seeds the shuffle, identity assignment and per-worker jitter.
    pub seed: Option<u64>,
    /// Store the extracted record next to the raw page.
    pub extract: bool,
    /// Rotation set; empty means the built-in profiles.
    pub identities: Vec<Identity>,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            report_every: 20,
            retry: RetryPolicy::default(),
            delay: PoliteDelay::default(),
            attempt_timeout: Duration::from_secs(30),
            ready_selector: Some("#TaxonDetail".to_string()),
            seed: None,
            extract: true,
            identities: Vec::new(),
        }
    }
}

/// Called after every terminal item with the current counters.
pub type HarvestProgressCallback = Arc<dyn Fn(&TelemetrySnapshot) + Send + Sync>;

/// Everything a worker owns: who it pretends to be and the fetcher that
/// carries its transport.
pub struct WorkerContext<T: Transport> {
    pub worker_id: usize,
    pub identity: Identity,
    pub fetcher: Fetcher<T>,
}

/// State every worker reads or bumps.
struct Shared {
    checkpoint: CheckpointStore,
    telemetry: Telemetry,
    options: HarvestOptions,
    stop: Arc<AtomicBool>,
    progress: Option<HarvestProgressCallback>,
}

impl Shared {
    fn target_for(&self, entity: &Entity) -> Target {
        match &self.options.ready_selector {
            Some(selector) => Target::rendered(&entity.detail_url, selector),
            None => Target::http(&entity.detail_url),
        }
    }

    fn completed(&self, fetched: u64) {
        let every = self.options.report_every.max(1);
        if fetched % every == 0 {
            let snap = self.telemetry.snapshot();
            let eta = snap
                .eta()
                .map(format_duration)
                .unwrap_or_else(|| "unknown".to_string());
            info!(
                "Progress: {} ok, {} errors, {} skipped | {:.2} items/s | error rate {:.1}% | ETA {}",
                snap.ok,
                snap.error,
                snap.skipped,
                snap.rate,
                snap.error_rate() * 100.0,
                eta
            );
        }
        self.notify();
    }

    fn notify(&self) {
        if let Some(ref callback) = self.progress {
            callback(&self.telemetry.snapshot());
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Fans entities out over a fixed pool of workers and drives them to a
/// terminal outcome.
pub struct Orchestrator<F: SessionFactory> {
    factory: Arc<F>,
    checkpoint: CheckpointStore,
    options: HarvestOptions,
    stop: Arc<AtomicBool>,
    progress: Option<HarvestProgressCallback>,
}

impl<F: SessionFactory> Orchestrator<F> {
    pub fn new(factory: F, checkpoint: CheckpointStore, options: HarvestOptions) -> Self {
        Self {
            factory: Arc::new(factory),
            checkpoint,
            options,
            stop: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Workers stop picking up items once this flag is set.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_progress_callback(mut self, callback: HarvestProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Shuffle, drop duplicates and already-checkpointed entities, then hand
    /// the rest out round-robin.
    fn plan(&self, mut entities: Vec<Entity>, workers: usize) -> (Vec<VecDeque<WorkItem>>, u64) {
        let mut rng = match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        entities.shuffle(&mut rng);

        let mut seen = HashSet::new();
        let mut resumed = 0u64;
        let mut queues: Vec<VecDeque<WorkItem>> = vec![VecDeque::new(); workers];
        let mut next = 0usize;

        for entity in entities {
            if !seen.insert(entity.id.clone()) {
                debug!("Duplicate entity {} dropped", entity.id);
                continue;
            }
            if self.checkpoint.is_done(&entity.id) {
                resumed += 1;
                continue;
            }
            let worker_id = next % workers;
            queues[worker_id].push_back(WorkItem::new(entity, worker_id));
            next += 1;
        }

        (queues, resumed)
    }

    pub async fn run(&self, entities: Vec<Entity>, workers: usize) -> Result<TelemetrySnapshot> {
        let workers = workers.max(1);
        let total = entities.len();
        let (queues, resumed) = self.plan(entities, workers);
        let planned: usize = queues.iter().map(VecDeque::len).sum();

        let shared = Arc::new(Shared {
            checkpoint: self.checkpoint.clone(),
            telemetry: Telemetry::new(),
            options: self.options.clone(),
            stop: self.stop.clone(),
            progress: self.progress.clone(),
        });
        shared.telemetry.set_planned(planned as u64);
        shared.telemetry.record_resumed(resumed);

        info!(
            "Harvest: {} entities, {} already done, {} to fetch on {} workers",
            total, resumed, planned, workers
        );
        if planned == 0 {
            return Ok(shared.telemetry.snapshot());
        }

        let pool = IdentityPool::new(self.options.identities.clone(), workers, self.options.seed);
        let mut handles = Vec::with_capacity(workers);

        for (worker_id, queue) in queues.into_iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            let identity = pool.identity_for(worker_id).clone();
            let factory = self.factory.clone();
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                run_worker(factory, worker_id, identity, queue, shared).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        let snap = shared.telemetry.snapshot();
        info!(
            "Harvest finished: {} ok, {} errors ({} not found), {} skipped in {}",
            snap.ok,
            snap.error,
            snap.not_found,
            snap.skipped,
            format_duration(snap.elapsed)
        );
        Ok(snap)
    }
}

/// Open a worker's session, waiting out the retry schedule between failed
/// attempts. Gives up early once a stop is requested.
async fn open_session<F: SessionFactory>(
    factory: &F,
    worker_id: usize,
    identity: &Identity,
    shared: &Shared,
) -> std::result::Result<F::Transport, ScanError> {
    let schedule = shared.options.retry.schedule();
    let mut last_error = None;

    for (attempt, wait) in schedule.iter().enumerate() {
        if attempt > 0 && shared.stopping() {
            break;
        }
        if !wait.is_zero() {
            tokio::time::sleep(*wait).await;
        }
        match factory.open(worker_id, identity).await {
            Ok(transport) => {
                if attempt > 0 {
                    info!("Worker {} opened its session on attempt {}", worker_id, attempt + 1);
                }
                return Ok(transport);
            }
            Err(e) => {
                warn!(
                    "Worker {} session attempt {}/{} failed: {}",
                    worker_id,
                    attempt + 1,
                    schedule.len(),
                    e
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ScanError::Other("stopped before opening a session".to_string())))
}

async fn run_worker<F: SessionFactory>(
    factory: Arc<F>,
    worker_id: usize,
    identity: Identity,
    mut queue: VecDeque<WorkItem>,
    shared: Arc<Shared>,
) {
    let transport = match open_session(factory.as_ref(), worker_id, &identity, &shared).await {
        Ok(transport) => transport,
        Err(e) => {
            error!(
                "Worker {} could not open its session: {} ({} items failed)",
                worker_id,
                e,
                queue.len()
            );
            while queue.pop_front().is_some() {
                let fetched = shared.telemetry.record_error(false);
                shared.completed(fetched);
            }
            return;
        }
    };

    let options = &shared.options;
    let mut fetcher = Fetcher::new(transport)
        .with_policy(options.retry.clone())
        .with_delay(options.delay)
        .with_attempt_timeout(options.attempt_timeout);
    if let Some(seed) = options.seed {
        fetcher = fetcher.with_seed(seed.wrapping_add(worker_id as u64));
    }

    let mut ctx = WorkerContext {
        worker_id,
        identity,
        fetcher,
    };
    debug!("Worker {} started as {}", ctx.worker_id, ctx.identity.user_agent);

    while let Some(mut item) = queue.pop_front() {
        if shared.stopping() {
            info!(
                "Worker {} stopping, {} items left for the next run",
                ctx.worker_id,
                queue.len() + 1
            );
            break;
        }

        let id = item.entity.id.clone();
        if shared.checkpoint.is_done(&id) {
            debug!("{} checkpointed meanwhile, skipping", id);
            shared.telemetry.record_skipped();
            shared.notify();
            continue;
        }

        let target = shared.target_for(&item.entity);
        let report = ctx.fetcher.fetch(&target).await;
        item.attempts = report.attempts;

        let fetched = match report.result {
            FetchResult::Success {
                content,
                fetched_at,
            } => persist(&shared, &item, content, fetched_at),
            FetchResult::NotFound => {
                warn!("{} ({}) not found", item.entity.name, id);
                shared.telemetry.record_error(true)
            }
            FetchResult::Failed(last) => {
                warn!(
                    "{} ({}) failed after {} attempts: {}",
                    item.entity.name,
                    id,
                    item.attempts,
                    last.label()
                );
                shared.telemetry.record_error(false)
            }
        };
        shared.completed(fetched);
    }

    ctx.fetcher.close().await;
    debug!("Worker {} done", ctx.worker_id);
}

fn persist(
    shared: &Shared,
    item: &WorkItem,
    content: String,
    fetched_at: chrono::DateTime<chrono::Utc>,
) -> u64 {
    let mut record = HarvestRecord {
        id: item.entity.id.clone(),
        url: item.entity.detail_url.clone(),
        scraped_at: fetched_at,
        raw_content: content,
        structured: None,
    };

    if shared.options.extract {
        let report = extract_harvest(&record);
        if !report.missing.is_empty() {
            warn!(
                "{}: sections missing from page: {}",
                record.id,
                report.missing.join(", ")
            );
        }
        record.structured = Some(report.record);
    }

    match shared.checkpoint.commit(&record) {
        Ok(_) => {
            debug!("{} saved after {} attempts", record.id, item.attempts);
            shared.telemetry.record_ok()
        }
        Err(e) => {
            error!("Could not save {}: {}", record.id, e);
            shared.telemetry.record_error(false)
        }
    }
}
