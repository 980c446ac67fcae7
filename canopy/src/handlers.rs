use anyhow::{Context as _, Result, bail};
use canopy_core::checkpoint::CheckpointStore;
use canopy_core::config::HarvestConfig;
use canopy_core::harvest::{
    BrowserSessionFactory, HarvestProgressCallback, HttpSessionFactory, Orchestrator,
    SessionFactory,
};
use canopy_core::layout::DataLayout;
use canopy_core::purge::purge_rate_limited;
use canopy_core::refine::refine_all;
use canopy_core::report::{
    HarvestSummary, ReportFormat, generate_json_report, generate_text_report, save_report,
};
use canopy_core::stage::{FAMILIES_STAGE, ORDERS_STAGE, SPECIES_STAGE, StageStore, plan_stage};
use canopy_core::telemetry::TelemetrySnapshot;
use canopy_scanner::{
    BrowserOptions, ChromeDriver, Entity, FamilyRecord, Fetcher, HierarchyWalker, HttpTransport,
    Identity, IdentityPool, OrderRecord, list_all,
};
use chrono::Utc;
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const SUMMARY_FILE: &str = "harvest_summary.json";

/// Settings shared by every subcommand.
pub struct Context {
    pub layout: DataLayout,
    pub config: HarvestConfig,
    pub quiet: bool,
}

impl Context {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let data_dir = matches
            .get_one::<String>("data-dir")
            .map(String::as_str)
            .unwrap_or("./data");
        let config = load_config(matches.get_one::<PathBuf>("config"))?;
        Ok(Self {
            layout: DataLayout::new(resolve_data_dir(data_dir)),
            config,
            quiet: matches.get_flag("quiet"),
        })
    }

    fn stages(&self) -> Result<StageStore> {
        Ok(StageStore::open(self.layout.planning())?)
    }
}

/// Expand `~` in the data directory argument.
pub fn resolve_data_dir(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

pub fn load_config(path: Option<&PathBuf>) -> Result<HarvestConfig> {
    match path {
        Some(path) => Ok(HarvestConfig::load(path)?),
        None => Ok(HarvestConfig::default()),
    }
}

/// Entities to harvest from a stage file. Species inventories and API plans
/// share the same shape.
pub fn load_entities(stages: &StageStore, stage: &str) -> Result<Vec<Entity>> {
    let entities: Vec<Entity> = stages
        .read(stage)
        .with_context(|| format!("Cannot load entities from stage '{}'", stage))?;
    if entities.is_empty() {
        bail!("Stage '{}' holds no entities", stage);
    }
    Ok(entities)
}

pub fn print_banner() {
    println!(
        "{} {}",
        "canopy".bright_green().bold(),
        env!("CARGO_PKG_VERSION").bright_white()
    );
    println!("{}", "resumable taxonomy harvester".dimmed());
    println!();
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn browser_options(config: &HarvestConfig, headed: bool) -> BrowserOptions {
    BrowserOptions {
        headless: config.headless && !headed,
        request_timeout: Duration::from_secs(config.attempt_timeout_secs),
        ..BrowserOptions::default()
    }
}

fn first_identity(config: &HarvestConfig) -> Identity {
    IdentityPool::new(config.identities.clone(), 1, config.seed)
        .identity_for(0)
        .clone()
}

async fn open_walker(ctx: &Context, headed: bool) -> Result<HierarchyWalker<ChromeDriver>> {
    let driver = ChromeDriver::launch(
        0,
        first_identity(&ctx.config),
        browser_options(&ctx.config, headed),
    )
    .await
    .context("Failed to launch the browser")?;

    Ok(HierarchyWalker::new(driver, &ctx.config.base_url)
        .with_policy(ctx.config.walk_policy())
        .with_scroll_policy(ctx.config.scroll_policy())
        .with_excluded_ids(ctx.config.excluded_ids.clone())
        .with_progress_callback(Arc::new(|done: usize, total: usize, name: String| {
            debug!("Walking {}/{}: {}", done, total, name);
        })))
}

pub async fn handle_orders(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let root_url = args
        .get_one::<String>("root-url")
        .cloned()
        .unwrap_or_else(|| ctx.config.root_url());
    let stages = ctx.stages()?;

    let mut walker = open_walker(ctx, args.get_flag("headed")).await?;
    let orders = walker.discover_orders(&root_url).await;
    walker.close().await;

    if orders.is_empty() {
        warn!("No orders found under {}", root_url);
    }
    let path = stages.write(ORDERS_STAGE, &orders)?;
    println!(
        "{} {} orders saved to {}",
        "✓".green().bold(),
        orders.len(),
        path.display()
    );
    Ok(())
}

pub async fn handle_families(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let input = args
        .get_one::<String>("input")
        .map(String::as_str)
        .unwrap_or(ORDERS_STAGE);
    let stages = ctx.stages()?;
    let orders: Vec<OrderRecord> = stages.read(input)?;

    let mut walker = open_walker(ctx, args.get_flag("headed")).await?;
    let families = walker.discover_families(&orders).await;
    walker.close().await;

    let path = stages.write(FAMILIES_STAGE, &families)?;
    println!(
        "{} {} families from {} orders saved to {}",
        "✓".green().bold(),
        families.len(),
        orders.len(),
        path.display()
    );
    Ok(())
}

pub async fn handle_species(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let input = args
        .get_one::<String>("input")
        .map(String::as_str)
        .unwrap_or(FAMILIES_STAGE);
    let stages = ctx.stages()?;
    let families: Vec<FamilyRecord> = stages.read(input)?;

    let mut walker = open_walker(ctx, args.get_flag("headed")).await?;
    let species = walker.discover_species(&families).await;
    walker.close().await;

    let path = stages.write(SPECIES_STAGE, &species)?;
    println!(
        "{} {} species from {} families saved to {}",
        "✓".green().bold(),
        species.len(),
        families.len(),
        path.display()
    );
    Ok(())
}

pub async fn handle_plan(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let taxon = args
        .get_one::<String>("taxon")
        .cloned()
        .unwrap_or_else(|| ctx.config.taxon_id.clone());
    let stages = ctx.stages()?;

    let transport = HttpTransport::new(
        &first_identity(&ctx.config),
        Duration::from_secs(ctx.config.attempt_timeout_secs),
    )?;
    let mut fetcher = Fetcher::new(transport)
        .with_policy(ctx.config.retry_policy())
        .with_delay(ctx.config.polite_delay());
    if let Some(seed) = ctx.config.seed {
        fetcher = fetcher.with_seed(seed);
    }

    let listing = list_all(&mut fetcher, &ctx.config.listing_query(&taxon)).await?;
    if !listing.exhausted {
        warn!(
            "Listing stopped early after {} pages; the plan is partial",
            listing.pages
        );
    }

    let path = stages.write(&plan_stage(&taxon), &listing.entities)?;
    println!(
        "{} {} entities in {} pages saved to {}",
        "✓".green().bold(),
        listing.entities.len(),
        listing.pages,
        path.display()
    );
    Ok(())
}

/// Progress bar fed by the orchestrator's completion callback.
fn harvest_progress(total: usize, quiet: bool) -> (ProgressBar, HarvestProgressCallback) {
    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let bar = pb.clone();
    let callback: HarvestProgressCallback = Arc::new(move |snap: &TelemetrySnapshot| {
        bar.set_position(snap.fetched() + snap.skipped);
        bar.set_message(format!("ok {} | err {}", snap.ok, snap.error));
    });
    (pb, callback)
}

async fn run_pool<F: SessionFactory>(
    factory: F,
    checkpoint: CheckpointStore,
    ctx: &Context,
    rendered: bool,
    entities: Vec<Entity>,
    workers: usize,
    stop: Arc<AtomicBool>,
) -> Result<TelemetrySnapshot> {
    let total = entities.len();
    let (pb, callback) = harvest_progress(total, ctx.quiet);

    let orchestrator = Orchestrator::new(factory, checkpoint, ctx.config.harvest_options(rendered))
        .with_stop_signal(stop)
        .with_progress_callback(callback);
    let snap = orchestrator.run(entities, workers).await?;

    pb.finish_and_clear();
    Ok(snap)
}

pub async fn handle_harvest(ctx: &mut Context, args: &ArgMatches) -> Result<()> {
    let stage = args
        .get_one::<String>("plan")
        .map(String::as_str)
        .unwrap_or(SPECIES_STAGE);
    let mode = args
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("browser");
    if let Some(seed) = args.get_one::<u64>("seed") {
        ctx.config.seed = Some(*seed);
    }
    let workers = args
        .get_one::<usize>("workers")
        .copied()
        .unwrap_or(ctx.config.workers)
        .max(1);
    let format = args
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::parse(f))
        .unwrap_or(ReportFormat::Text);

    let stages = ctx.stages()?;
    let entities = load_entities(&stages, stage)?;
    let checkpoint = CheckpointStore::open(ctx.layout.pages())?;

    if !ctx.quiet {
        print_divider();
        println!("{}", "  HARVEST".bright_white().bold());
        print_divider();
        println!("{} Plan:    {} ({} entities)", "→".blue(), stage, entities.len());
        println!("{} Mode:    {} with {} workers", "→".blue(), mode, workers);
        println!("{} Output:  {}", "→".blue(), ctx.layout.pages().display());
        println!();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight items");
            signal.store(true, Ordering::SeqCst);
        }
    });

    let snap = match mode {
        "http" => {
            let factory = HttpSessionFactory {
                timeout: Duration::from_secs(ctx.config.attempt_timeout_secs),
            };
            run_pool(factory, checkpoint, ctx, false, entities, workers, stop.clone()).await?
        }
        _ => {
            let factory = BrowserSessionFactory {
                options: browser_options(&ctx.config, args.get_flag("headed")),
                ready_timeout: Duration::from_secs(ctx.config.ready_timeout_secs),
            };
            run_pool(factory, checkpoint, ctx, true, entities, workers, stop.clone()).await?
        }
    };

    let summary = HarvestSummary {
        pages_dir: ctx.layout.pages().display().to_string(),
        mode: mode.to_string(),
        workers,
        finished_at: Utc::now(),
        interrupted: stop.load(Ordering::SeqCst),
        telemetry: snap,
    };

    let json = generate_json_report(&summary)?;
    let summary_path = stages.dir().join(SUMMARY_FILE);
    if let Err(e) = save_report(&json, &summary_path) {
        warn!("Could not save summary to {}: {}", summary_path.display(), e);
    }

    match format {
        ReportFormat::Json => println!("{}", json),
        ReportFormat::Text => print!("{}", generate_text_report(&summary)),
    }
    Ok(())
}

pub fn handle_refine(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let output = args
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| ctx.layout.refined());
    let pages = CheckpointStore::open(ctx.layout.pages())?;

    let report = refine_all(&pages, &output)?;
    println!(
        "{} {} records refined into {} ({} partial, {} unreadable)",
        "✓".green().bold(),
        report.refined,
        output.display(),
        report.partial,
        report.unreadable
    );
    Ok(())
}

pub fn handle_purge(ctx: &Context) -> Result<()> {
    let pages = CheckpointStore::open(ctx.layout.pages())?;
    let report = purge_rate_limited(&pages)?;
    println!(
        "{} {} pages scanned, {} throttled pages removed, {} unreadable",
        "✓".green().bold(),
        report.scanned,
        report.removed,
        report.unreadable
    );
    if report.failed > 0 {
        println!(
            "{} {} throttled pages could not be deleted",
            "⚠".yellow().bold(),
            report.failed
        );
    }
    if report.removed > 0 {
        println!(
            "{} Run {} again to refetch them.",
            "→".blue(),
            "canopy harvest".bright_white()
        );
    }
    Ok(())
}

