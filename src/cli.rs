//! CLI parsing and orchestration. Resolves settings, locates the collection, runs the pool,
//! merges the results and maps errors to exit codes.

use crate::config::{self, Config, ConfigError};
use crate::fetch::{
    FetchPolicy, ItemFetcher, KeywordClassifier, MarkerTable, DEFAULT_BASE_DELAY,
    DEFAULT_ITEM_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
};
use crate::locate::{
    ListingApiLocator, LocateError, ManifestLocator, SourceLocator, DEFAULT_ADDRESS_TEMPLATE,
    DEFAULT_LISTING_ENDPOINT,
};
use crate::merge::{ArtifactMerger, MergeError, MergeOutcome, OutputFormat};
use crate::model::{Collection, ProgressEvent};
use crate::pool::{
    ChannelProgressSink, ItemPipeline, NoopProgress, PoolError, ProgressSink, WorkerPool,
    DEFAULT_CONCURRENCY, DEFAULT_DELAY,
};
use crate::render::{ArtifactRenderer, DEFAULT_SETTLE};
use crate::sanitize::{ContentSanitizer, SanitizeRules};
use crate::session::{Credentials, HttpSessionFactory, Session, SessionError};
use crate::summary::RunSummary;
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_OUTPUT_DIR: &str = "downloads";

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Locate(#[from] LocateError),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Pool(#[from] PoolError),

    #[error("No item was retrieved ({failed} failed)")]
    NothingRetrieved { failed: usize },

    #[error("{0}")]
    Merge(#[from] MergeError),

    #[error("Merge task failed: {0}")]
    MergeTask(#[from] tokio::task::JoinError),

    #[error("Interrupted: {succeeded} of {total} items were retrieved")]
    Interrupted { succeeded: usize, total: usize },
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) | CliRunError::Config(_) => 1,
            CliRunError::Locate(_)
            | CliRunError::Session(_)
            | CliRunError::Pool(_)
            | CliRunError::NothingRetrieved { .. } => 2,
            CliRunError::Merge(_) | CliRunError::MergeTask(_) => 3,
            CliRunError::Interrupted { .. } => 130,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "collate")]
#[command(about = "Fetch every item of a collection concurrently and bind them into one deliverable")]
#[command(
    after_help = "Config file keys (collection_url, cookie, output_dir, concurrency, delay_ms, timeout_secs, max_attempts, retry_base_delay_ms, settle_ms, listing_endpoint, item_address_template, content_selectors, ready_selectors, auth_markers, not_found_markers, formats, delete_after_merge) are read from --config, ./collate.toml or ~/.config/collate/config.toml. CLI flags override config."
)]
pub struct Args {
    /// Collection id or address (overrides collection_url from config).
    pub collection: Option<String>,

    /// Output directory for artifacts and deliverables. Default: ./downloads.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Cookie header for authenticated collections, e.g. "SID=...; token=...".
    #[arg(long, env = "COLLATE_COOKIE", hide_env_values = true)]
    pub cookie: Option<String>,

    /// Read the item list from a JSON manifest instead of a listing endpoint.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Listing endpoint that returns the collection's items.
    #[arg(long)]
    pub listing_endpoint: Option<String>,

    /// Item address with an {id} placeholder.
    #[arg(long)]
    pub item_address_template: Option<String>,

    /// Number of concurrent workers (default 3).
    #[arg(long, value_parser = parse_concurrency)]
    pub concurrency: Option<usize>,

    /// Pause each worker takes between items, in milliseconds (default 2000).
    #[arg(long)]
    pub delay: Option<u64>,

    /// Per-attempt fetch timeout in seconds (default 30).
    #[arg(long, value_parser = parse_timeout)]
    pub timeout: Option<u64>,

    /// Retries after the first attempt for retryable failures (default 2).
    #[arg(long)]
    pub retries: Option<u32>,

    /// Deliverable format: html, epub or markdown. Repeat for several.
    #[arg(long = "format", value_parser = parse_format)]
    pub formats: Vec<OutputFormat>,

    /// Keep per-item artifacts only; do not build deliverables.
    #[arg(long)]
    pub no_merge: bool,

    /// Delete per-item artifacts once every deliverable is written.
    #[arg(long)]
    pub delete_after_merge: bool,

    /// Process only the first N items.
    #[arg(long, value_parser = parse_limit)]
    pub limit: Option<usize>,

    /// List the collection's items and the deliverable paths without fetching anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Config file to use instead of the default locations.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Suppress progress output (errors and summary only).
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging and full error chains.
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    s.parse::<OutputFormat>()
        .map_err(|_| format!("Invalid --format value: '{}'. Use html, epub, or markdown.", s))
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(format!(
            "Invalid --concurrency value: '{}'. Expected a whole number of at least 1.",
            s
        )),
    }
}

fn parse_timeout(s: &str) -> Result<u64, String> {
    match s.trim().parse::<u64>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(format!(
            "Invalid --timeout value: '{}'. Expected seconds, at least 1.",
            s
        )),
    }
}

fn parse_limit(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(format!("Invalid --limit value: '{}'. Expected at least 1.", s)),
    }
}

/// Where the item list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Manifest(PathBuf),
    Listing {
        collection: String,
        endpoint: Url,
        address_template: String,
    },
}

/// Effective run settings: CLI flag, then config file, then built-in default.
#[derive(Debug, Clone)]
struct Settings {
    source: Source,
    output_dir: PathBuf,
    cookie: Option<String>,
    user_agent: Option<String>,
    concurrency: usize,
    delay: Duration,
    fetch: FetchPolicy,
    settle: Duration,
    markers: MarkerTable,
    sanitize: SanitizeRules,
    formats: Vec<OutputFormat>,
    delete_after_merge: bool,
}

fn resolve_settings(args: &Args, config: Option<&Config>) -> Result<Settings, CliRunError> {
    let source = match &args.manifest {
        Some(path) => Source::Manifest(path.clone()),
        None => {
            let collection = args
                .collection
                .clone()
                .or_else(|| config.and_then(|c| c.collection_url.clone()))
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| {
                    CliRunError::InvalidInput(
                        "No collection given. Pass a collection id or address, set collection_url in the config file, or use --manifest."
                            .to_string(),
                    )
                })?;
            let endpoint_raw = args
                .listing_endpoint
                .clone()
                .or_else(|| config.and_then(|c| c.listing_endpoint.clone()))
                .unwrap_or_else(|| DEFAULT_LISTING_ENDPOINT.to_string());
            let endpoint = Url::parse(&endpoint_raw).map_err(|e| {
                CliRunError::InvalidInput(format!(
                    "Invalid listing endpoint '{}': {}",
                    endpoint_raw, e
                ))
            })?;
            let address_template = args
                .item_address_template
                .clone()
                .or_else(|| config.and_then(|c| c.item_address_template.clone()))
                .unwrap_or_else(|| DEFAULT_ADDRESS_TEMPLATE.to_string());
            if !address_template.contains("{id}") {
                return Err(CliRunError::InvalidInput(format!(
                    "Item address template '{}' has no {{id}} placeholder.",
                    address_template
                )));
            }
            Source::Listing {
                collection,
                endpoint,
                address_template,
            }
        }
    };

    let concurrency = args
        .concurrency
        .or_else(|| config.and_then(|c| c.concurrency))
        .unwrap_or(DEFAULT_CONCURRENCY);
    if concurrency == 0 {
        return Err(CliRunError::InvalidInput(
            "concurrency must be at least 1".to_string(),
        ));
    }
    let max_attempts = args
        .retries
        .map(|r| r.saturating_add(1))
        .or_else(|| config.and_then(|c| c.max_attempts))
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);
    if max_attempts == 0 {
        return Err(CliRunError::InvalidInput(
            "max_attempts must be at least 1".to_string(),
        ));
    }

    let mut fetch = FetchPolicy {
        max_attempts,
        base_delay: config
            .and_then(|c| c.retry_base_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BASE_DELAY),
        timeout: args
            .timeout
            .or_else(|| config.and_then(|c| c.timeout_secs))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ITEM_TIMEOUT),
        ..FetchPolicy::default()
    };
    if let Some(selectors) = config.and_then(|c| c.ready_selectors.clone()) {
        fetch.ready_selectors = selectors;
    }

    let mut sanitize = SanitizeRules::default();
    if let Some(selectors) = config.and_then(|c| c.content_selectors.clone()) {
        sanitize.content_selectors = selectors;
    }

    let formats = if !args.formats.is_empty() {
        args.formats.clone()
    } else {
        config
            .and_then(|c| c.formats.clone())
            .unwrap_or_else(|| vec![OutputFormat::Html])
    };

    Ok(Settings {
        source,
        output_dir: args
            .output
            .clone()
            .or_else(|| config.and_then(|c| c.output_dir.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        cookie: args
            .cookie
            .clone()
            .or_else(|| config.and_then(|c| c.cookie.clone()))
            .filter(|c| !c.trim().is_empty()),
        user_agent: config.and_then(|c| c.user_agent.clone()),
        concurrency,
        delay: args
            .delay
            .or_else(|| config.and_then(|c| c.delay_ms))
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DELAY),
        fetch,
        settle: config
            .and_then(|c| c.settle_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SETTLE),
        markers: MarkerTable::default().with_overrides(
            config.and_then(|c| c.auth_markers.clone()),
            config.and_then(|c| c.not_found_markers.clone()),
        ),
        sanitize,
        formats,
        delete_after_merge: args.delete_after_merge
            || config
                .and_then(|c| c.delete_after_merge)
                .unwrap_or(false),
    })
}

fn session_factory(settings: &Settings) -> HttpSessionFactory {
    let mut builder = HttpSessionFactory::builder().timeout_secs(settings.fetch.timeout.as_secs());
    if let Some(ua) = &settings.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    if let Some(cookie) = &settings.cookie {
        let scope = match &settings.source {
            Source::Listing {
                collection,
                endpoint,
                ..
            } => Url::parse(collection).unwrap_or_else(|_| endpoint.clone()),
            Source::Manifest(_) => match Url::parse(DEFAULT_LISTING_ENDPOINT) {
                Ok(u) => u,
                Err(_) => return builder.build(),
            },
        };
        let credentials = Credentials::from_cookie_header(cookie);
        info!(
            cookies = credentials.len(),
            host = scope.host_str().unwrap_or(""),
            "credentials installed"
        );
        builder = builder.credentials(credentials, scope);
    }
    builder.build()
}

async fn locate(
    settings: &Settings,
    factory: &HttpSessionFactory,
) -> Result<Collection, CliRunError> {
    let mut session = factory.session()?;
    let located = match &settings.source {
        Source::Manifest(path) => {
            ManifestLocator
                .locate(&mut session, &path.to_string_lossy())
                .await
        }
        Source::Listing {
            collection,
            endpoint,
            address_template,
        } => {
            ListingApiLocator::new(endpoint.clone(), address_template.clone())
                .locate(&mut session, collection)
                .await
        }
    };
    if let Err(e) = session.close().await {
        warn!(error = %e, "failed to close locator session");
    }
    Ok(located?)
}

/// Draws the progress bar and per-item lines until the pool drops its sender.
fn spawn_progress(
    total: usize,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = indicatif::ProgressBar::new(total as u64);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        while let Some(event) = rx.recv().await {
            bar.set_position(event.completed as u64);
            bar.set_message(event.last_item_title.clone());
            bar.println(progress_line(&event));
        }
        bar.disable_steady_tick();
        bar.finish_and_clear();
    })
}

fn progress_line(event: &ProgressEvent) -> String {
    let position = format!("[{}/{}]", event.original_index + 1, event.total);
    if event.last_item_success {
        format!("✓ {} {}", position, event.last_item_title)
    } else {
        format!(
            "✗ {} {}: {}",
            position,
            event.last_item_title,
            event.detail.as_deref().unwrap_or("failed")
        )
    }
}

fn print_merge(outcome: &MergeOutcome) {
    for d in &outcome.deliverables {
        eprintln!("Wrote {} ({} items)", d.path.display(), d.item_count);
        for w in &d.warnings {
            eprintln!("Warning: {}", w);
        }
    }
    for w in &outcome.warnings {
        eprintln!("Warning: {}", w);
    }
    if outcome.removed_artifacts > 0 {
        eprintln!("Removed {} per-item files", outcome.removed_artifacts);
    }
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub async fn run(args: &Args) -> Result<(), CliRunError> {
    let config = config::load_config(args.config.as_deref())?;
    let settings = resolve_settings(args, config.as_ref())?;
    let factory = Arc::new(session_factory(&settings));

    let mut collection = locate(&settings, &factory).await?;
    if let Some(limit) = args.limit {
        collection.truncate(limit);
    }
    let merger = ArtifactMerger::new(collection.title.clone(), &settings.formats)
        .delete_after_merge(settings.delete_after_merge);

    if args.dry_run {
        println!("{} ({} items)", collection.title, collection.items.len());
        for item in &collection.items {
            match &item.section_label {
                Some(section) => {
                    println!("  {}. [{}] {}", item.original_index + 1, section, item.title)
                }
                None => println!("  {}. {}", item.original_index + 1, item.title),
            }
        }
        if !args.no_merge {
            for &format in merger.formats() {
                eprintln!("Output: {}", merger.destination(&settings.output_dir, format).display());
            }
        }
        return Ok(());
    }

    let total = collection.items.len();
    let sanitizer = ContentSanitizer::new(settings.sanitize.clone())
        .map_err(|e| CliRunError::InvalidInput(e.to_string()))?;
    let fetcher = ItemFetcher::new(
        settings.fetch.clone(),
        Arc::new(KeywordClassifier::new(settings.markers.clone())),
    );
    let renderer = ArtifactRenderer::new(settings.output_dir.clone(), total, settings.settle);
    let pipeline = Arc::new(ItemPipeline::new(fetcher, sanitizer, renderer));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after in-flight items are released");
                cancel.cancel();
            }
        })
    };

    let (sink, progress): (Arc<dyn ProgressSink>, Option<tokio::task::JoinHandle<()>>) =
        if args.quiet {
            (Arc::new(NoopProgress), None)
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(ChannelProgressSink::new(tx)), Some(spawn_progress(total, rx)))
        };

    let pool = WorkerPool::new(settings.concurrency, settings.delay, factory);
    let outcome = pool.run(collection.items, pipeline, sink, cancel.clone()).await;
    interrupt.abort();
    if let Some(handle) = progress {
        // The pool has dropped its sink, so the channel is closed.
        let _ = handle.await;
    }
    let outcome = outcome?;

    let summary = RunSummary::from_results(&outcome.results);
    eprint!("{}", summary);

    if summary.succeeded > 0 && !args.no_merge {
        let results = outcome.results.clone();
        let output_dir = settings.output_dir.clone();
        let merged =
            tokio::task::spawn_blocking(move || merger.merge(&results, &output_dir)).await??;
        print_merge(&merged);
    }

    if outcome.aborted {
        return Err(CliRunError::Interrupted {
            succeeded: summary.succeeded,
            total,
        });
    }
    if summary.succeeded == 0 {
        return Err(CliRunError::NothingRetrieved {
            failed: summary.failed,
        });
    }
    Ok(())
}
