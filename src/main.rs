use anyhow::Context;
use clap::{Parser, Subcommand};
use shelf_enricher::app::cover_cache::CoverCache;
use shelf_enricher::app::enrich_use_case::EnrichUseCase;
use shelf_enricher::app::ports::{BibliographicLookupPort, CacheStorePort, SystemClock};
use shelf_enricher::app::resolver::Resolver;
use shelf_enricher::config::{CacheBackend, EnricherConfig};
use shelf_enricher::infra::google_books::GoogleBooksClient;
use shelf_enricher::infra::json_store::JsonFileCacheStore;
use shelf_enricher::infra::memory_store::InMemoryCacheStore;
use shelf_enricher::infra::rate_limited::RateLimitedLookup;
use shelf_enricher::infra::sqlite_store::SqliteCacheStore;
use shelf_enricher::isbn;
use shelf_enricher::rate_limiter::MinGapRateLimiter;
use shelf_enricher::types::Book;
use shelf_enricher::{logging, observability};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shelf_enricher")]
#[command(about = "Resolve book metadata from scanned codes and enrich shelves with cover art")]
#[command(version)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "enricher.toml")]
    config: PathBuf,

    /// Expose Prometheus metrics on this port
    #[arg(long, global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize and validate a code, showing its ISBN-10/13 counterparts
    Validate { code: String },
    /// Resolve a scanned code to bibliographic metadata
    Resolve { code: String },
    /// Search by title and optional author
    Search {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        author: String,
    },
    /// Fill in missing covers for a JSON array of books
    Enrich {
        #[arg(long)]
        input: PathBuf,
        /// Write the per-index outcomes here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Use a throwaway in-memory cache
        #[arg(long)]
        no_cache: bool,
    },
}

fn build_lookup(config: &EnricherConfig) -> anyhow::Result<Arc<dyn BibliographicLookupPort>> {
    let client = GoogleBooksClient::new(&config.lookup).context("building lookup client")?;
    let limiter = MinGapRateLimiter::new(config.scheduler.min_request_gap());
    Ok(Arc::new(RateLimitedLookup::new(Arc::new(client), limiter)))
}

fn build_resolver(config: &EnricherConfig) -> anyhow::Result<Resolver> {
    Ok(Resolver::new(
        build_lookup(config)?,
        config.resolver.clone(),
        config.lookup.timeout(),
    ))
}

async fn open_store(config: &EnricherConfig, no_cache: bool) -> anyhow::Result<Arc<dyn CacheStorePort>> {
    if no_cache {
        return Ok(Arc::new(InMemoryCacheStore::new()));
    }
    let store: Arc<dyn CacheStorePort> = match config.cache.backend {
        CacheBackend::Json => Arc::new(JsonFileCacheStore::open(&config.cache.path).await),
        CacheBackend::Sqlite => Arc::new(
            SqliteCacheStore::open(&config.cache.path)
                .with_context(|| format!("opening sqlite cache at {}", config.cache.path))?,
        ),
        CacheBackend::Memory => Arc::new(InMemoryCacheStore::new()),
    };
    info!("Using {:?} cover cache at {}", config.cache.backend, config.cache.path);
    Ok(store)
}

fn validate(code: &str) -> serde_json::Value {
    let normalized = isbn::normalize(code);
    serde_json::json!({
        "normalized": normalized,
        "isbn10_valid": isbn::is_valid_isbn10(&normalized),
        "isbn13_valid": isbn::is_valid_isbn13(&normalized),
        "isbn13": isbn::isbn10_to_13(&normalized),
        "isbn10": isbn::isbn13_to_10(&normalized),
        "candidates": isbn::lookup_candidates_from_barcode(code),
    })
}

async fn enrich(
    config: &EnricherConfig,
    input: PathBuf,
    output: Option<PathBuf>,
    no_cache: bool,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let books: Vec<Book> = serde_json::from_str(&raw).context("input must be a JSON array of books")?;

    let store = open_store(config, no_cache).await?;
    let cache = Arc::new(CoverCache::load(store, Arc::new(SystemClock), config.cache.negative_ttl()).await);
    let use_case = EnrichUseCase::new(
        cache.clone(),
        Arc::new(build_resolver(config)?),
        config.scheduler.max_concurrency,
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some((index, url)) = rx.recv().await {
            eprintln!("{} -> {}", index, url);
        }
    });

    let outcomes = use_case.enrich_to_channel(&books, tx).await;
    if let Err(e) = printer.await {
        warn!("Progress printer stopped: {}", e);
    }

    let stats = cache.stats();
    info!(
        "Cache stats: {} hits, {} misses, {} recent-miss skips, {} in-flight joins, {} lookups",
        stats.hits, stats.misses, stats.recent_miss_skips, stats.in_flight_joins, stats.lookups
    );

    let json = serde_json::to_string_pretty(&outcomes)?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote {} outcomes to {}", outcomes.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    let config = EnricherConfig::load(&cli.config)?;

    if let Some(port) = cli.metrics_port {
        observability::init_metrics(port);
    }

    match cli.command {
        Commands::Validate { code } => {
            println!("{}", serde_json::to_string_pretty(&validate(&code))?);
        }
        Commands::Resolve { code } => {
            let outcome = build_resolver(&config)?.resolve_scanned_code(&code).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Search { title, author } => {
            let outcome = build_resolver(&config)?.search_by_title_author(&title, &author).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Enrich {
            input,
            output,
            no_cache,
        } => enrich(&config, input, output, no_cache).await?,
    }

    Ok(())
}
