//! Bounded-concurrency cover enrichment over a batch of books.

use crate::app::cover_cache::{build_cache_key, CacheLookup, CoverCache, ResolveSource};
use crate::app::resolver::{CoverResolution, Resolver};
use crate::observability::metrics;
use crate::types::{Book, EnrichmentOutcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Callback fired once per index that ends up with a cover URL.
pub type OnResolved = Arc<dyn Fn(usize, &str) + Send + Sync>;

/// One unit of worker work.
#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub index: usize,
    pub book: Book,
    pub key: String,
}

/// Enrichment scheduler: cache short-circuits first, then a fixed worker pool
/// drains the remaining tasks through the resolver.
///
/// The resolver's lookup port is expected to be rate limited
/// (see [`crate::infra::rate_limited::RateLimitedLookup`]); every outbound call
/// goes through it regardless of which worker issues it.
pub struct EnrichUseCase {
    cache: Arc<CoverCache>,
    resolver: Arc<Resolver>,
    max_concurrency: usize,
}

type Outcomes = Arc<Mutex<Vec<Option<EnrichmentOutcome>>>>;

impl EnrichUseCase {
    pub fn new(cache: Arc<CoverCache>, resolver: Arc<Resolver>, max_concurrency: usize) -> Self {
        Self {
            cache,
            resolver,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn cache(&self) -> &Arc<CoverCache> {
        &self.cache
    }

    /// Enrich a batch using [`Book::has_cover`] and no callback.
    pub async fn enrich_batch(&self, books: &[Book]) -> Vec<EnrichmentOutcome> {
        self.enrich(books, Book::has_cover, Arc::new(|_: usize, _: &str| {})).await
    }

    pub async fn enrich_with_callback<F>(&self, books: &[Book], on_resolved: F) -> Vec<EnrichmentOutcome>
    where
        F: Fn(usize, &str) + Send + Sync + 'static,
    {
        self.enrich(books, Book::has_cover, Arc::new(on_resolved)).await
    }

    /// Stream `(index, cover_url)` pairs to `tx` as they resolve.
    pub async fn enrich_to_channel(
        &self,
        books: &[Book],
        tx: mpsc::UnboundedSender<(usize, String)>,
    ) -> Vec<EnrichmentOutcome> {
        self.enrich_with_callback(books, move |index, url| {
            // receiver gone means nobody is listening; outcomes are still returned
            let _ = tx.send((index, url.to_string()));
        })
        .await
    }

    /// Run one batch to completion and return one outcome per input index.
    ///
    /// Callbacks fire in completion order, always after the cache write for
    /// that key. A failing item never aborts the batch.
    pub async fn enrich<P>(&self, books: &[Book], has_cover: P, on_resolved: OnResolved) -> Vec<EnrichmentOutcome>
    where
        P: Fn(&Book) -> bool,
    {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("enrich_batch", %run_id, books = books.len());

        let outcomes: Outcomes = Arc::new(Mutex::new(vec![None; books.len()]));
        let tasks = self
            .schedule(books, &has_cover, &on_resolved, &outcomes)
            .instrument(span.clone())
            .await;
        let task_count = tasks.len();

        if !tasks.is_empty() {
            let worker_count = self.max_concurrency.min(tasks.len());
            debug!(parent: &span, "Starting {} workers for {} tasks", worker_count, tasks.len());

            let tasks = Arc::new(tasks);
            let cursor = Arc::new(AtomicUsize::new(0));
            let mut workers = JoinSet::new();
            for worker_id in 0..worker_count {
                let worker = Worker {
                    id: worker_id,
                    tasks: tasks.clone(),
                    cursor: cursor.clone(),
                    cache: self.cache.clone(),
                    resolver: self.resolver.clone(),
                    on_resolved: on_resolved.clone(),
                    outcomes: outcomes.clone(),
                };
                workers.spawn(worker.run().instrument(span.clone()));
            }

            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(parent: &span, "Enrichment worker aborted: {}", e);
                }
            }
        }

        let outcomes: Vec<EnrichmentOutcome> = outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .map(|o| o.unwrap_or_else(|| EnrichmentOutcome::Failed("worker aborted".to_string())))
            .collect();

        let resolved = outcomes.iter().filter(|o| o.cover_url().is_some()).count();
        let elapsed = started.elapsed();
        info!(
            parent: &span,
            "Enrichment batch finished: {} books, {} looked up, {} with covers in {:?}",
            books.len(),
            task_count,
            resolved,
            elapsed
        );
        metrics::scheduler::batch_finished(task_count, resolved, elapsed.as_secs_f64());
        outcomes
    }

    /// Settle everything the cache can answer; return the rest as tasks.
    async fn schedule<P>(
        &self,
        books: &[Book],
        has_cover: &P,
        on_resolved: &OnResolved,
        outcomes: &Outcomes,
    ) -> Vec<EnrichmentTask>
    where
        P: Fn(&Book) -> bool,
    {
        let mut tasks = Vec::new();
        for (index, book) in books.iter().enumerate() {
            let settled = if has_cover(book) {
                Some(EnrichmentOutcome::AlreadyHasCover)
            } else {
                let key = build_cache_key(book);
                match self.cache.lookup(&key).await {
                    CacheLookup::Hit(url) => {
                        on_resolved(index, &url);
                        Some(EnrichmentOutcome::Cached(url))
                    }
                    CacheLookup::RecentMiss => Some(EnrichmentOutcome::RecentMiss),
                    CacheLookup::Miss => {
                        tasks.push(EnrichmentTask {
                            index,
                            book: book.clone(),
                            key,
                        });
                        None
                    }
                }
            };
            if let Some(outcome) = settled {
                store_outcome(outcomes, index, outcome);
            }
        }
        tasks
    }
}

fn store_outcome(outcomes: &Outcomes, index: usize, outcome: EnrichmentOutcome) {
    let mut outcomes = outcomes.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(slot) = outcomes.get_mut(index) {
        *slot = Some(outcome);
    }
}

struct Worker {
    id: usize,
    tasks: Arc<Vec<EnrichmentTask>>,
    cursor: Arc<AtomicUsize>,
    cache: Arc<CoverCache>,
    resolver: Arc<Resolver>,
    on_resolved: OnResolved,
    outcomes: Outcomes,
}

impl Worker {
    async fn run(self) {
        let mut processed = 0usize;
        loop {
            let next = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(task) = self.tasks.get(next) else {
                break;
            };
            let outcome = self.process(task).await;
            store_outcome(&self.outcomes, task.index, outcome);
            processed += 1;
        }
        debug!("Worker {} drained queue after {} tasks", self.id, processed);
    }

    async fn process(&self, task: &EnrichmentTask) -> EnrichmentOutcome {
        let resolver = self.resolver.clone();
        let (resolution, source) = self
            .cache
            .get_or_resolve(&task.key, || async move { resolver.resolve_cover_for_book(&task.book).await })
            .await;

        match resolution {
            CoverResolution::Found(url) => {
                // cache entry is already written at this point
                (self.on_resolved)(task.index, &url);
                match source {
                    ResolveSource::Cache => EnrichmentOutcome::Cached(url),
                    ResolveSource::Lookup | ResolveSource::Joined => EnrichmentOutcome::Resolved(url),
                }
            }
            CoverResolution::NotFound => match source {
                ResolveSource::Cache => EnrichmentOutcome::RecentMiss,
                ResolveSource::Lookup | ResolveSource::Joined => EnrichmentOutcome::NotFound,
            },
            CoverResolution::NetworkError(reason) => {
                debug!("Task {} ({}) failed: {}", task.index, task.key, reason);
                EnrichmentOutcome::Failed(reason)
            }
        }
    }
}
