//! Two-tier cover cache with negative-entry TTL and in-flight de-duplication.

use crate::app::ports::{CacheStorePort, ClockPort};
use crate::app::resolver::CoverResolution;
use crate::isbn::normalize;
use crate::observability::metrics;
use crate::types::{Book, CacheEntry};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Canonical identity of a book for caching and de-duplication.
///
/// Normalized ISBN-13, else normalized ISBN-10, else `title|author`
/// lower-cased and trimmed. Total: every book maps to exactly one key.
pub fn build_cache_key(book: &Book) -> String {
    let normalized = |v: &Option<String>| v.as_deref().map(normalize).filter(|c| !c.is_empty());
    if let Some(isbn13) = normalized(&book.isbn13) {
        return isbn13;
    }
    if let Some(isbn10) = normalized(&book.isbn) {
        return isbn10;
    }
    format!(
        "{}|{}",
        book.title.trim().to_lowercase(),
        book.author.trim().to_lowercase()
    )
}

/// What the cache knows about a key before any lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(String),
    RecentMiss,
    Miss,
}

/// Where a `get_or_resolve` answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    /// This caller's resolve future ran the external lookup
    Lookup,
    /// Attached to a lookup another caller already had in flight
    Joined,
    /// Settled entry found on re-check, no lookup needed
    Cache,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub recent_miss_skips: u64,
    pub in_flight_joins: u64,
    pub lookups: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    recent_miss_skips: AtomicU64,
    in_flight_joins: AtomicU64,
    lookups: AtomicU64,
}

type InFlight = Arc<OnceCell<CoverResolution>>;

pub struct CoverCache {
    store: Arc<dyn CacheStorePort>,
    clock: Arc<dyn ClockPort>,
    negative_ttl: chrono::Duration,
    memory: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl CoverCache {
    /// Build a cache and warm the in-memory tier from the durable store.
    pub async fn load(
        store: Arc<dyn CacheStorePort>,
        clock: Arc<dyn ClockPort>,
        negative_ttl: chrono::Duration,
    ) -> Self {
        let entries = store.load_all().await;
        debug!("Cover cache warmed with {} entries", entries.len());
        Self {
            store,
            clock,
            negative_ttl,
            memory: Mutex::new(entries),
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            recent_miss_skips: c.recent_miss_skips.load(Ordering::Relaxed),
            in_flight_joins: c.in_flight_joins.load(Ordering::Relaxed),
            lookups: c.lookups.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn classify(&self, entry: &CacheEntry) -> CacheLookup {
        if let Some(url) = entry.positive_url() {
            return CacheLookup::Hit(url.to_string());
        }
        if entry.is_fresh_miss(self.clock.now(), self.negative_ttl) {
            return CacheLookup::RecentMiss;
        }
        CacheLookup::Miss
    }

    /// Memory tier first, then the durable store.
    pub async fn lookup(&self, key: &str) -> CacheLookup {
        let cached = lock(&self.memory).get(key).cloned();
        let entry = match cached {
            Some(entry) => Some(entry),
            None => {
                let durable = self.store.get(key).await;
                if let Some(entry) = &durable {
                    lock(&self.memory).insert(key.to_string(), entry.clone());
                }
                durable
            }
        };

        let result = entry
            .map(|e| self.classify(&e))
            .unwrap_or(CacheLookup::Miss);
        match &result {
            CacheLookup::Hit(_) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::cache::hit();
            }
            CacheLookup::RecentMiss => {
                self.counters.recent_miss_skips.fetch_add(1, Ordering::Relaxed);
                metrics::cache::recent_miss_skipped();
            }
            CacheLookup::Miss => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::cache::miss();
            }
        }
        result
    }

    /// Write an entry to both tiers. Durable write failures are logged, not raised.
    pub async fn record(&self, key: &str, entry: CacheEntry) {
        lock(&self.memory).insert(key.to_string(), entry.clone());
        if let Err(e) = self.store.set(key, &entry).await {
            warn!("Failed to persist cover cache entry for {}: {}", key, e);
            metrics::cache::write_failed();
        }
    }

    async fn record_resolution(&self, key: &str, resolution: &CoverResolution) {
        match resolution {
            CoverResolution::Found(url) => self.record(key, CacheEntry::found(url.clone())).await,
            CoverResolution::NotFound => self.record(key, CacheEntry::missed(self.clock.now())).await,
            // transient, retry on the next batch
            CoverResolution::NetworkError(reason) => {
                debug!("Not caching network failure for {}: {}", key, reason);
            }
        }
    }

    /// Resolve `key` at most once across concurrent callers.
    ///
    /// The first caller's `resolve` future runs; later callers for the same key
    /// await the same outcome. The cache entry is written before any caller
    /// observes the result, and the in-flight slot is released after the write.
    pub async fn get_or_resolve<F, Fut>(&self, key: &str, resolve: F) -> (CoverResolution, ResolveSource)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoverResolution>,
    {
        let (cell, joined) = {
            let mut in_flight = lock(&self.in_flight);
            // A lookup may have settled between scheduling and now
            if let Some(entry) = lock(&self.memory).get(key) {
                match self.classify(entry) {
                    CacheLookup::Hit(url) => return (CoverResolution::Found(url), ResolveSource::Cache),
                    CacheLookup::RecentMiss => return (CoverResolution::NotFound, ResolveSource::Cache),
                    CacheLookup::Miss => {}
                }
            }
            match in_flight.get(key) {
                Some(cell) => (cell.clone(), true),
                None => {
                    let cell: InFlight = Arc::new(OnceCell::new());
                    in_flight.insert(key.to_string(), cell.clone());
                    (cell, false)
                }
            }
        };

        if joined {
            self.counters.in_flight_joins.fetch_add(1, Ordering::Relaxed);
            metrics::cache::in_flight_joined();
            debug!("Joined in-flight lookup for {}", key);
        }

        let mut ran = false;
        let resolution = cell
            .get_or_init(|| async {
                ran = true;
                self.counters.lookups.fetch_add(1, Ordering::Relaxed);
                let resolution = resolve().await;
                self.record_resolution(key, &resolution).await;
                let mut in_flight = lock(&self.in_flight);
                if in_flight.get(key).map(|c| Arc::ptr_eq(c, &cell)).unwrap_or(false) {
                    in_flight.remove(key);
                }
                resolution
            })
            .await
            .clone();

        let source = if ran { ResolveSource::Lookup } else { ResolveSource::Joined };
        (resolution, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::ManualClock;
    use crate::infra::memory_store::InMemoryCacheStore;
    use chrono::{Duration, Utc};
    use std::sync::atomic::AtomicUsize;

    async fn cache_with(store: InMemoryCacheStore, clock: Arc<ManualClock>) -> CoverCache {
        CoverCache::load(Arc::new(store), clock, Duration::hours(24)).await
    }

    #[test]
    fn test_cache_key_priority() {
        let book = Book::new("Dune", "Frank Herbert")
            .with_isbn("0-441-01359-7")
            .with_isbn13("978-0-441-01359-3");
        assert_eq!(build_cache_key(&book), "9780441013593");

        let book = Book::new("Dune", "Frank Herbert").with_isbn("0-441-01359-7");
        assert_eq!(build_cache_key(&book), "0441013597");

        let book = Book::new("Dune", "Frank Herbert").with_isbn13("   ");
        assert_eq!(build_cache_key(&book), "dune|frank herbert");
    }

    #[test]
    fn test_cache_key_is_case_and_whitespace_insensitive() {
        assert_eq!(
            build_cache_key(&Book::new("Dune", "Frank Herbert")),
            build_cache_key(&Book::new(" dune ", " FRANK HERBERT "))
        );
        assert_eq!(build_cache_key(&Book::default()), "|");
    }

    #[tokio::test]
    async fn test_negative_entry_ttl() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let mut entries = HashMap::new();
        entries.insert("stale".to_string(), CacheEntry::missed(now - Duration::hours(25)));
        entries.insert("fresh".to_string(), CacheEntry::missed(now - Duration::hours(1)));
        entries.insert("hit".to_string(), CacheEntry::found("https://c/hit.jpg"));
        let cache = cache_with(InMemoryCacheStore::with_entries(entries), clock.clone()).await;

        assert_eq!(cache.lookup("stale").await, CacheLookup::Miss);
        assert_eq!(cache.lookup("fresh").await, CacheLookup::RecentMiss);
        assert_eq!(cache.lookup("hit").await, CacheLookup::Hit("https://c/hit.jpg".into()));
        assert_eq!(cache.lookup("unknown").await, CacheLookup::Miss);

        // Once the clock moves past the TTL the fresh miss becomes retryable
        clock.advance(Duration::hours(24));
        assert_eq!(cache.lookup("fresh").await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_durable_store() {
        let store = InMemoryCacheStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = cache_with(store.clone(), clock).await;

        // Written behind the cache's back after warm-up
        store.set("late", &CacheEntry::found("https://late")).await.unwrap();
        assert_eq!(cache.lookup("late").await, CacheLookup::Hit("https://late".into()));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_lookup() {
        let store = InMemoryCacheStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = cache_with(store.clone(), clock).await;
        let calls = AtomicUsize::new(0);

        let resolve = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            CoverResolution::Found("https://c/shared.jpg".to_string())
        };

        let (a, b) = tokio::join!(
            cache.get_or_resolve("9780306406157", resolve),
            cache.get_or_resolve("9780306406157", resolve)
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.0, CoverResolution::Found("https://c/shared.jpg".into()));
        assert_eq!(a.0, b.0);
        let mut sources = [a.1, b.1];
        sources.sort_by_key(|s| *s as u8);
        assert_eq!(sources, [ResolveSource::Lookup, ResolveSource::Joined]);
        assert_eq!(cache.stats().in_flight_joins, 1);
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(store.writes(), vec!["9780306406157".to_string()]);
    }

    #[tokio::test]
    async fn test_settled_key_is_not_resolved_again() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = cache_with(InMemoryCacheStore::new(), clock).await;

        let (first, _) = cache
            .get_or_resolve("k", || async { CoverResolution::NotFound })
            .await;
        assert_eq!(first, CoverResolution::NotFound);

        let calls = AtomicUsize::new(0);
        let (second, source) = cache
            .get_or_resolve("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                CoverResolution::Found("https://never".into())
            })
            .await;
        assert_eq!(second, CoverResolution::NotFound);
        assert_eq!(source, ResolveSource::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_errors_are_not_cached() {
        let store = InMemoryCacheStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = cache_with(store.clone(), clock).await;

        let (resolution, _) = cache
            .get_or_resolve("k", || async { CoverResolution::NetworkError("timeout".into()) })
            .await;
        assert!(matches!(resolution, CoverResolution::NetworkError(_)));
        assert!(store.writes().is_empty());
        assert_eq!(cache.lookup("k").await, CacheLookup::Miss);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_negative_entry_is_retried() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let mut entries = HashMap::new();
        entries.insert("k".to_string(), CacheEntry::missed(now - Duration::hours(25)));
        let store = InMemoryCacheStore::with_entries(entries);
        let cache = cache_with(store.clone(), clock).await;

        let (resolution, source) = cache
            .get_or_resolve("k", || async { CoverResolution::Found("https://new".into()) })
            .await;
        assert_eq!(resolution, CoverResolution::Found("https://new".into()));
        assert_eq!(source, ResolveSource::Lookup);
        assert_eq!(store.get("k").await, Some(CacheEntry::found("https://new")));
    }
}
