//! Multi-step fallback resolution of scanned codes and title/author pairs.

use crate::app::ports::{BibliographicLookupPort, CallContext};
use crate::config::ResolverConfig;
use crate::constants::EXACT_IDENTIFIER_PREFIX;
use crate::error::LookupError;
use crate::isbn::{is_queryable_candidate, lookup_candidates_from_barcode, normalize};
use crate::observability::metrics;
use crate::types::{BibliographicRecord, Book, ResolveOutcome, ResolveStrategy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Cover-only view of a resolution, shared between joined waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverResolution {
    Found(String),
    NotFound,
    NetworkError(String),
}

pub struct Resolver {
    lookup: Arc<dyn BibliographicLookupPort>,
    config: ResolverConfig,
    call_timeout: Duration,
}

/// Tally of how the queries of one step loop ended.
#[derive(Debug, Default)]
struct StepTally {
    queries: usize,
    transport_failures: usize,
    last_error: Option<String>,
}

impl StepTally {
    /// Nothing found: `NetworkError` only if every attempt failed at transport level.
    fn into_outcome(self) -> ResolveOutcome {
        if self.queries > 0 && self.transport_failures == self.queries {
            return ResolveOutcome::NetworkError {
                reason: self
                    .last_error
                    .unwrap_or_else(|| "every lookup failed".to_string()),
            };
        }
        ResolveOutcome::NotFound
    }
}

impl Resolver {
    pub fn new(
        lookup: Arc<dyn BibliographicLookupPort>,
        config: ResolverConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            lookup,
            config,
            call_timeout,
        }
    }

    /// Resolve one raw scanned code through exact-identifier then bare queries.
    #[instrument(skip(self))]
    pub async fn resolve_scanned_code(&self, raw: &str) -> ResolveOutcome {
        let code = normalize(raw);
        if code.len() < self.config.min_code_len {
            debug!("Scanned code too short after normalization: '{}'", code);
            metrics::resolver::outcome("not_found");
            return ResolveOutcome::NotFound;
        }

        let candidates: Vec<String> = lookup_candidates_from_barcode(&code)
            .into_iter()
            .filter(|c| is_queryable_candidate(c))
            .collect();
        debug!("Lookup candidates for {}: {:?}", code, candidates);

        let outcome = self.resolve_candidates(&candidates).await;
        info!("Resolved {} -> {}", code, outcome.kind());
        metrics::resolver::outcome(outcome.kind());
        outcome
    }

    async fn resolve_candidates(&self, candidates: &[String]) -> ResolveOutcome {
        let mut tally = StepTally::default();

        // Step A: exact identifier queries
        for candidate in candidates {
            let query = format!("{}{}", EXACT_IDENTIFIER_PREFIX, candidate);
            match self.query_with_retry(&query, &mut tally).await {
                Ok(Some(record)) => return classify(record, ResolveStrategy::ExactIdentifier),
                Ok(None) => {}
                Err(reason) => return ResolveOutcome::NetworkError { reason },
            }
        }

        // Step B: bare candidate strings, lower confidence
        for candidate in candidates {
            match self.query_with_retry(candidate, &mut tally).await {
                Ok(Some(record)) => {
                    return ResolveOutcome::Partial {
                        record,
                        strategy: ResolveStrategy::BareQuery,
                    }
                }
                Ok(None) => {}
                Err(reason) => return ResolveOutcome::NetworkError { reason },
            }
        }

        tally.into_outcome()
    }

    /// One query, retried once after the configured delay on an empty result
    /// or a non-timeout failure. `Err` carries a timeout reason and ends the
    /// whole resolution.
    async fn query_with_retry(
        &self,
        query: &str,
        tally: &mut StepTally,
    ) -> Result<Option<BibliographicRecord>, String> {
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
            tally.queries += 1;
            match self.query_once(query).await {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(LookupError::Timeout) => {
                    warn!("Lookup timed out for '{}'", query);
                    return Err(LookupError::Timeout.to_string());
                }
                Err(LookupError::Transport(e)) => {
                    tally.transport_failures += 1;
                    tally.last_error = Some(e);
                }
            }
        }
        Ok(None)
    }

    /// A single call; records without a title count as empty.
    async fn query_once(&self, query: &str) -> Result<Option<BibliographicRecord>, LookupError> {
        let ctx = CallContext::with_timeout(self.call_timeout);
        let record = self.lookup.lookup(query, &ctx).await?;
        Ok(record.filter(BibliographicRecord::is_usable))
    }

    /// Title/author search for callers without a scanned code. Single shot:
    /// `intitle:`/`inauthor:` first, then loose terms.
    #[instrument(skip(self))]
    pub async fn search_by_title_author(&self, title: &str, author: &str) -> ResolveOutcome {
        let title = title.trim();
        let author = author.trim();
        if title.is_empty() {
            metrics::resolver::outcome("not_found");
            return ResolveOutcome::NotFound;
        }

        let structured = if author.is_empty() {
            format!("intitle:{}", title)
        } else {
            format!("intitle:{} inauthor:{}", title, author)
        };
        let loose = format!("{} {}", title, author).trim().to_string();

        let mut tally = StepTally::default();
        for (query, first) in [(structured, true), (loose, false)] {
            tally.queries += 1;
            match self.query_once(&query).await {
                Ok(Some(record)) if first => {
                    let outcome = classify(record, ResolveStrategy::TitleAuthor);
                    metrics::resolver::outcome(outcome.kind());
                    return outcome;
                }
                Ok(Some(record)) => {
                    metrics::resolver::outcome("partial");
                    return ResolveOutcome::Partial {
                        record,
                        strategy: ResolveStrategy::TitleAuthor,
                    };
                }
                Ok(None) => {}
                Err(LookupError::Timeout) => {
                    metrics::resolver::outcome("network_error");
                    return ResolveOutcome::NetworkError {
                        reason: LookupError::Timeout.to_string(),
                    };
                }
                Err(LookupError::Transport(e)) => {
                    tally.transport_failures += 1;
                    tally.last_error = Some(e);
                }
            }
        }

        let outcome = tally.into_outcome();
        metrics::resolver::outcome(outcome.kind());
        outcome
    }

    /// Identifier-first, then title/author: the cover lookup for one book.
    pub async fn resolve_cover_for_book(&self, book: &Book) -> CoverResolution {
        let identifier = [book.isbn13.as_deref(), book.isbn.as_deref()]
            .into_iter()
            .flatten()
            .map(normalize)
            .find(|code| code.len() >= self.config.min_code_len);

        if let Some(code) = identifier {
            let outcome = self.resolve_scanned_code(&code).await;
            if let Some(url) = outcome.cover_url() {
                return CoverResolution::Found(url.to_string());
            }
            if let ResolveOutcome::NetworkError { reason } = outcome {
                return CoverResolution::NetworkError(reason);
            }
        }

        if book.title.trim().is_empty() {
            return CoverResolution::NotFound;
        }
        let outcome = self.search_by_title_author(&book.title, &book.author).await;
        match outcome {
            ResolveOutcome::NetworkError { reason } => CoverResolution::NetworkError(reason),
            other => match other.cover_url() {
                Some(url) => CoverResolution::Found(url.to_string()),
                None => CoverResolution::NotFound,
            },
        }
    }
}

fn classify(record: BibliographicRecord, strategy: ResolveStrategy) -> ResolveOutcome {
    if record.has_cover_and_description() {
        ResolveOutcome::Success { record, strategy }
    } else {
        ResolveOutcome::Partial { record, strategy }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted lookup: each query maps to a queue of responses; unknown
    /// queries answer "no result".
    #[derive(Default)]
    struct ScriptedLookup {
        script: Mutex<HashMap<String, Vec<Result<Option<BibliographicRecord>, LookupError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedLookup {
        fn on(self, query: &str, response: Result<Option<BibliographicRecord>, LookupError>) -> Self {
            self.script
                .lock()
                .unwrap()
                .entry(query.to_string())
                .or_default()
                .push(response);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BibliographicLookupPort for ScriptedLookup {
        async fn lookup(
            &self,
            query: &str,
            _ctx: &CallContext,
        ) -> Result<Option<BibliographicRecord>, LookupError> {
            self.calls.lock().unwrap().push(query.to_string());
            let mut script = self.script.lock().unwrap();
            match script.get_mut(query) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(None),
            }
        }
    }

    fn record(title: &str, cover: Option<&str>, description: Option<&str>) -> BibliographicRecord {
        BibliographicRecord {
            title: title.to_string(),
            author: "Author".to_string(),
            cover_url: cover.map(str::to_string),
            description: description.map(str::to_string),
            ..Default::default()
        }
    }

    fn resolver(lookup: Arc<ScriptedLookup>) -> Resolver {
        let config = ResolverConfig {
            retry_delay_ms: 1,
            ..Default::default()
        };
        Resolver::new(lookup, config, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_short_code_is_not_found_without_calls() {
        let lookup = Arc::new(ScriptedLookup::default());
        let outcome = resolver(lookup.clone()).resolve_scanned_code("12-34").await;
        assert_eq!(outcome, ResolveOutcome::NotFound);
        assert!(lookup.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exact_hit_with_cover_and_description_is_success() {
        let lookup = Arc::new(ScriptedLookup::default().on(
            "isbn:9780306406157",
            Ok(Some(record("Signals", Some("https://c"), Some("d")))),
        ));
        let outcome = resolver(lookup.clone()).resolve_scanned_code("0-306-40615-2").await;
        assert_eq!(outcome.kind(), "success");
        assert_eq!(lookup.calls(), vec!["isbn:9780306406157"]);
    }

    #[tokio::test]
    async fn test_exact_hit_without_description_is_partial() {
        let lookup = Arc::new(ScriptedLookup::default().on(
            "isbn:0306406152",
            Ok(Some(record("Signals", Some("https://c"), None))),
        ));
        let outcome = resolver(lookup.clone()).resolve_scanned_code("0306406152").await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Partial { strategy: ResolveStrategy::ExactIdentifier, .. }
        ));
        // 13-digit form first (tried twice), then the 10-digit form
        assert_eq!(
            lookup.calls(),
            vec!["isbn:9780306406157", "isbn:9780306406157", "isbn:0306406152"]
        );
    }

    #[tokio::test]
    async fn test_retry_after_empty_result() {
        let lookup = Arc::new(
            ScriptedLookup::default()
                .on("isbn:9780306406157", Ok(None))
                .on("isbn:9780306406157", Ok(Some(record("Signals", Some("https://c"), Some("d"))))),
        );
        let outcome = resolver(lookup.clone()).resolve_scanned_code("9780306406157").await;
        assert_eq!(outcome.kind(), "success");
        assert_eq!(lookup.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_untitled_record_is_not_usable() {
        let lookup = Arc::new(
            ScriptedLookup::default()
                .on("isbn:9780306406157", Ok(Some(record("", Some("https://c"), Some("d")))))
                .on("9780306406157", Ok(Some(record("Bare", None, None)))),
        );
        let outcome = resolver(lookup).resolve_scanned_code("9780306406157").await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Partial { strategy: ResolveStrategy::BareQuery, ref record } if record.title == "Bare"
        ));
    }

    #[tokio::test]
    async fn test_bare_query_fallback_is_always_partial() {
        let lookup = Arc::new(ScriptedLookup::default().on(
            "0306406152",
            Ok(Some(record("Signals", Some("https://c"), Some("d")))),
        ));
        let outcome = resolver(lookup.clone()).resolve_scanned_code("9780306406157").await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Partial { strategy: ResolveStrategy::BareQuery, .. }
        ));
        // Step A: 2 candidates x 2 attempts, Step B: first candidate twice, then hit
        assert_eq!(lookup.calls().len(), 7);
    }

    #[tokio::test]
    async fn test_exhausted_candidates_is_not_found() {
        let lookup = Arc::new(ScriptedLookup::default());
        let outcome = resolver(lookup.clone()).resolve_scanned_code("9780306406157").await;
        assert_eq!(outcome, ResolveOutcome::NotFound);
        assert_eq!(lookup.calls().len(), 8);
    }

    #[tokio::test]
    async fn test_timeout_short_circuits() {
        let lookup = Arc::new(
            ScriptedLookup::default().on("isbn:9780306406157", Err(LookupError::Timeout)),
        );
        let outcome = resolver(lookup.clone()).resolve_scanned_code("9780306406157").await;
        assert!(outcome.is_network_error());
        assert_eq!(lookup.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_all_transport_failures_is_network_error() {
        let mut lookup = ScriptedLookup::default();
        for q in ["isbn:9791032305690", "9791032305690"] {
            lookup = lookup
                .on(q, Err(LookupError::Transport("connection refused".into())))
                .on(q, Err(LookupError::Transport("connection refused".into())));
        }
        let outcome = resolver(Arc::new(lookup)).resolve_scanned_code("9791032305690").await;
        assert_eq!(
            outcome,
            ResolveOutcome::NetworkError {
                reason: "connection refused".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_title_author_search() {
        let lookup = Arc::new(ScriptedLookup::default().on(
            "intitle:Dune inauthor:Frank Herbert",
            Ok(Some(record("Dune", Some("https://c"), Some("d")))),
        ));
        let outcome = resolver(lookup.clone())
            .search_by_title_author(" Dune ", "Frank Herbert")
            .await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Success { strategy: ResolveStrategy::TitleAuthor, .. }
        ));
        assert_eq!(lookup.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_title_author_loose_fallback_is_partial() {
        let lookup = Arc::new(ScriptedLookup::default().on(
            "Dune",
            Ok(Some(record("Dune", Some("https://c"), Some("d")))),
        ));
        let outcome = resolver(lookup.clone()).search_by_title_author("Dune", "").await;
        assert_eq!(outcome.kind(), "partial");
        assert_eq!(lookup.calls(), vec!["intitle:Dune", "Dune"]);
    }

    #[tokio::test]
    async fn test_cover_for_book_falls_back_to_title_author() {
        let lookup = Arc::new(ScriptedLookup::default().on(
            "intitle:Dune inauthor:Frank Herbert",
            Ok(Some(record("Dune", Some("https://cover/dune"), None))),
        ));
        let book = Book::new("Dune", "Frank Herbert").with_isbn("0306406152");
        let resolution = resolver(lookup).resolve_cover_for_book(&book).await;
        assert_eq!(resolution, CoverResolution::Found("https://cover/dune".to_string()));
    }

    #[tokio::test]
    async fn test_cover_for_book_without_title_or_identifier() {
        let lookup = Arc::new(ScriptedLookup::default());
        let resolution = resolver(lookup.clone())
            .resolve_cover_for_book(&Book::new("  ", "Someone"))
            .await;
        assert_eq!(resolution, CoverResolution::NotFound);
        assert!(lookup.calls().is_empty());
    }

    #[tokio::test]
    async fn test_title_author_single_transport_failure_is_not_found() {
        let lookup = Arc::new(ScriptedLookup::default().on(
            "intitle:Dune inauthor:Frank Herbert",
            Err(LookupError::Transport("connection reset".into())),
        ));
        let outcome = resolver(lookup.clone())
            .search_by_title_author("Dune", "Frank Herbert")
            .await;
        assert_eq!(outcome, ResolveOutcome::NotFound);
        assert_eq!(
            lookup.calls(),
            vec!["intitle:Dune inauthor:Frank Herbert", "Dune Frank Herbert"]
        );
    }

    #[tokio::test]
    async fn test_title_author_all_transport_failures_is_network_error() {
        let lookup = Arc::new(
            ScriptedLookup::default()
                .on("intitle:Dune", Err(LookupError::Transport("connection reset".into())))
                .on("Dune", Err(LookupError::Transport("connection refused".into()))),
        );
        let outcome = resolver(lookup).search_by_title_author("Dune", "").await;
        assert_eq!(
            outcome,
            ResolveOutcome::NetworkError {
                reason: "connection refused".to_string()
            }
        );
    }
}
