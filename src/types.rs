use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A book record handed over by a batch caller.
///
/// Only `title` and `author` are required; identifiers and an existing cover
/// are respected as short-circuits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Book {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub isbn13: Option<String>,
    #[serde(default, alias = "coverUrl", alias = "cover")]
    pub cover_url: Option<String>,
}

impl Book {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            ..Default::default()
        }
    }

    pub fn with_isbn(mut self, isbn: impl Into<String>) -> Self {
        self.isbn = Some(isbn.into());
        self
    }

    pub fn with_isbn13(mut self, isbn13: impl Into<String>) -> Self {
        self.isbn13 = Some(isbn13.into());
        self
    }

    pub fn with_cover(mut self, cover_url: impl Into<String>) -> Self {
        self.cover_url = Some(cover_url.into());
        self
    }

    /// Default "already has a cover" predicate used by the scheduler.
    pub fn has_cover(&self) -> bool {
        self.cover_url
            .as_deref()
            .map(|u| !u.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Canonical metadata resolved for one book.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BibliographicRecord {
    pub title: String,
    pub author: String,
    pub genre: Option<String>,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub page_count: Option<u32>,
    pub published_year: Option<i32>,
}

impl BibliographicRecord {
    /// A record is usable only when the service returned a non-empty title.
    pub fn is_usable(&self) -> bool {
        !self.title.trim().is_empty()
    }

    pub fn has_cover_and_description(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
        present(&self.cover_url) && present(&self.description)
    }
}

/// Which query shape produced a resolved record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStrategy {
    /// `isbn:<candidate>`
    ExactIdentifier,
    /// The bare candidate string, no prefix
    BareQuery,
    /// `intitle:`/`inauthor:` terms or loose title/author terms
    TitleAuthor,
}

/// Result of resolving one scanned code or one title/author pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Success {
        record: BibliographicRecord,
        strategy: ResolveStrategy,
    },
    Partial {
        record: BibliographicRecord,
        strategy: ResolveStrategy,
    },
    NotFound,
    NetworkError {
        reason: String,
    },
}

impl ResolveOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveOutcome::Success { .. } => "success",
            ResolveOutcome::Partial { .. } => "partial",
            ResolveOutcome::NotFound => "not_found",
            ResolveOutcome::NetworkError { .. } => "network_error",
        }
    }

    pub fn record(&self) -> Option<&BibliographicRecord> {
        match self {
            ResolveOutcome::Success { record, .. } | ResolveOutcome::Partial { record, .. } => {
                Some(record)
            }
            _ => None,
        }
    }

    pub fn cover_url(&self) -> Option<&str> {
        self.record()
            .and_then(|r| r.cover_url.as_deref())
            .filter(|u| !u.is_empty())
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, ResolveOutcome::NetworkError { .. })
    }
}

/// Memoized lookup outcome for one cache key.
///
/// Serialized as `{ "url": string|null, "failedAt": ISO-8601|null }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "failedAt")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn found(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            failed_at: None,
        }
    }

    pub fn missed(at: DateTime<Utc>) -> Self {
        Self {
            url: None,
            failed_at: Some(at),
        }
    }

    pub fn positive_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }

    /// A negative entry younger than `ttl` suppresses re-resolution.
    pub fn is_fresh_miss(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if self.positive_url().is_some() {
            return false;
        }
        match self.failed_at {
            Some(failed_at) => now - failed_at < ttl,
            None => false,
        }
    }
}

/// Per-index result of one scheduler batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    /// The caller's predicate said the book already carries a cover
    AlreadyHasCover,
    /// Served from a positive cache entry without an external call
    Cached(String),
    /// Resolved by this batch (possibly by joining another worker's lookup)
    Resolved(String),
    /// A fresh negative cache entry suppressed the lookup
    RecentMiss,
    /// Lookup ran and found no cover; a negative entry was recorded
    NotFound,
    /// Lookup could not complete (network failure or worker fault)
    Failed(String),
}

impl EnrichmentOutcome {
    pub fn cover_url(&self) -> Option<&str> {
        match self {
            EnrichmentOutcome::Cached(url) | EnrichmentOutcome::Resolved(url) => Some(url),
            _ => None,
        }
    }
}
