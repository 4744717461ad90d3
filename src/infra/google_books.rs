//! Google Books volumes adapter for the bibliographic lookup port.

use crate::app::ports::{BibliographicLookupPort, CallContext};
use crate::config::LookupConfig;
use crate::constants::{IDENTIFIER_TYPE_ISBN_10, IDENTIFIER_TYPE_ISBN_13};
use crate::error::{LookupError, Result};
use crate::observability::metrics;
use crate::types::BibliographicRecord;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}").expect("static year pattern"));

#[derive(Debug, Default, Deserialize)]
pub struct VolumesResponse {
    #[serde(default)]
    pub items: Option<Vec<Volume>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Volume {
    #[serde(default, rename = "volumeInfo")]
    pub volume_info: Option<VolumeInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VolumeInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Option<Vec<String>>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "imageLinks")]
    pub image_links: Option<ImageLinks>,
    #[serde(default, rename = "industryIdentifiers")]
    pub industry_identifiers: Option<Vec<IndustryIdentifier>>,
    // Kept loose: some responses carry strings or garbage here
    #[serde(default, rename = "pageCount")]
    pub page_count: Option<Value>,
    #[serde(default, rename = "publishedDate")]
    pub published_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageLinks {
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default, rename = "smallThumbnail")]
    pub small_thumbnail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IndustryIdentifier {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
}

/// Rewrite `http://` cover references to `https://`.
pub fn secure_url(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{}", rest),
        None => url.to_string(),
    }
}

fn parse_page_count(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_published_year(date: Option<&str>) -> Option<i32> {
    YEAR.find(date?).and_then(|m| m.as_str().parse().ok())
}

fn identifier_of(info: &VolumeInfo, kind: &str) -> Option<String> {
    info.industry_identifiers
        .as_ref()?
        .iter()
        .find(|id| id.kind.as_deref() == Some(kind))
        .and_then(|id| id.identifier.clone())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty()).cloned()
}

/// Map the first volume of a response into a record.
///
/// A missing `items` array, an empty one, or a first item without
/// `volumeInfo` all mean "no result".
pub fn map_volume_response(response: &VolumesResponse) -> Option<BibliographicRecord> {
    let info = response.items.as_ref()?.first()?.volume_info.as_ref()?;

    let cover_url = info
        .image_links
        .as_ref()
        .and_then(|links| {
            non_empty(links.thumbnail.as_ref()).or_else(|| non_empty(links.small_thumbnail.as_ref()))
        })
        .map(|url| secure_url(&url));

    Some(BibliographicRecord {
        title: info.title.clone().unwrap_or_default(),
        author: info
            .authors
            .as_ref()
            .map(|a| a.join(", "))
            .unwrap_or_default(),
        genre: info.categories.as_ref().and_then(|c| c.first().cloned()),
        isbn: identifier_of(info, IDENTIFIER_TYPE_ISBN_10),
        isbn13: identifier_of(info, IDENTIFIER_TYPE_ISBN_13),
        description: non_empty(info.description.as_ref()),
        cover_url,
        page_count: parse_page_count(info.page_count.as_ref()),
        published_year: parse_published_year(info.published_date.as_deref()),
    })
}

pub fn parse_volume_response(body: &str) -> serde_json::Result<Option<BibliographicRecord>> {
    let response: VolumesResponse = serde_json::from_str(body)?;
    Ok(map_volume_response(&response))
}

pub struct GoogleBooksClient {
    client: reqwest::Client,
    base_url: String,
    max_results: u32,
    print_type: String,
    api_key: Option<String>,
}

impl GoogleBooksClient {
    pub fn new(config: &LookupConfig) -> Result<Self> {
        // The per-call deadline lives in CallContext; this is only a backstop
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.saturating_mul(2)))
            .user_agent(concat!("shelf_enricher/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_http_client(config, client))
    }

    /// Use a caller-built HTTP client (proxy or TLS settings, tests).
    pub fn with_http_client(config: &LookupConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            max_results: config.max_results,
            print_type: config.print_type.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn query_params(&self, query: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", self.max_results.to_string()),
            ("printType", self.print_type.clone()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.clone()));
        }
        params
    }
}

#[async_trait]
impl BibliographicLookupPort for GoogleBooksClient {
    async fn lookup(
        &self,
        query: &str,
        ctx: &CallContext,
    ) -> std::result::Result<Option<BibliographicRecord>, LookupError> {
        let _timing = metrics::time_operation(metrics::MetricName::LookupDuration);
        debug!("Google Books query: {}", query);

        let result = ctx
            .run(async {
                let resp = self
                    .client
                    .get(&self.base_url)
                    .query(&self.query_params(query))
                    .send()
                    .await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(LookupError::Transport(format!("HTTP status {}", status)));
                }
                let body: VolumesResponse = resp.json().await?;
                Ok(map_volume_response(&body))
            })
            .await;

        match &result {
            Ok(Some(_)) => metrics::lookup::completed("found"),
            Ok(None) => metrics::lookup::completed("empty"),
            Err(LookupError::Timeout) => {
                warn!("Google Books query timed out: {}", query);
                metrics::lookup::completed("timeout");
            }
            Err(LookupError::Transport(e)) => {
                warn!("Google Books query failed ({}): {}", query, e);
                metrics::lookup::completed("transport_error");
            }
        }
        result
    }
}
