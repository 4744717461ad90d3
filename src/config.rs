use crate::constants::*;
use crate::error::{EnricherError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnricherConfig {
    pub lookup: LookupConfig,
    pub resolver: ResolverConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_results: u32,
    pub print_type: String,
    pub api_key: Option<String>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: GOOGLE_BOOKS_VOLUMES_URL.to_string(),
            timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            max_results: DEFAULT_MAX_RESULTS,
            print_type: DEFAULT_PRINT_TYPE.to_string(),
            api_key: None,
        }
    }
}

impl LookupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub retry_delay_ms: u64,
    pub min_code_len: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            min_code_len: MIN_SCANNED_CODE_LEN,
        }
    }
}

impl ResolverConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Json,
    Sqlite,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = EnricherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(CacheBackend::Json),
            "sqlite" => Ok(CacheBackend::Sqlite),
            "memory" => Ok(CacheBackend::Memory),
            other => Err(EnricherError::Config(format!("unknown cache backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: String,
    pub backend: CacheBackend,
    pub negative_ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_CACHE_PATH.to_string(),
            backend: CacheBackend::Json,
            negative_ttl_hours: DEFAULT_NEGATIVE_TTL_HOURS,
        }
    }
}

impl CacheConfig {
    pub fn negative_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.negative_ttl_hours)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub min_request_gap_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            min_request_gap_ms: DEFAULT_MIN_REQUEST_GAP_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn min_request_gap(&self) -> Duration {
        Duration::from_millis(self.min_request_gap_ms)
    }
}

fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EnricherError::Config(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

impl EnricherConfig {
    /// Load from a TOML file (defaults if the file does not exist), then apply
    /// environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                EnricherError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
            })?;
            Self::from_toml_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("ENRICHER_LOOKUP_BASE_URL") {
            self.lookup.base_url = url;
        }
        if let Some(ms) = env_parsed("ENRICHER_TIMEOUT_MS")? {
            self.lookup.timeout_ms = ms;
        }
        if let Ok(key) = std::env::var("GOOGLE_BOOKS_API_KEY") {
            if !key.trim().is_empty() {
                self.lookup.api_key = Some(key);
            }
        }
        if let Some(n) = env_parsed("ENRICHER_MAX_CONCURRENCY")? {
            self.scheduler.max_concurrency = n;
        }
        if let Some(ms) = env_parsed("ENRICHER_MIN_REQUEST_GAP_MS")? {
            self.scheduler.min_request_gap_ms = ms;
        }
        if let Ok(path) = std::env::var("ENRICHER_CACHE_PATH") {
            self.cache.path = path;
        }
        if let Some(backend) = env_parsed::<CacheBackend>("ENRICHER_CACHE_BACKEND")? {
            self.cache.backend = backend;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrency == 0 {
            return Err(EnricherError::Config(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.lookup.timeout_ms == 0 {
            return Err(EnricherError::Config("lookup.timeout_ms must be positive".to_string()));
        }
        if self.cache.negative_ttl_hours < 0 {
            return Err(EnricherError::Config(
                "cache.negative_ttl_hours must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
