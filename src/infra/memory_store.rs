use crate::app::ports::CacheStorePort;
use crate::error::Result;
use crate::types::CacheEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// In-memory cache store for tests and `--no-cache` runs.
#[derive(Clone, Default)]
pub struct InMemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    writes: Arc<Mutex<Vec<String>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: HashMap<String, CacheEntry>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Keys written via `set`, in write order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl CacheStorePort for InMemoryCacheStore {
    async fn load_all(&self) -> HashMap<String, CacheEntry> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), entry.clone());
        self.writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(key.to_string());
        debug!("Stored cover cache entry for {}", key);
        Ok(())
    }
}
