use crate::app::ports::CacheStorePort;
use crate::error::Result;
use crate::types::CacheEntry;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Cover cache persisted as one JSON object, `key -> { url, failedAt }`.
///
/// The file is read once on open and rewritten in full on every `set`.
pub struct JsonFileCacheStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

impl JsonFileCacheStore {
    /// Open the store. A missing, unreadable or malformed file starts empty.
    pub async fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = read_entries(&path).await;
        debug!("Loaded {} cover cache entries from {}", entries.len(), path.display());
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_all(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

async fn read_entries(path: &Path) -> BTreeMap<String, CacheEntry> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!("Cover cache {} unreadable, starting empty: {}", path.display(), e);
            return BTreeMap::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cover cache {} is malformed, starting empty: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

#[async_trait]
impl CacheStorePort for JsonFileCacheStore {
    async fn load_all(&self) -> HashMap<String, CacheEntry> {
        let entries = self.entries.lock().await;
        entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        // Hold the lock across the rewrite so concurrent writers never interleave files
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), entry.clone());
        self.write_all(&entries).await
    }
}
