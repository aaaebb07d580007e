// Two-level prompt-prefix cache: bounded LRU records over the disk store

use chrono::Utc;
use log::{debug, info, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::store::{CacheRecord, CacheStore, StoredPrompt};
use crate::models::ModelManager;
use crate::runtime::Runtime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCacheConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_max_in_memory")]
    pub max_in_memory: usize,
    /// Default age bound for `sweep`.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".orchard/prompt_cache")
}

fn default_max_in_memory() -> usize {
    50
}

fn default_max_age_secs() -> u64 {
    30 * 24 * 60 * 60 // 30 days
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            max_in_memory: default_max_in_memory(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl PromptCacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

struct MemEntry {
    model_id: String,
    prompt: String,
    artifact_path: PathBuf,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    byte_size: u64,
}

/// Successful lookup: the cached prefix text plus the on-disk artifact the
/// runtime can resume from.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub prompt: String,
    pub artifact_path: PathBuf,
}

/// Per-entry view used by `entries()`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub model_id: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub access_count: u64,
    pub byte_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub count: usize,
    pub hit_rate: f64,
    pub root_dir: PathBuf,
    pub max_in_memory: usize,
}

/// Prompt-prefix cache fronting the runtime's `cache_prompt` primitive.
///
/// A single lock protects the in-memory records; disk I/O and runtime calls
/// happen outside it. Artifact and metadata writes go through sibling `.tmp`
/// files and atomic renames, so concurrent puts for one key settle on the
/// last writer.
pub struct PromptCache {
    config: PromptCacheConfig,
    store: CacheStore,
    manager: Arc<ModelManager>,
    runtime: Arc<dyn Runtime>,
    entries: Mutex<LruCache<String, MemEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PromptCache {
    pub fn new(
        config: PromptCacheConfig,
        manager: Arc<ModelManager>,
        runtime: Arc<dyn Runtime>,
    ) -> std::io::Result<Self> {
        let store = CacheStore::new(config.root_dir.clone())?;
        let capacity =
            NonZeroUsize::new(config.max_in_memory).unwrap_or(NonZeroUsize::new(1).unwrap());
        info!("prompt cache initialized at {:?}", store.root());
        Ok(Self {
            config,
            store,
            manager,
            runtime,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PromptCacheConfig {
        &self.config
    }

    /// Materialize the prefix artifact for `prompt` under `key` and record
    /// it. Returns false on any runtime or storage failure, leaving the
    /// cache unchanged.
    pub async fn put(&self, key: &str, model_name: &str, prompt: &str) -> bool {
        if let Err(e) = CacheStore::validate_key(key) {
            warn!("prompt cache put rejected: {e}");
            return false;
        }

        let lease = match self.manager.get(model_name).await {
            Some(lease) => lease,
            None => {
                if !self.manager.load(model_name).await {
                    warn!("prompt cache put failed: model {model_name} unavailable");
                    return false;
                }
                match self.manager.get(model_name).await {
                    Some(lease) => lease,
                    None => return false,
                }
            }
        };

        let artifact = self.store.artifact_path(key);
        let tmp = CacheStore::tmp_path(&artifact);

        if let Err(e) = self
            .runtime
            .cache_prompt(&lease.handles.model, &lease.handles.tokenizer, prompt, &tmp)
            .await
        {
            warn!("prompt caching failed for {key}: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
            return false;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &artifact).await {
            warn!("prompt cache rename failed for {key}: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
            return false;
        }

        let byte_size = tokio::fs::metadata(&artifact)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let record = CacheRecord {
            model_id: lease.config.id.clone(),
            cached_at_epoch_ms: Utc::now().timestamp_millis(),
            prompt_length: prompt.len(),
            artifact_path: artifact.clone(),
            prompt: StoredPrompt::encode(prompt),
        };
        if let Err(e) = self.store.write_meta(key, &record).await {
            warn!("prompt cache metadata write failed for {key}: {e}");
            let _ = tokio::fs::remove_file(&artifact).await;
            return false;
        }

        let now = Instant::now();
        let entry = MemEntry {
            model_id: lease.config.id.clone(),
            prompt: prompt.to_string(),
            artifact_path: artifact,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            byte_size,
        };
        self.entries.lock().unwrap().put(key.to_string(), entry);
        debug!("cached prompt prefix {key} ({byte_size} bytes)");
        true
    }

    /// Look up `key`, hydrating from disk when only the persistent copy
    /// exists. Hits are promoted to MRU position.
    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        if CacheStore::validate_key(key).is_err() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(key) {
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(CacheHit {
                    prompt: entry.prompt.clone(),
                    artifact_path: entry.artifact_path.clone(),
                });
            }
        }

        // Disk-only hit: hydrate the in-memory record first.
        match self.hydrate(key).await {
            Some(hit) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(hit)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn hydrate(&self, key: &str) -> Option<CacheHit> {
        let record = match self.store.read_meta(key).await {
            Ok(record) => record,
            Err(e) => {
                debug!("no persisted cache entry for {key}: {e}");
                return None;
            }
        };
        let artifact = self.store.artifact_path(key);
        match tokio::fs::try_exists(&artifact).await {
            Ok(true) => {}
            _ => {
                debug!("cache artifact missing for {key}");
                return None;
            }
        }
        let prompt = match record.prompt.decode() {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("cache entry for {key} is corrupt, treating as miss: {e}");
                return None;
            }
        };
        let byte_size = tokio::fs::metadata(&artifact)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let now = Instant::now();
        let entry = MemEntry {
            model_id: record.model_id,
            prompt: prompt.clone(),
            artifact_path: artifact.clone(),
            created_at: now,
            last_accessed: now,
            access_count: 1,
            byte_size,
        };
        self.entries.lock().unwrap().put(key.to_string(), entry);
        debug!("hydrated cache entry {key} from disk");

        Some(CacheHit {
            prompt,
            artifact_path: artifact,
        })
    }

    /// Remove both the in-memory record and the persisted copies.
    pub async fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().pop(key);
        if let Err(e) = self.store.remove(key).await {
            warn!("failed to remove persisted cache entry {key}: {e}");
        }
    }

    /// Remove persisted artifacts older than `max_age` and purge their
    /// in-memory records. Returns how many entries were removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let removed = match self.store.sweep(max_age).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("cache sweep failed: {e}");
                return 0;
            }
        };
        if !removed.is_empty() {
            let mut entries = self.entries.lock().unwrap();
            for key in &removed {
                entries.pop(key);
            }
            info!("swept {} stale cache entries", removed.len());
        }
        removed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            count: self.entries.lock().unwrap().len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            root_dir: self.config.root_dir.clone(),
            max_in_memory: self.config.max_in_memory,
        }
    }

    /// In-memory records, most recently used first.
    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(key, entry)| CacheEntryInfo {
                key: key.clone(),
                model_id: entry.model_id.clone(),
                age_ms: entry.created_at.elapsed().as_millis() as u64,
                idle_ms: entry.last_accessed.elapsed().as_millis() as u64,
                access_count: entry.access_count,
                byte_size: entry.byte_size,
            })
            .collect()
    }

    /// Drop every in-memory record, keeping the persisted copies. Lets tests
    /// exercise the restart/hydration path.
    pub fn drop_memory_records(&self) {
        self.entries.lock().unwrap().clear();
    }
}
