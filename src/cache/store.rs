// Persistent side of the prompt cache: artifacts + JSON metadata records

use base64::prelude::*;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const ARTIFACT_EXT: &str = "safetensors";
const META_SUFFIX: &str = ".meta.json";
const COMPRESSION_THRESHOLD: usize = 32_768; // 32KB

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cache metadata invalid: {0}")]
    Meta(String),
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),
}

/// Prompt text embedded in the metadata record, lz4-compressed when that
/// pays for itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPrompt {
    pub compressed: bool,
    pub data: String,
}

impl StoredPrompt {
    pub fn encode(text: &str) -> Self {
        let bytes = text.as_bytes();
        if bytes.len() > COMPRESSION_THRESHOLD {
            let compressed = compress_prepend_size(bytes);
            // Only keep compression when it provides significant benefit.
            if compressed.len() < bytes.len() * 3 / 4 {
                return Self {
                    compressed: true,
                    data: BASE64_STANDARD.encode(&compressed),
                };
            }
        }
        Self {
            compressed: false,
            data: BASE64_STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<String, CacheError> {
        let raw = BASE64_STANDARD
            .decode(&self.data)
            .map_err(|e| CacheError::Meta(format!("bad base64 payload: {e}")))?;
        let bytes = if self.compressed {
            decompress_size_prepended(&raw)
                .map_err(|e| CacheError::Meta(format!("bad lz4 payload: {e}")))?
        } else {
            raw
        };
        String::from_utf8(bytes).map_err(|e| CacheError::Meta(format!("bad utf-8 payload: {e}")))
    }
}

/// On-disk metadata record (`<key>.meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub model_id: String,
    pub cached_at_epoch_ms: i64,
    pub prompt_length: usize,
    pub artifact_path: PathBuf,
    pub prompt: StoredPrompt,
}

/// Filesystem layout and atomic write discipline for cache entries.
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys become file names; restrict them to a safe charset.
    pub fn validate_key(key: &str) -> Result<(), CacheError> {
        let ok = !key.is_empty()
            && key.len() <= 255
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(())
        } else {
            Err(CacheError::InvalidKey(key.to_string()))
        }
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{ARTIFACT_EXT}"))
    }

    pub fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{META_SUFFIX}"))
    }

    /// Sibling `.tmp` path used for atomic writes. Each call yields a unique
    /// file, so concurrent writers for one key never share a tmp file and
    /// only the final rename contends.
    pub fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", Uuid::new_v4()));
        path.with_file_name(name)
    }

    pub async fn write_meta(&self, key: &str, record: &CacheRecord) -> Result<(), CacheError> {
        let meta = self.meta_path(key);
        let tmp = Self::tmp_path(&meta);
        let payload = serde_json::to_vec_pretty(record)
            .map_err(|e| CacheError::Meta(format!("serialize failed: {e}")))?;
        if let Err(e) = tokio::fs::write(&tmp, &payload).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &meta).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn read_meta(&self, key: &str) -> Result<CacheRecord, CacheError> {
        let payload = tokio::fs::read(self.meta_path(key)).await?;
        serde_json::from_slice(&payload).map_err(|e| CacheError::Meta(format!("parse failed: {e}")))
    }

    /// Remove both the artifact and its metadata; missing files are fine.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        for path in [self.artifact_path(key), self.meta_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete artifacts older than `max_age` (and their metadata); returns
    /// the removed keys.
    pub async fn sweep(&self, max_age: Duration) -> Result<Vec<String>, CacheError> {
        let mut removed = Vec::new();
        let now = SystemTime::now();
        let mut dir = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key) = name.strip_suffix(&format!(".{ARTIFACT_EXT}")) else {
                continue;
            };

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            let key = key.to_string();
            self.remove(&key).await?;
            removed.push(key);
        }

        Ok(removed)
    }
}
