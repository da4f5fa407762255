//! Optional disk cache for query embeddings and query results.
//!
//! Entries are JSON files keyed by a blake3 digest of the namespace + key,
//! fronted by an in-memory map. TTL is enforced on read; total size is
//! trimmed oldest-first when the configured cap is exceeded.

use crate::config::{CacheBackend, CacheConfig};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize, Deserialize)]
struct Entry {
    stored_at: u64,
    value: Value,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct QueryCache {
    enabled: bool,
    dir: PathBuf,
    ttl: u64,
    max_bytes: u64,
    memory: DashMap<String, Value>,
}

impl QueryCache {
    pub fn new(config: &CacheConfig, base_dir: &Path) -> QueryCache {
        let mut enabled = config.enabled;
        if enabled && config.backend == CacheBackend::Redis {
            tracing::warn!("cache backend 'redis' is not available, caching disabled");
            enabled = false;
        }
        QueryCache {
            enabled,
            dir: base_dir.join("cache"),
            ttl: config.ttl,
            max_bytes: config.max_size_mb.saturating_mul(1024 * 1024),
            memory: DashMap::new(),
        }
    }

    pub fn disabled() -> QueryCache {
        QueryCache {
            enabled: false,
            dir: PathBuf::new(),
            ttl: 0,
            max_bytes: 0,
            memory: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn digest(namespace: &str, key: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b"\x00");
        hasher.update(key.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}.json"))
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let digest = Self::digest(namespace, key);
        if let Some(hit) = self.memory.get(&digest) {
            return Some(hit.clone());
        }

        let path = self.entry_path(&digest);
        let bytes = std::fs::read(&path).ok()?;
        let entry: Entry = serde_json::from_slice(&bytes).ok()?;
        if self.ttl > 0 && now_secs().saturating_sub(entry.stored_at) > self.ttl {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        self.memory.insert(digest, entry.value.clone());
        Some(entry.value)
    }

    pub fn put(&self, namespace: &str, key: &str, value: Value) {
        if !self.enabled {
            return;
        }
        let digest = Self::digest(namespace, key);
        self.memory.insert(digest.clone(), value.clone());

        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let entry = Entry { stored_at: now_secs(), value };
        if let Ok(bytes) = serde_json::to_vec(&entry) {
            let path = self.entry_path(&digest);
            let tmp = path.with_extension("json.tmp");
            if std::fs::write(&tmp, bytes).is_ok() {
                let _ = std::fs::rename(&tmp, &path);
            }
        }
        self.trim();
    }

    /// Delete oldest entries until total size fits the cap.
    fn trim(&self) {
        if self.max_bytes == 0 {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut files: Vec<(PathBuf, u64, SystemTime)> = entries
            .flatten()
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let modified = meta.modified().ok()?;
                Some((e.path(), meta.len(), modified))
            })
            .collect();

        let total: u64 = files.iter().map(|(_, len, _)| len).sum();
        if total <= self.max_bytes {
            return;
        }
        files.sort_by_key(|(_, _, modified)| *modified);
        let mut excess = total - self.max_bytes;
        for (path, len, _) in files {
            if excess == 0 {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                excess = excess.saturating_sub(len);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cached embedder
// ---------------------------------------------------------------------------

/// Embedder wrapper that memoizes per-text vectors through the disk cache.
/// Only texts missing from the cache reach the inner model.
pub struct CachedEmbedder {
    inner: std::sync::Arc<dyn crate::embed::Embedder>,
    cache: QueryCache,
}

impl CachedEmbedder {
    pub fn new(inner: std::sync::Arc<dyn crate::embed::Embedder>, cache: QueryCache) -> Self {
        CachedEmbedder { inner, cache }
    }
}

impl crate::embed::Embedder for CachedEmbedder {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn embed(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self
                .cache
                .get("embedding", text)
                .and_then(|v| serde_json::from_value::<Vec<f32>>(v).ok())
            {
                Some(vector) if vector.len() == self.inner.dim() => out[i] = Some(vector),
                _ => misses.push(i),
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.inner.embed(&miss_texts)?;
            for (&i, vector) in misses.iter().zip(fresh) {
                if let Ok(value) = serde_json::to_value(&vector) {
                    self.cache.put("embedding", &texts[i], value);
                }
                out[i] = Some(vector);
            }
        }

        Ok(out
            .into_iter()
            .map(|v| v.unwrap_or_else(|| vec![0.0; self.inner.dim()]))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
