//! Dense vector index — cosine search over flat L2-normalized storage.
//!
//! Embeddings live in one flat `Vec<f32>` (`count * dim`) so the scoring
//! loop is a straight dot-product scan; vectors are unit length, making dot
//! product equal cosine similarity. HNSW-style tuning parameters from the
//! configuration are accepted and recorded but the scan itself is exact,
//! which the contract permits as a fallback.

use crate::embed::l2_normalize;
use crate::error::{CoreError, Result};
use crate::types::ElementType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type Meta = serde_json::Map<String, serde_json::Value>;

/// One search hit: payload metadata plus cosine score.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub metadata: Meta,
    pub score: f32,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub struct VectorIndex {
    dim: usize,
    vectors: Vec<f32>,
    metadata: Vec<Meta>,
    in_memory: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    dim: usize,
    count: usize,
    vectors: Vec<f32>,
    metadata: Vec<Meta>,
}

impl VectorIndex {
    pub fn new(dim: usize, in_memory: bool) -> Self {
        VectorIndex { dim, vectors: Vec::new(), metadata: Vec::new(), in_memory }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn clear(&mut self) {
        self.vectors.clear();
        self.metadata.clear();
    }

    /// Append vectors with their payloads. Vectors are normalized on insert.
    pub fn add(&mut self, vectors: Vec<Vec<f32>>, metadata: Vec<Meta>) -> Result<()> {
        if vectors.len() != metadata.len() {
            return Err(CoreError::Internal(format!(
                "vector/metadata length mismatch: {} vs {}",
                vectors.len(),
                metadata.len()
            )));
        }
        for v in &vectors {
            if v.len() != self.dim {
                return Err(CoreError::DimensionMismatch { expected: self.dim, got: v.len() });
            }
        }
        for mut v in vectors {
            l2_normalize(&mut v);
            self.vectors.extend_from_slice(&v);
        }
        self.metadata.extend(metadata);
        Ok(())
    }

    /// Cosine kNN. `repo_filter` and `type_filter` are applied after the
    /// scan; with a type filter the scan over-fetches k*5 before trimming so
    /// filtered results do not starve.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        repo_filter: Option<&[String]>,
        type_filter: Option<ElementType>,
    ) -> Vec<VectorHit> {
        if self.is_empty() || query.len() != self.dim || k == 0 {
            return Vec::new();
        }
        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let fetch = if type_filter.is_some() { k * 5 } else { k };

        let mut scored: Vec<(usize, f32)> = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            let offset = i * self.dim;
            let emb = &self.vectors[offset..offset + self.dim];
            let dot: f32 = q.iter().zip(emb.iter()).map(|(a, b)| a * b).sum();
            if dot >= min_score {
                scored.push((i, dot));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(fetch);

        let mut hits = Vec::with_capacity(k);
        for (idx, score) in scored {
            let meta = &self.metadata[idx];
            if let Some(repos) = repo_filter {
                let repo = meta.get("repo_name").and_then(|v| v.as_str()).unwrap_or("");
                if !repos.iter().any(|r| r == repo) {
                    continue;
                }
            }
            if let Some(t) = type_filter {
                let elem_type = meta.get("type").and_then(|v| v.as_str()).unwrap_or("");
                if elem_type != t.as_str() {
                    continue;
                }
            }
            hits.push(VectorHit { metadata: meta.clone(), score });
            if hits.len() >= k {
                break;
            }
        }
        hits
    }

    /// Iterate payloads (admin scans, element resolution).
    pub fn iter_metadata(&self) -> impl Iterator<Item = &Meta> {
        self.metadata.iter()
    }

    pub fn repo_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for meta in &self.metadata {
            if let Some(repo) = meta.get("repo_name").and_then(|v| v.as_str()) {
                if !names.iter().any(|n| n == repo) {
                    names.push(repo.to_string());
                }
            }
        }
        names
    }

    /// Drop entries matching the predicate, rebuilding the flat storage.
    /// Callers should treat this as expensive.
    pub fn delete_by<F: Fn(&Meta) -> bool>(&mut self, pred: F) -> usize {
        let mut new_vectors = Vec::with_capacity(self.vectors.len());
        let mut new_metadata = Vec::with_capacity(self.metadata.len());
        let mut removed = 0usize;
        for (i, meta) in self.metadata.iter().enumerate() {
            if pred(meta) {
                removed += 1;
                continue;
            }
            let offset = i * self.dim;
            new_vectors.extend_from_slice(&self.vectors[offset..offset + self.dim]);
            new_metadata.push(meta.clone());
        }
        self.vectors = new_vectors;
        self.metadata = new_metadata;
        removed
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn index_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.vector.json"))
    }

    /// Write the index to `dir` atomically (temp file + rename). A no-op in
    /// in-memory mode.
    pub fn save(&self, dir: &Path, name: &str) -> Result<()> {
        if self.in_memory {
            tracing::debug!("vector index '{name}' is in-memory, skipping save");
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        let payload = PersistedIndex {
            dim: self.dim,
            count: self.len(),
            vectors: self.vectors.clone(),
            metadata: self.metadata.clone(),
        };
        let path = Self::index_path(dir, name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&payload)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load a persisted index into a fresh store.
    pub fn load(dir: &Path, name: &str, in_memory: bool) -> Result<VectorIndex> {
        let path = Self::index_path(dir, name);
        if !path.exists() {
            return Err(CoreError::IndexMissing(name.to_string()));
        }
        let bytes = std::fs::read(&path)?;
        let payload: PersistedIndex = serde_json::from_slice(&bytes)?;
        if payload.vectors.len() != payload.count * payload.dim {
            return Err(CoreError::Parse(format!(
                "corrupt vector index '{name}': {} floats for {} x {}",
                payload.vectors.len(),
                payload.count,
                payload.dim
            )));
        }
        Ok(VectorIndex {
            dim: payload.dim,
            vectors: payload.vectors,
            metadata: payload.metadata,
            in_memory,
        })
    }

    /// Append a persisted per-repo index to this instance. Missing files
    /// merge nothing; mismatched dimensions abort the merge.
    pub fn merge_from(&mut self, dir: &Path, name: &str) -> Result<usize> {
        let other = match Self::load(dir, name, true) {
            Ok(idx) => idx,
            Err(CoreError::IndexMissing(_)) => {
                tracing::warn!("vector index '{name}' not found in {}", dir.display());
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        if other.dim != self.dim {
            return Err(CoreError::DimensionMismatch { expected: self.dim, got: other.dim });
        }
        let added = other.len();
        self.vectors.extend(other.vectors);
        self.metadata.extend(other.metadata);
        Ok(added)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(repo: &str, t: &str, name: &str) -> Meta {
        let mut m = Meta::new();
        m.insert("repo_name".into(), repo.into());
        m.insert("type".into(), t.into());
        m.insert("name".into(), name.into());
        m
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_search_orders_by_cosine() {
        let mut idx = VectorIndex::new(4, true);
        idx.add(
            vec![unit(4, 0), unit(4, 1), vec![0.9, 0.1, 0.0, 0.0]],
            vec![meta("a", "function", "exact"), meta("a", "function", "miss"), meta("a", "function", "close")],
        )
        .unwrap();

        let hits = idx.search(&unit(4, 0), 2, 0.0, None, None);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata["name"], "exact");
        assert_eq!(hits[1].metadata["name"], "close");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_filters_applied_after_scan() {
        let mut idx = VectorIndex::new(4, true);
        idx.add(
            vec![unit(4, 0), unit(4, 0), unit(4, 0)],
            vec![meta("a", "file", "f"), meta("b", "function", "g"), meta("a", "function", "h")],
        )
        .unwrap();

        let repos = vec!["a".to_string()];
        let hits = idx.search(&unit(4, 0), 10, 0.0, Some(&repos), Some(ElementType::Function));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata["name"], "h");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut idx = VectorIndex::new(4, true);
        let err = idx.add(vec![vec![1.0, 0.0]], vec![meta("a", "file", "f")]).unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { expected: 4, got: 2 }));
    }

    #[test]
    fn test_save_load_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = VectorIndex::new(3, false);
        idx.add(
            vec![unit(3, 0), unit(3, 1), unit(3, 2)],
            vec![meta("r", "file", "one"), meta("r", "class", "two"), meta("r", "function", "three")],
        )
        .unwrap();
        idx.save(dir.path(), "r").unwrap();

        let loaded = VectorIndex::load(dir.path(), "r", false).unwrap();
        assert_eq!(loaded.len(), 3);
        let names: Vec<_> = loaded
            .iter_metadata()
            .map(|m| m["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_merge_from_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = VectorIndex::new(3, true);
        assert_eq!(idx.merge_from(dir.path(), "ghost").unwrap(), 0);
    }

    #[test]
    fn test_merge_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut small = VectorIndex::new(2, false);
        small.add(vec![vec![1.0, 0.0]], vec![meta("r", "file", "x")]).unwrap();
        small.save(dir.path(), "r").unwrap();

        let mut big = VectorIndex::new(3, true);
        let err = big.merge_from(dir.path(), "r").unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { expected: 3, got: 2 }));
    }

    #[test]
    fn test_delete_by_rebuilds() {
        let mut idx = VectorIndex::new(2, true);
        idx.add(
            vec![unit(2, 0), unit(2, 1)],
            vec![meta("a", "file", "keep"), meta("b", "file", "drop")],
        )
        .unwrap();
        let removed = idx.delete_by(|m| m["repo_name"] == "b");
        assert_eq!(removed, 1);
        assert_eq!(idx.len(), 1);
        let hits = idx.search(&unit(2, 0), 5, 0.0, None, None);
        assert_eq!(hits[0].metadata["name"], "keep");
    }
}
