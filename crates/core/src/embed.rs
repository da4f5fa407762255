//! Embedding seam — dense vectors come from an external model behind a trait.
//!
//! The default implementation is a deterministic feature-hashing projection:
//! no model downloads, stable across platforms, good enough to exercise every
//! retrieval path. The `semantic` feature swaps in a fastembed-backed model.

use crate::error::Result;

/// Batch text embedder. Implementations must return L2-normalized vectors of
/// a fixed dimensionality.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed(&[text.to_string()])?;
        Ok(out.pop().unwrap_or_else(|| vec![0.0; self.dim()]))
    }
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing embedder (default)
// ---------------------------------------------------------------------------

/// Deterministic feature-hashing embedder over lowercase character trigrams
/// and whitespace tokens. Cosine similarity over these vectors behaves like
/// a soft lexical overlap measure.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        HashingEmbedder { dim: dim.max(8) }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = blake3::hash(feature.as_bytes());
        let bytes = digest.as_bytes();
        let idx = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize % self.dim;
        // Sign bit keeps hashed features from all piling up positive
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let lower = text.to_lowercase();
            let mut v = vec![0.0f32; self.dim];

            for token in lower.split(|c: char| !c.is_alphanumeric() && c != '_') {
                if token.is_empty() {
                    continue;
                }
                let (idx, sign) = self.bucket(token);
                v[idx] += 2.0 * sign;

                let chars: Vec<char> = token.chars().collect();
                if chars.len() >= 3 {
                    for w in chars.windows(3) {
                        let tri: String = w.iter().collect();
                        let (idx, sign) = self.bucket(&tri);
                        v[idx] += sign;
                    }
                }
            }

            l2_normalize(&mut v);
            out.push(v);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// fastembed backend (feature-gated)
// ---------------------------------------------------------------------------

#[cfg(feature = "semantic")]
pub mod semantic {
    use super::{l2_normalize, Embedder};
    use crate::error::{CoreError, Result};
    use std::sync::Mutex;

    /// all-MiniLM-L6-v2 via fastembed. Vectors are re-normalized defensively
    /// since the index assumes unit length.
    pub struct FastEmbedder {
        model: Mutex<fastembed::TextEmbedding>,
        dim: usize,
    }

    impl FastEmbedder {
        pub fn new() -> Result<Self> {
            let model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2),
            )
            .map_err(|e| CoreError::Internal(format!("failed to load embedding model: {e}")))?;
            Ok(FastEmbedder { model: Mutex::new(model), dim: 384 })
        }
    }

    impl Embedder for FastEmbedder {
        fn dim(&self) -> usize {
            self.dim
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut model = self
                .model
                .lock()
                .map_err(|_| CoreError::Internal("embedding model lock poisoned".into()))?;
            let mut vectors = model
                .embed(texts.to_vec(), None)
                .map_err(|e| CoreError::Internal(format!("embedding failed: {e}")))?;
            for v in &mut vectors {
                l2_normalize(v);
            }
            Ok(vectors)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_and_normalized() {
        let e = HashingEmbedder::new(128);
        let a = e.embed_one("def decode_header(data):").unwrap();
        let b = e.embed_one("def decode_header(data):").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_text_scores_higher() {
        let e = HashingEmbedder::new(256);
        let q = e.embed_one("http client retry backoff").unwrap();
        let close = e.embed_one("retry the http client with backoff").unwrap();
        let far = e.embed_one("matrix multiplication kernel").unwrap();

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&q, &close) > dot(&q, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(64);
        let v = e.embed_one("").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
