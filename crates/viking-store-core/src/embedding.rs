//! Embedder trait, a deterministic hashing embedder, and vector utilities.
//!
//! Network-backed embedders (OpenAI, Ollama) live in the `viking-store`
//! app crate. The [`HashEmbedder`] here needs no model and no network,
//! which makes the whole indexing pipeline reproducible in tests.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::models::SparseVector;

/// Output of one embedding call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbedResult {
    pub dense: Option<Vec<f32>>,
    pub sparse: Option<SparseVector>,
}

/// Trait for embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the dense vector dimensionality.
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<EmbedResult>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbedResult>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// Lowercased alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Feature-hashing embedder.
///
/// Each token is hashed with SHA-256 into one of `dims` buckets with a
/// ±1 sign; the dense vector is L2-normalized. The sparse vector is the
/// normalized term frequency of each token.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn dense(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }

    pub fn sparse(&self, text: &str) -> SparseVector {
        let tokens = tokenize(text);
        let total = tokens.len() as f32;
        let mut sparse = SparseVector::new();
        for token in tokens {
            *sparse.entry(token).or_insert(0.0) += 1.0 / total;
        }
        sparse
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<EmbedResult> {
        Ok(EmbedResult {
            dense: Some(self.dense(text)),
            sparse: Some(self.sparse(text)),
        })
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use viking_store_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Dot product over the terms two sparse vectors share.
pub fn sparse_dot(a: &SparseVector, b: &SparseVector) -> f32 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, w)| large.get(term).map(|v| w * v))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_sparse_dot() {
        let a: SparseVector = [("x".into(), 2.0), ("y".into(), 1.0)].into_iter().collect();
        let b: SparseVector = [("x".into(), 0.5), ("z".into(), 9.0)].into_iter().collect();
        assert_eq!(sparse_dot(&a, &b), 1.0);
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World-42!"), vec!["hello", "world", "42"]);
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed("the borrow checker").await.unwrap();
        let b = e.embed("the borrow checker").await.unwrap();
        assert_eq!(a, b);
        let dense = a.dense.unwrap();
        assert_eq!(dense.len(), 64);
        let norm: f32 = dense.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        let sparse = a.sparse.unwrap();
        assert!((sparse["borrow"] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_hash_embedder_similar_texts_score_higher() {
        let e = HashEmbedder::new(256);
        let q = e.dense("rust ownership borrowing");
        let near = e.dense("ownership and borrowing in rust");
        let far = e.dense("banana bread recipe");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }
}
