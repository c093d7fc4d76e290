//! Feature-hashing embeddings
//!
//! Static, model-free embeddings: each lowercase token is hashed together
//! with the facet name into a signed bucket, and the bag is mean-pooled and
//! L2-normalized. Deterministic across runs, so it suits tests, demos and
//! offline tooling.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use super::EmbeddingProvider;
use crate::error::{MemoryError, Result};

/// Embeds by hashing tokens into per-facet buckets
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: BTreeMap<String, usize>,
}

impl HashingEmbedder {
    /// `dimensions` gives the output width per facet
    pub fn new(dimensions: BTreeMap<String, usize>) -> Self {
        Self { dimensions }
    }

    fn embed_sync(&self, text: &str, facet: &str) -> Result<Vec<f32>> {
        let dimension = *self.dimensions.get(facet).ok_or_else(|| {
            MemoryError::validation(format!("no dimensionality known for facet '{}'", facet))
        })?;
        let mut vector = vec![0.0f32; dimension];

        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            facet.hash(&mut hasher);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % dimension as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
            tokens += 1;
        }

        if tokens > 0 {
            for x in vector.iter_mut() {
                *x /= tokens as f32;
            }
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, input: &str, facet: &str) -> Result<Vec<f32>> {
        self.embed_sync(input, facet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::cosine_similarity;

    fn embedder() -> HashingEmbedder {
        HashingEmbedder::new(BTreeMap::from([
            ("topic".to_string(), 64),
            ("style".to_string(), 64),
        ]))
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let e = embedder();
        let a = e.embed_sync("Rust borrow checker", "topic").unwrap();
        let b = e.embed_sync("rust BORROW checker", "topic").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_overlap_raises_similarity() {
        let e = embedder();
        let base = e.embed_sync("postgres replication lag alert", "topic").unwrap();
        let near = e.embed_sync("postgres replication lag", "topic").unwrap();
        let far = e.embed_sync("birthday cake recipe", "topic").unwrap();
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[test]
    fn test_unknown_facet_rejected() {
        assert!(embedder().embed_sync("x", "mood").unwrap_err().is_validation());
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = embedder().embed_sync("  ", "topic").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
