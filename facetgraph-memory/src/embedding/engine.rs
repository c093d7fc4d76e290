//! Caching facet embedder
//!
//! Wraps a provider with a DashMap cache keyed by (facet, text) for repeated
//! lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::node::FacetVectors;
use crate::registry::VectorSpaceRegistry;

/// Embeds text per facet, with caching and dimension checks
pub struct FacetEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    registry: Arc<VectorSpaceRegistry>,
    cache: DashMap<(String, String), Vec<f32>>,
    max_cache_entries: usize,
}

impl FacetEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, registry: Arc<VectorSpaceRegistry>) -> Self {
        Self {
            provider,
            registry,
            cache: DashMap::new(),
            max_cache_entries: 10_000,
        }
    }

    /// Cap the cache; it is cleared when the cap is reached
    pub fn with_cache_limit(mut self, max_entries: usize) -> Self {
        self.max_cache_entries = max_entries;
        self
    }

    /// Generate one facet embedding with caching
    pub async fn embed(&self, text: &str, facet: &str) -> Result<Vec<f32>> {
        let key = (facet.to_string(), text.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let embedding = self.provider.embed(text, facet).await.map_err(|e| {
            if e.is_validation() {
                e
            } else {
                MemoryError::unavailable(format!(
                    "{} could not embed facet '{}': {}",
                    self.provider.name(),
                    facet,
                    e
                ))
            }
        })?;
        self.registry.validate(facet, &embedding)?;

        if self.cache.len() >= self.max_cache_entries {
            log::debug!("Embedding cache full, clearing {} entries", self.cache.len());
            self.cache.clear();
        }
        self.cache.insert(key, embedding.clone());
        Ok(embedding)
    }

    /// Embed `text` for each facet concurrently. Facets that fail are returned
    /// separately instead of failing the whole call.
    pub async fn embed_facets(
        &self,
        text: &str,
        facets: &[String],
    ) -> (FacetVectors, BTreeMap<String, MemoryError>) {
        let calls = facets.iter().map(|facet| async move {
            let outcome = self.embed(text, facet).await;
            (facet.clone(), outcome)
        });

        let mut vectors = FacetVectors::new();
        let mut failed = BTreeMap::new();
        for (facet, outcome) in futures::future::join_all(calls).await {
            match outcome {
                Ok(vector) => {
                    vectors.insert(facet, vector);
                }
                Err(e) => {
                    log::warn!("Embedding for facet '{}' unavailable: {}", facet, e);
                    failed.insert(facet, e);
                }
            }
        }
        (vectors, failed)
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
