//! Per-facet vector index over backend adapters
//!
//! Each facet is served by one adapter: a per-facet override from
//! configuration, or the default vector backend. Dimensions are checked
//! against the registry before any adapter call.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{AdapterPool, BackendAdapter};
use crate::config::{BackendConfig, RetryConfig};
use crate::error::Result;
use crate::node::{FacetVectors, NodeId};
use crate::registry::VectorSpaceRegistry;
use crate::retry::with_retry;
use crate::staging::{StagedWrite, UndoOp};

pub struct VectorIndex {
    registry: Arc<VectorSpaceRegistry>,
    default: Arc<dyn BackendAdapter>,
    overrides: HashMap<String, Arc<dyn BackendAdapter>>,
    retry: RetryConfig,
}

impl VectorIndex {
    pub fn new(
        registry: Arc<VectorSpaceRegistry>,
        default: Arc<dyn BackendAdapter>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            default,
            overrides: HashMap::new(),
            retry,
        }
    }

    /// Build from backend configuration, opening adapters through `pool`
    pub fn from_config(
        registry: Arc<VectorSpaceRegistry>,
        backends: &BackendConfig,
        pool: &mut AdapterPool,
        retry: RetryConfig,
    ) -> Result<Self> {
        let mut index = Self::new(registry, pool.get(&backends.vectors)?, retry);
        for facet in backends.facets.keys() {
            let kind = backends.vector_backend_for(facet);
            index = index.with_facet_adapter(facet.clone(), pool.get(kind)?);
        }
        Ok(index)
    }

    /// Route `facet` to a dedicated adapter
    pub fn with_facet_adapter(
        mut self,
        facet: impl Into<String>,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Self {
        self.overrides.insert(facet.into(), adapter);
        self
    }

    pub fn registry(&self) -> &Arc<VectorSpaceRegistry> {
        &self.registry
    }

    pub fn adapter_for(&self, facet: &str) -> &Arc<dyn BackendAdapter> {
        self.overrides.get(facet).unwrap_or(&self.default)
    }

    /// Validate every facet vector of a node or query
    pub fn validate(&self, facets: &FacetVectors) -> Result<()> {
        for (facet, vector) in facets {
            self.registry.validate(facet, vector)?;
        }
        Ok(())
    }

    /// Up to `k` (id, similarity) pairs by descending similarity in [0, 1]
    pub async fn search(&self, facet: &str, query: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        self.registry.validate(facet, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let adapter = self.adapter_for(facet);
        with_retry(&self.retry, "vector search", || {
            adapter.vector_search(facet, query, k)
        })
        .await
    }

    pub async fn get(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>> {
        let adapter = self.adapter_for(facet);
        with_retry(&self.retry, "get vector", || adapter.get_vector(facet, id)).await
    }

    pub async fn count(&self, facet: &str) -> Result<usize> {
        let adapter = self.adapter_for(facet);
        with_retry(&self.retry, "count vectors", || adapter.vector_count(facet)).await
    }

    /// Store a vector, recording how to undo it
    pub async fn stage_put(
        &self,
        staged: &mut StagedWrite,
        facet: &str,
        id: &NodeId,
        vector: &[f32],
    ) -> Result<()> {
        self.registry.validate(facet, vector)?;
        let adapter = self.adapter_for(facet);
        let previous = with_retry(&self.retry, "put vector", || {
            adapter.put_vector(facet, id, vector)
        })
        .await?;
        staged.record(UndoOp::Vector {
            adapter: adapter.clone(),
            facet: facet.to_string(),
            id: *id,
            previous,
        });
        self.registry.mark_in_use(facet);
        Ok(())
    }

    /// Remove a vector if present, recording how to undo it
    pub async fn stage_remove(&self, staged: &mut StagedWrite, facet: &str, id: &NodeId) -> Result<()> {
        let adapter = self.adapter_for(facet);
        let previous = with_retry(&self.retry, "delete vector", || {
            adapter.delete_vector(facet, id)
        })
        .await?;
        if previous.is_some() {
            staged.record(UndoOp::Vector {
                adapter: adapter.clone(),
                facet: facet.to_string(),
                id: *id,
                previous,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryAdapter;
    use crate::config::BackendKind;
    use crate::error::MemoryError;
    use std::collections::BTreeMap;

    fn index() -> (VectorIndex, Arc<dyn BackendAdapter>) {
        let registry = Arc::new(VectorSpaceRegistry::from_dimensions(&BTreeMap::from([
            ("role".to_string(), 2),
            ("skill".to_string(), 3),
        ])));
        let skills: Arc<dyn BackendAdapter> = Arc::new(MemoryAdapter::new(16));
        let index = VectorIndex::new(
            registry,
            Arc::new(MemoryAdapter::new(16)),
            RetryConfig::default(),
        )
        .with_facet_adapter("skill", skills.clone());
        (index, skills)
    }

    #[test]
    fn test_from_config_routes_overridden_facets() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(VectorSpaceRegistry::from_dimensions(&BTreeMap::from([
            ("role".to_string(), 2),
            ("skill".to_string(), 3),
        ])));
        let backends = BackendConfig {
            facets: BTreeMap::from([(
                "skill".to_string(),
                BackendKind::RocksDb {
                    path: dir.path().join("skills"),
                },
            )]),
            ..Default::default()
        };
        let mut pool = AdapterPool::new(16);
        let index =
            VectorIndex::from_config(registry, &backends, &mut pool, RetryConfig::default())
                .unwrap();
        assert_eq!(index.adapter_for("skill").name(), "rocksdb");
        assert_eq!(index.adapter_for("role").name(), "memory");
    }

    #[tokio::test]
    async fn test_dimension_checked_before_dispatch() {
        let (index, _) = index();
        let err = index.search("role", &[1.0, 0.0, 0.0], 3).await.unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { .. }));
        let err = index.search("mood", &[1.0], 3).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_facet_override_routes_writes() {
        let (index, skills) = index();
        let id = NodeId::new();
        let mut staged = StagedWrite::new(id);
        index
            .stage_put(&mut staged, "skill", &id, &[0.0, 1.0, 0.0])
            .await
            .unwrap();
        index
            .stage_put(&mut staged, "role", &id, &[1.0, 0.0])
            .await
            .unwrap();
        staged.commit();

        assert_eq!(skills.vector_count("skill").await.unwrap(), 1);
        assert_eq!(skills.vector_count("role").await.unwrap(), 0);
        let hits = index.search("skill", &[0.0, 1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].0, id);
    }

    #[tokio::test]
    async fn test_staged_remove_is_undoable() {
        let (index, _) = index();
        let id = NodeId::new();
        let mut staged = StagedWrite::new(id);
        index
            .stage_put(&mut staged, "role", &id, &[1.0, 0.0])
            .await
            .unwrap();
        staged.commit();

        let mut staged = StagedWrite::new(id);
        index.stage_remove(&mut staged, "role", &id).await.unwrap();
        assert_eq!(index.count("role").await.unwrap(), 0);
        staged.rollback(&RetryConfig::default()).await.unwrap();
        assert_eq!(index.get("role", &id).await.unwrap(), Some(vec![1.0, 0.0]));
    }
}
