//! Volatile in-process backend

use async_trait::async_trait;

use super::cache::GraphCache;
use super::BackendAdapter;
use crate::error::Result;
use crate::node::{Edge, EdgeKey, MemoryNode, NodeId};

/// Adapter that keeps everything in memory; nothing survives the process
pub struct MemoryAdapter {
    cache: GraphCache,
}

impl MemoryAdapter {
    pub fn new(exact_search_threshold: usize) -> Self {
        Self {
            cache: GraphCache::new(exact_search_threshold),
        }
    }
}

fn no_op<T: ?Sized>(_: &T) -> Result<()> {
    Ok(())
}

#[async_trait]
impl BackendAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put_node(&self, node: &MemoryNode, expected_version: Option<u64>) -> Result<u64> {
        self.cache.put_node(node, expected_version, no_op)
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<MemoryNode>> {
        Ok(self.cache.get_node(id))
    }

    async fn delete_node(
        &self,
        id: &NodeId,
        expected_version: Option<u64>,
    ) -> Result<Option<MemoryNode>> {
        self.cache.delete_node(id, expected_version, no_op)
    }

    async fn list_node_ids(&self) -> Result<Vec<NodeId>> {
        Ok(self.cache.node_ids())
    }

    async fn node_count(&self) -> Result<usize> {
        Ok(self.cache.node_count())
    }

    async fn put_edge(&self, edge: &Edge) -> Result<Option<Edge>> {
        self.cache.put_edge(edge, no_op, no_op)
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<Option<Edge>> {
        self.cache.delete_edge(key, no_op)
    }

    async fn edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        Ok(self.cache.edges_of(id))
    }

    async fn delete_edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        self.cache.delete_edges_of(id, no_op)
    }

    async fn edge_count(&self) -> Result<usize> {
        Ok(self.cache.edge_count())
    }

    async fn put_vector(
        &self,
        facet: &str,
        id: &NodeId,
        vector: &[f32],
    ) -> Result<Option<Vec<f32>>> {
        self.cache.put_vector(facet, id, vector, || Ok(()))
    }

    async fn get_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>> {
        Ok(self.cache.get_vector(facet, id))
    }

    async fn delete_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>> {
        self.cache.delete_vector(facet, id, || Ok(()))
    }

    async fn vector_search(
        &self,
        facet: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(NodeId, f32)>> {
        Ok(self.cache.vector_search(facet, query, k))
    }

    async fn vector_count(&self, facet: &str) -> Result<usize> {
        Ok(self.cache.vector_count(facet))
    }
}
