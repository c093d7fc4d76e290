//! Backend adapters
//!
//! One capability surface over every storage technology. The graph store and
//! vector index only ever talk to `dyn BackendAdapter`; which concrete adapter
//! sits behind it is decided from configuration at construction time.

mod cache;
mod faulty;
mod memory;
mod rocks;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BackendKind;
use crate::error::Result;
use crate::node::{Edge, EdgeKey, MemoryNode, NodeId};

pub use faulty::{FaultyAdapter, Operation};
pub use memory::MemoryAdapter;
pub use rocks::RocksDbAdapter;

/// A node reached by traversal
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: NodeId,
    /// Hops from the start node
    pub hop: usize,
    /// Product of edge weights along the path
    pub path_weight: f32,
    /// Node this one was reached from
    pub parent: NodeId,
    /// Relation of the last edge on the path
    pub relation: String,
}

/// Uniform storage contract implemented by every backend
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Insert or replace a node. With `expected_version` the write only succeeds
    /// if the stored version (0 when absent) matches. Returns the new version.
    async fn put_node(&self, node: &MemoryNode, expected_version: Option<u64>) -> Result<u64>;

    async fn get_node(&self, id: &NodeId) -> Result<Option<MemoryNode>>;

    /// Remove a node record, returning it. Incident edges are not touched.
    async fn delete_node(
        &self,
        id: &NodeId,
        expected_version: Option<u64>,
    ) -> Result<Option<MemoryNode>>;

    async fn list_node_ids(&self) -> Result<Vec<NodeId>>;

    async fn node_count(&self) -> Result<usize>;

    /// Insert or replace an edge, returning the edge it replaced.
    /// Fails with `NotFound` unless both endpoints exist.
    async fn put_edge(&self, edge: &Edge) -> Result<Option<Edge>>;

    async fn delete_edge(&self, key: &EdgeKey) -> Result<Option<Edge>>;

    /// All edges with `id` as source or target
    async fn edges_of(&self, id: &NodeId) -> Result<Vec<Edge>>;

    /// Remove all edges incident to `id`, returning them
    async fn delete_edges_of(&self, id: &NodeId) -> Result<Vec<Edge>>;

    async fn edge_count(&self) -> Result<usize>;

    /// Breadth-first expansion from `id` up to `max_depth` hops. Each node is
    /// visited once, at its smallest hop distance; the start node is excluded.
    async fn neighbors(
        &self,
        id: &NodeId,
        relation_filter: Option<&str>,
        max_depth: usize,
    ) -> Result<Vec<Neighbor>> {
        let mut found = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::from([*id]);
        let mut queue: VecDeque<(NodeId, usize, f32)> = VecDeque::from([(*id, 0, 1.0)]);

        while let Some((current, hop, weight)) = queue.pop_front() {
            if hop >= max_depth {
                continue;
            }
            for edge in self.edges_of(&current).await? {
                if relation_filter.is_some_and(|r| r != edge.relation) {
                    continue;
                }
                let Some(next) = edge.traverse_from(&current) else {
                    continue;
                };
                if !visited.insert(next) {
                    continue;
                }
                let path_weight = weight * edge.weight;
                found.push(Neighbor {
                    id: next,
                    hop: hop + 1,
                    path_weight,
                    parent: current,
                    relation: edge.relation.clone(),
                });
                queue.push_back((next, hop + 1, path_weight));
            }
        }

        Ok(found)
    }

    /// Store a facet vector, returning the one it replaced
    async fn put_vector(&self, facet: &str, id: &NodeId, vector: &[f32])
        -> Result<Option<Vec<f32>>>;

    async fn get_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>>;

    async fn delete_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>>;

    /// Up to `k` (id, similarity in [0, 1]) pairs, most similar first
    async fn vector_search(&self, facet: &str, query: &[f32], k: usize)
        -> Result<Vec<(NodeId, f32)>>;

    async fn vector_count(&self, facet: &str) -> Result<usize>;

    /// Unconditional upsert of many nodes; returns the new versions in order
    async fn batch_put(&self, nodes: &[MemoryNode]) -> Result<Vec<u64>> {
        let mut versions = Vec::with_capacity(nodes.len());
        for node in nodes {
            versions.push(self.put_node(node, None).await?);
        }
        Ok(versions)
    }
}

/// Opens adapters from configuration, sharing one instance per distinct backend
pub struct AdapterPool {
    exact_search_threshold: usize,
    open: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl AdapterPool {
    pub fn new(exact_search_threshold: usize) -> Self {
        Self {
            exact_search_threshold,
            open: HashMap::new(),
        }
    }

    /// Adapter for `kind`, opened on first request
    pub fn get(&mut self, kind: &BackendKind) -> Result<Arc<dyn BackendAdapter>> {
        if let Some(adapter) = self.open.get(kind) {
            return Ok(adapter.clone());
        }
        let adapter: Arc<dyn BackendAdapter> = match kind {
            BackendKind::Memory => Arc::new(MemoryAdapter::new(self.exact_search_threshold)),
            BackendKind::RocksDb { path } => {
                Arc::new(RocksDbAdapter::open(path, self.exact_search_threshold)?)
            }
        };
        log::info!("Opened {} backend", adapter.name());
        self.open.insert(kind.clone(), adapter.clone());
        Ok(adapter)
    }
}
