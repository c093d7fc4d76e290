//! In-process graph state shared by the concrete adapters
//!
//! Every mutation takes a `persist` hook that runs before the cache changes,
//! so a failed durable write leaves the cache untouched.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{MemoryError, Result};
use crate::hnsw::FacetIndex;
use crate::node::{Edge, EdgeKey, MemoryNode, NodeId};

pub(crate) struct GraphCache {
    nodes: DashMap<NodeId, MemoryNode>,
    edges: DashMap<EdgeKey, Edge>,
    adjacency: DashMap<NodeId, BTreeSet<EdgeKey>>,
    facets: DashMap<String, Arc<FacetIndex>>,
    exact_threshold: usize,
}

impl GraphCache {
    pub fn new(exact_threshold: usize) -> Self {
        Self {
            nodes: DashMap::new(),
            edges: DashMap::new(),
            adjacency: DashMap::new(),
            facets: DashMap::new(),
            exact_threshold,
        }
    }

    pub fn put_node<F>(&self, node: &MemoryNode, expected: Option<u64>, persist: F) -> Result<u64>
    where
        F: FnOnce(&MemoryNode) -> Result<()>,
    {
        match self.nodes.entry(node.id) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().version;
                if let Some(expected) = expected {
                    if expected != current {
                        return Err(MemoryError::conflict(node.id.to_string(), expected, current));
                    }
                }
                let mut stored = node.clone();
                stored.version = current + 1;
                persist(&stored)?;
                entry.insert(stored);
                Ok(current + 1)
            }
            Entry::Vacant(entry) => {
                if let Some(expected) = expected {
                    if expected != 0 {
                        return Err(MemoryError::conflict(node.id.to_string(), expected, 0));
                    }
                }
                let mut stored = node.clone();
                stored.version = 1;
                persist(&stored)?;
                entry.insert(stored);
                Ok(1)
            }
        }
    }

    pub fn get_node(&self, id: &NodeId) -> Option<MemoryNode> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn delete_node<F>(
        &self,
        id: &NodeId,
        expected: Option<u64>,
        persist: F,
    ) -> Result<Option<MemoryNode>>
    where
        F: FnOnce(&NodeId) -> Result<()>,
    {
        match self.nodes.entry(*id) {
            Entry::Occupied(entry) => {
                let current = entry.get().version;
                if let Some(expected) = expected {
                    if expected != current {
                        return Err(MemoryError::conflict(id.to_string(), expected, current));
                    }
                }
                // Edges added since the caller cascaded keep the node alive
                if self.has_edges(id) {
                    return Err(MemoryError::conflict(
                        format!("{} (edges attached)", id),
                        current,
                        current,
                    ));
                }
                persist(id)?;
                Ok(Some(entry.remove()))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn has_edges(&self, id: &NodeId) -> bool {
        self.adjacency
            .get(id)
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }

    /// Insert or replace an edge. `revert` undoes `persist` when an endpoint
    /// is deleted between the endpoint check and the insert.
    pub fn put_edge<F, R>(&self, edge: &Edge, persist: F, revert: R) -> Result<Option<Edge>>
    where
        F: FnOnce(&Edge) -> Result<()>,
        R: FnOnce(&EdgeKey) -> Result<()>,
    {
        self.require_endpoints(edge)?;
        persist(edge)?;

        let key = edge.key();
        let previous = self.edges.insert(key.clone(), edge.clone());
        self.adjacency
            .entry(edge.source)
            .or_default()
            .insert(key.clone());
        self.adjacency
            .entry(edge.target)
            .or_default()
            .insert(key.clone());

        // An endpoint deleted concurrently must not leave this edge dangling.
        // Any previous edge under this key shares the missing endpoint, so
        // nothing is restored.
        if let Err(e) = self.require_endpoints(edge) {
            self.unlink(&key);
            if let Err(revert_error) = revert(&key) {
                log::warn!(
                    "Could not remove dangling edge {} -> {}: {}",
                    key.source,
                    key.target,
                    revert_error
                );
            }
            return Err(e);
        }
        Ok(previous)
    }

    fn require_endpoints(&self, edge: &Edge) -> Result<()> {
        for endpoint in [edge.source, edge.target] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(MemoryError::not_found(format!(
                    "edge endpoint {} does not exist",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    pub fn delete_edge<F>(&self, key: &EdgeKey, persist: F) -> Result<Option<Edge>>
    where
        F: FnOnce(&EdgeKey) -> Result<()>,
    {
        if !self.edges.contains_key(key) {
            return Ok(None);
        }
        persist(key)?;
        Ok(self.unlink(key))
    }

    fn unlink(&self, key: &EdgeKey) -> Option<Edge> {
        let removed = self.edges.remove(key).map(|(_, e)| e);
        for endpoint in [key.source, key.target] {
            if let Some(mut keys) = self.adjacency.get_mut(&endpoint) {
                keys.remove(key);
            }
        }
        self.adjacency
            .remove_if(&key.source, |_, keys| keys.is_empty());
        self.adjacency
            .remove_if(&key.target, |_, keys| keys.is_empty());
        removed
    }

    pub fn edges_of(&self, id: &NodeId) -> Vec<Edge> {
        let keys: Vec<EdgeKey> = match self.adjacency.get(id) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };
        keys.iter()
            .filter_map(|key| self.edges.get(key).map(|e| e.clone()))
            .collect()
    }

    pub fn delete_edges_of<F>(&self, id: &NodeId, persist: F) -> Result<Vec<Edge>>
    where
        F: FnOnce(&[Edge]) -> Result<()>,
    {
        let edges = self.edges_of(id);
        if edges.is_empty() {
            return Ok(edges);
        }
        persist(&edges)?;
        for edge in &edges {
            self.unlink(&edge.key());
        }
        Ok(edges)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn facet(&self, facet: &str) -> Arc<FacetIndex> {
        if let Some(index) = self.facets.get(facet) {
            return index.clone();
        }
        self.facets
            .entry(facet.to_string())
            .or_insert_with(|| Arc::new(FacetIndex::new(self.exact_threshold)))
            .clone()
    }

    pub fn put_vector<F>(
        &self,
        facet: &str,
        id: &NodeId,
        vector: &[f32],
        persist: F,
    ) -> Result<Option<Vec<f32>>>
    where
        F: FnOnce() -> Result<()>,
    {
        persist()?;
        Ok(self.facet(facet).insert(*id, vector.to_vec()))
    }

    pub fn get_vector(&self, facet: &str, id: &NodeId) -> Option<Vec<f32>> {
        self.facets.get(facet).and_then(|index| index.get(id))
    }

    pub fn delete_vector<F>(&self, facet: &str, id: &NodeId, persist: F) -> Result<Option<Vec<f32>>>
    where
        F: FnOnce() -> Result<()>,
    {
        let index = match self.facets.get(facet) {
            Some(index) => index.clone(),
            None => return Ok(None),
        };
        if index.get(id).is_none() {
            return Ok(None);
        }
        persist()?;
        Ok(index.remove(id))
    }

    pub fn vector_search(&self, facet: &str, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        match self.facets.get(facet) {
            Some(index) => index.clone(),
            None => return Vec::new(),
        }
        .search(query, k)
    }

    pub fn vector_count(&self, facet: &str) -> usize {
        self.facets.get(facet).map(|index| index.len()).unwrap_or(0)
    }

    /// Populate from durable storage without running hooks
    pub fn load_node(&self, node: MemoryNode) {
        self.nodes.insert(node.id, node);
    }

    /// Returns false, loading nothing, when an endpoint was not loaded
    pub fn load_edge(&self, edge: Edge) -> bool {
        if self.require_endpoints(&edge).is_err() {
            return false;
        }
        let key = edge.key();
        self.adjacency
            .entry(edge.source)
            .or_default()
            .insert(key.clone());
        self.adjacency
            .entry(edge.target)
            .or_default()
            .insert(key.clone());
        self.edges.insert(key, edge);
        true
    }

    pub fn load_vector(&self, facet: &str, id: NodeId, vector: Vec<f32>) {
        self.facet(facet).insert(id, vector);
    }
}
