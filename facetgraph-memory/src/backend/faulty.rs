//! Fault-injecting adapter wrapper
//!
//! Wraps any adapter and makes chosen operations fail with
//! `BackendUnavailable` or stall for a while. Used to exercise retries,
//! rollback and degraded retrieval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendAdapter, Neighbor};
use crate::error::{MemoryError, Result};
use crate::node::{Edge, EdgeKey, MemoryNode, NodeId};

/// Adapter operations that faults can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PutNode,
    GetNode,
    DeleteNode,
    PutEdge,
    DeleteEdge,
    EdgesOf,
    DeleteEdgesOf,
    PutVector,
    GetVector,
    DeleteVector,
    VectorSearch,
}

#[derive(Debug, Clone)]
enum Effect {
    Fail { remaining: Option<usize> },
    Stall(Duration),
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    facet: Option<String>,
    effect: Effect,
}

/// Adapter that injects failures into an inner adapter
pub struct FaultyAdapter {
    inner: Arc<dyn BackendAdapter>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<Operation, usize>>,
}

impl FaultyAdapter {
    pub fn new(inner: Arc<dyn BackendAdapter>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail every call to `operation`
    pub fn fail(&self, operation: Operation) -> &Self {
        self.push(operation, None, Effect::Fail { remaining: None })
    }

    /// Fail the next `times` calls to `operation`
    pub fn fail_times(&self, operation: Operation, times: usize) -> &Self {
        self.push(
            operation,
            None,
            Effect::Fail {
                remaining: Some(times),
            },
        )
    }

    /// Fail every call to `operation` that targets `facet`
    pub fn fail_facet(&self, operation: Operation, facet: impl Into<String>) -> &Self {
        self.push(
            operation,
            Some(facet.into()),
            Effect::Fail { remaining: None },
        )
    }

    /// Delay every call to `operation` by `delay`
    pub fn stall(&self, operation: Operation, delay: Duration) -> &Self {
        self.push(operation, None, Effect::Stall(delay))
    }

    /// Delay calls to `operation` that target `facet`
    pub fn stall_facet(
        &self,
        operation: Operation,
        facet: impl Into<String>,
        delay: Duration,
    ) -> &Self {
        self.push(operation, Some(facet.into()), Effect::Stall(delay))
    }

    /// Remove all injected faults
    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    /// Number of calls seen for `operation`, failed ones included
    pub fn calls(&self, operation: Operation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    fn push(&self, operation: Operation, facet: Option<String>, effect: Effect) -> &Self {
        self.faults.lock().push(Fault {
            operation,
            facet,
            effect,
        });
        self
    }

    async fn check(&self, operation: Operation, facet: Option<&str>) -> Result<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        let mut stall = None;
        {
            let mut faults = self.faults.lock();
            for fault in faults.iter_mut() {
                if fault.operation != operation {
                    continue;
                }
                if fault.facet.is_some() && fault.facet.as_deref() != facet {
                    continue;
                }
                match &mut fault.effect {
                    Effect::Stall(delay) => stall = Some(*delay),
                    Effect::Fail { remaining: None } => {
                        return Err(MemoryError::unavailable(format!(
                            "injected failure in {:?}",
                            operation
                        )));
                    }
                    Effect::Fail {
                        remaining: Some(remaining),
                    } if *remaining > 0 => {
                        *remaining -= 1;
                        return Err(MemoryError::unavailable(format!(
                            "injected failure in {:?}",
                            operation
                        )));
                    }
                    Effect::Fail { .. } => {}
                }
            }
        }

        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for FaultyAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put_node(&self, node: &MemoryNode, expected_version: Option<u64>) -> Result<u64> {
        self.check(Operation::PutNode, None).await?;
        self.inner.put_node(node, expected_version).await
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<MemoryNode>> {
        self.check(Operation::GetNode, None).await?;
        self.inner.get_node(id).await
    }

    async fn delete_node(
        &self,
        id: &NodeId,
        expected_version: Option<u64>,
    ) -> Result<Option<MemoryNode>> {
        self.check(Operation::DeleteNode, None).await?;
        self.inner.delete_node(id, expected_version).await
    }

    async fn list_node_ids(&self) -> Result<Vec<NodeId>> {
        self.inner.list_node_ids().await
    }

    async fn node_count(&self) -> Result<usize> {
        self.inner.node_count().await
    }

    async fn put_edge(&self, edge: &Edge) -> Result<Option<Edge>> {
        self.check(Operation::PutEdge, None).await?;
        self.inner.put_edge(edge).await
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<Option<Edge>> {
        self.check(Operation::DeleteEdge, None).await?;
        self.inner.delete_edge(key).await
    }

    async fn edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        self.check(Operation::EdgesOf, None).await?;
        self.inner.edges_of(id).await
    }

    async fn delete_edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        self.check(Operation::DeleteEdgesOf, None).await?;
        self.inner.delete_edges_of(id).await
    }

    async fn edge_count(&self) -> Result<usize> {
        self.inner.edge_count().await
    }

    async fn neighbors(
        &self,
        id: &NodeId,
        relation_filter: Option<&str>,
        max_depth: usize,
    ) -> Result<Vec<Neighbor>> {
        self.check(Operation::EdgesOf, None).await?;
        self.inner.neighbors(id, relation_filter, max_depth).await
    }

    async fn put_vector(
        &self,
        facet: &str,
        id: &NodeId,
        vector: &[f32],
    ) -> Result<Option<Vec<f32>>> {
        self.check(Operation::PutVector, Some(facet)).await?;
        self.inner.put_vector(facet, id, vector).await
    }

    async fn get_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>> {
        self.check(Operation::GetVector, Some(facet)).await?;
        self.inner.get_vector(facet, id).await
    }

    async fn delete_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>> {
        self.check(Operation::DeleteVector, Some(facet)).await?;
        self.inner.delete_vector(facet, id).await
    }

    async fn vector_search(
        &self,
        facet: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(NodeId, f32)>> {
        self.check(Operation::VectorSearch, Some(facet)).await?;
        self.inner.vector_search(facet, query, k).await
    }

    async fn vector_count(&self, facet: &str) -> Result<usize> {
        self.inner.vector_count(facet).await
    }
}
