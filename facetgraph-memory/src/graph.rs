//! Graph store
//!
//! Owns node and edge existence on top of one backend adapter. Keeps a small
//! per-node signal view (access count, weighted degree) so scoring contexts
//! can be captured without walking the backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::backend::{BackendAdapter, Neighbor};
use crate::config::RetryConfig;
use crate::error::{MemoryError, Result};
use crate::node::{Edge, EdgeKey, MemoryNode, NodeId};
use crate::retry::with_retry;
use crate::scorer::ScoringContext;
use crate::staging::{settle, StagedWrite, UndoOp};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Signals {
    access_count: u64,
    weighted_degree: f32,
}

/// Running maxima over `signals`. Raised in place; a drop at the current
/// maximum marks them stale and the next read rescans.
#[derive(Debug, Default)]
struct Maxima {
    access_count: u64,
    weighted_degree: f32,
    stale: bool,
}

impl Maxima {
    fn observe(&mut self, before: Signals, after: Signals) {
        self.access_count = self.access_count.max(after.access_count);
        self.weighted_degree = self.weighted_degree.max(after.weighted_degree);
        if (before.access_count == self.access_count && after.access_count < before.access_count)
            || (before.weighted_degree == self.weighted_degree
                && after.weighted_degree < before.weighted_degree)
        {
            self.stale = true;
        }
    }
}

/// Node and edge persistence with neighbor queries
pub struct GraphStore {
    adapter: Arc<dyn BackendAdapter>,
    retry: RetryConfig,
    conflict_retries: u32,
    signals: DashMap<NodeId, Signals>,
    maxima: Mutex<Maxima>,
}

impl GraphStore {
    /// Wrap an adapter, building the signal view from what it already holds
    pub async fn open(
        adapter: Arc<dyn BackendAdapter>,
        retry: RetryConfig,
        conflict_retries: u32,
    ) -> Result<Self> {
        let store = Self {
            adapter,
            retry,
            conflict_retries,
            signals: DashMap::new(),
            maxima: Mutex::new(Maxima::default()),
        };
        let ids = store.list_node_ids().await?;
        for id in &ids {
            store.refresh_signals(id).await?;
        }
        if !ids.is_empty() {
            log::info!("Graph store tracking {} existing nodes", ids.len());
        }
        Ok(store)
    }

    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub async fn get(&self, id: &NodeId) -> Result<Option<MemoryNode>> {
        with_retry(&self.retry, "get node", || self.adapter.get_node(id)).await
    }

    pub async fn list_node_ids(&self) -> Result<Vec<NodeId>> {
        with_retry(&self.retry, "list nodes", || self.adapter.list_node_ids()).await
    }

    pub async fn node_count(&self) -> Result<usize> {
        with_retry(&self.retry, "count nodes", || self.adapter.node_count()).await
    }

    pub async fn edge_count(&self) -> Result<usize> {
        with_retry(&self.retry, "count edges", || self.adapter.edge_count()).await
    }

    pub async fn edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        with_retry(&self.retry, "edges of", || self.adapter.edges_of(id)).await
    }

    /// Breadth-first expansion up to `depth` hops, each node at most once
    pub async fn neighbors(
        &self,
        id: &NodeId,
        relation_filter: Option<&str>,
        depth: usize,
    ) -> Result<Vec<Neighbor>> {
        if depth == 0 {
            return Ok(Vec::new());
        }
        with_retry(&self.retry, "neighbors", || {
            self.adapter.neighbors(id, relation_filter, depth)
        })
        .await
    }

    /// Write a node and its edges atomically. Returns the new node version.
    pub async fn write(
        &self,
        node: &MemoryNode,
        edges: &[Edge],
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let mut staged = StagedWrite::new(node.id);
        let outcome = self
            .stage_node_and_edges(&mut staged, node, edges, expected_version)
            .await;
        let result = self.settle(staged, outcome).await;
        self.refresh_edges(node.id, edges).await;
        result
    }

    /// Stage a node write followed by its edges
    pub async fn stage_node_and_edges(
        &self,
        staged: &mut StagedWrite,
        node: &MemoryNode,
        edges: &[Edge],
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let version = self.stage_node(staged, node, expected_version).await?;
        for edge in edges {
            self.stage_edge(staged, edge).await?;
        }
        Ok(version)
    }

    /// Put a node, recording how to undo it
    pub async fn stage_node(
        &self,
        staged: &mut StagedWrite,
        node: &MemoryNode,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let previous = self.get(&node.id).await?;
        if let (Some(expected), Some(previous)) = (expected_version, &previous) {
            if previous.version != expected {
                return Err(MemoryError::conflict(
                    node.id.to_string(),
                    expected,
                    previous.version,
                ));
            }
        }
        let version = with_retry(&self.retry, "put node", || {
            self.adapter.put_node(node, expected_version)
        })
        .await?;
        staged.record(UndoOp::Node {
            adapter: self.adapter.clone(),
            id: node.id,
            previous,
        });
        Ok(version)
    }

    /// Upsert an edge, recording how to undo it
    pub async fn stage_edge(&self, staged: &mut StagedWrite, edge: &Edge) -> Result<()> {
        validate_edge(edge)?;
        let previous =
            with_retry(&self.retry, "put edge", || self.adapter.put_edge(edge)).await?;
        staged.record(UndoOp::Edge {
            adapter: self.adapter.clone(),
            key: edge.key(),
            previous,
        });
        Ok(())
    }

    /// Remove incident edges and then the node, recording how to undo both.
    /// With `expected_version` the node delete fails on a concurrent change,
    /// including an edge attached after the cascade. Without it, late edges
    /// are cascaded again up to the conflict retry bound.
    pub async fn stage_remove(
        &self,
        staged: &mut StagedWrite,
        id: &NodeId,
        expected_version: Option<u64>,
    ) -> Result<Option<MemoryNode>> {
        let mut attempt = 0;
        let removed = loop {
            let edges = with_retry(&self.retry, "delete edges", || {
                self.adapter.delete_edges_of(id)
            })
            .await?;
            if !edges.is_empty() {
                staged.record(UndoOp::RemovedEdges {
                    adapter: self.adapter.clone(),
                    edges,
                });
            }
            match with_retry(&self.retry, "delete node", || {
                self.adapter.delete_node(id, expected_version)
            })
            .await
            {
                Ok(removed) => break removed,
                Err(e)
                    if e.is_conflict()
                        && expected_version.is_none()
                        && attempt < self.conflict_retries =>
                {
                    log::debug!("Edge attached to {} during removal, cascading again", id);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        if let Some(node) = &removed {
            staged.record(UndoOp::Node {
                adapter: self.adapter.clone(),
                id: *id,
                previous: Some(node.clone()),
            });
        }
        Ok(removed)
    }

    /// Remove a node and every incident edge atomically
    pub async fn remove(&self, id: &NodeId) -> Result<Option<MemoryNode>> {
        let touched = self.edges_of(id).await?;
        let mut staged = StagedWrite::new(*id);
        let outcome = self.stage_remove(&mut staged, id, None).await;
        let result = self.settle(staged, outcome).await;
        self.refresh_edges(*id, &touched).await;
        result
    }

    /// Add or replace an edge between existing nodes
    pub async fn link(&self, edge: &Edge) -> Result<Option<Edge>> {
        validate_edge(edge)?;
        let previous =
            with_retry(&self.retry, "put edge", || self.adapter.put_edge(edge)).await?;
        self.refresh_edges(edge.source, std::slice::from_ref(edge))
            .await;
        Ok(previous)
    }

    /// Finish a staged write, rolling back and quarantining as needed
    pub async fn settle<T>(&self, staged: StagedWrite, outcome: Result<T>) -> Result<T> {
        settle(staged, outcome, &self.retry, |id| async move {
            self.set_quarantine(&id, true).await.map(|_| ())
        })
        .await
    }

    /// Read-modify-write with optimistic versioning. `update` returns false to
    /// skip the write. Conflicts are retried up to the configured bound.
    pub async fn update<F>(&self, id: &NodeId, mut update: F) -> Result<Option<MemoryNode>>
    where
        F: FnMut(&mut MemoryNode) -> bool,
    {
        let mut attempt = 0;
        loop {
            let Some(mut node) = self.get(id).await? else {
                return Ok(None);
            };
            if !update(&mut node) {
                return Ok(Some(node));
            }
            let expected = node.version;
            match with_retry(&self.retry, "update node", || {
                self.adapter.put_node(&node, Some(expected))
            })
            .await
            {
                Ok(version) => {
                    node.version = version;
                    self.note_access(&node);
                    return Ok(Some(node));
                }
                Err(e) if e.is_conflict() && attempt < self.conflict_retries => {
                    let delay = self.retry.delay_for(attempt);
                    log::debug!("Conflict updating {}, retrying in {:?}", id, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single compare-and-set write without retrying conflicts
    pub async fn put_if_version(&self, node: &MemoryNode, expected: u64) -> Result<u64> {
        let version = with_retry(&self.retry, "put node", || {
            self.adapter.put_node(node, Some(expected))
        })
        .await?;
        self.note_access(node);
        Ok(version)
    }

    /// Flag or clear quarantine on a node
    pub async fn set_quarantine(&self, id: &NodeId, quarantined: bool) -> Result<Option<MemoryNode>> {
        self.update(id, |node| {
            if node.quarantined == quarantined {
                return false;
            }
            node.quarantined = quarantined;
            true
        })
        .await
    }

    /// Sum of incident edge weights
    pub fn weighted_degree(&self, id: &NodeId) -> f32 {
        self.signals
            .get(id)
            .map(|s| s.weighted_degree)
            .unwrap_or(0.0)
    }

    /// Snapshot of graph-wide maxima for scoring
    pub fn scoring_context(&self, now: DateTime<Utc>) -> ScoringContext {
        let mut maxima = self.maxima.lock();
        if maxima.stale {
            let mut access_count = 0;
            let mut weighted_degree: f32 = 0.0;
            for entry in self.signals.iter() {
                access_count = access_count.max(entry.access_count);
                weighted_degree = weighted_degree.max(entry.weighted_degree);
            }
            *maxima = Maxima {
                access_count,
                weighted_degree,
                stale: false,
            };
        }
        ScoringContext {
            now,
            max_access_count: maxima.access_count,
            max_weighted_degree: maxima.weighted_degree,
        }
    }

    /// Record a committed node write
    fn note_access(&self, node: &MemoryNode) {
        self.set_signals(&node.id, |s| s.access_count = node.access_count);
    }

    fn set_signals(&self, id: &NodeId, change: impl FnOnce(&mut Signals)) {
        let (before, after) = {
            let mut entry = self.signals.entry(*id).or_default();
            let before = *entry;
            change(&mut *entry);
            (before, *entry)
        };
        if before != after {
            self.maxima.lock().observe(before, after);
        }
    }

    fn drop_signals(&self, id: &NodeId) {
        if let Some((_, before)) = self.signals.remove(id) {
            self.maxima.lock().observe(before, Signals::default());
        }
    }

    /// Reload signals for `id` and every endpoint of `edges` from committed
    /// state. Failures leave the previous value; the next refresh corrects it.
    pub(crate) async fn refresh_edges(&self, id: NodeId, edges: &[Edge]) {
        let mut touched = vec![id];
        for edge in edges {
            touched.push(edge.source);
            touched.push(edge.target);
        }
        touched.sort();
        touched.dedup();
        for node in touched {
            if let Err(e) = self.refresh_signals(&node).await {
                log::warn!("Could not refresh signals of {}: {}", node, e);
            }
        }
    }

    async fn refresh_signals(&self, id: &NodeId) -> Result<()> {
        let Some(node) = self.get(id).await? else {
            self.drop_signals(id);
            return Ok(());
        };
        let degree: f32 = self.edges_of(id).await?.iter().map(|e| e.weight).sum();
        self.set_signals(id, |s| {
            s.access_count = node.access_count;
            s.weighted_degree = degree;
        });
        Ok(())
    }

    /// Weighted degree `id` would have after upserting `edges`
    pub async fn projected_degree(&self, id: &NodeId, edges: &[Edge]) -> Result<f32> {
        let mut by_key: BTreeMap<EdgeKey, f32> = BTreeMap::new();
        for edge in self.edges_of(id).await? {
            by_key.insert(edge.key(), edge.weight);
        }
        for edge in edges.iter().filter(|e| e.touches(id)) {
            by_key.insert(edge.key(), edge.weight);
        }
        Ok(by_key.values().sum())
    }
}

pub(crate) fn validate_edge(edge: &Edge) -> Result<()> {
    if edge.relation.is_empty() {
        return Err(MemoryError::validation("edge relation must not be empty"));
    }
    if !(edge.weight > 0.0 && edge.weight <= 1.0) {
        return Err(MemoryError::validation(format!(
            "edge weight must be in (0, 1], got {}",
            edge.weight
        )));
    }
    if edge.source == edge.target {
        return Err(MemoryError::validation("self-loops are not allowed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultyAdapter, MemoryAdapter, Operation};

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    async fn store() -> GraphStore {
        GraphStore::open(Arc::new(MemoryAdapter::new(16)), retry(), 3)
            .await
            .unwrap()
    }

    fn node(content: &str) -> MemoryNode {
        MemoryNode::builder().content(content).build().unwrap()
    }

    #[tokio::test]
    async fn test_write_and_remove_cascades() {
        let graph = store().await;
        let a = node("a");
        let b = node("b");
        graph.write(&a, &[], Some(0)).await.unwrap();
        graph
            .write(&b, &[Edge::new(a.id, b.id, "knows", 0.6)], Some(0))
            .await
            .unwrap();
        assert!((graph.weighted_degree(&a.id) - 0.6).abs() < 1e-6);
        assert_eq!(graph.edge_count().await.unwrap(), 1);

        graph.remove(&b.id).await.unwrap();
        assert_eq!(graph.edge_count().await.unwrap(), 0);
        assert_eq!(graph.weighted_degree(&a.id), 0.0);
        assert!(graph.get(&b.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_edge_rolls_back_node() {
        let inner: Arc<dyn BackendAdapter> = Arc::new(MemoryAdapter::new(16));
        let faulty = Arc::new(FaultyAdapter::new(inner));
        let graph = GraphStore::open(faulty.clone(), retry(), 3).await.unwrap();

        let a = node("a");
        graph.write(&a, &[], None).await.unwrap();
        faulty.fail(Operation::PutEdge);

        let b = node("b");
        let err = graph
            .write(&b, &[Edge::new(a.id, b.id, "knows", 0.6)], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::PartialWrite {
                quarantined: false,
                ..
            }
        ));
        assert!(graph.get(&b.id).await.unwrap().is_none());
        assert_eq!(graph.node_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_edge_validation() {
        let graph = store().await;
        let a = node("a");
        let b = node("b");
        graph.write(&a, &[], None).await.unwrap();
        graph.write(&b, &[], None).await.unwrap();

        for bad in [
            Edge::new(a.id, b.id, "knows", 0.0),
            Edge::new(a.id, b.id, "knows", 1.5),
            Edge::new(a.id, b.id, "", 0.5),
            Edge::new(a.id, a.id, "self", 0.5),
        ] {
            assert!(graph.link(&bad).await.unwrap_err().is_validation());
        }
        let missing = Edge::new(a.id, NodeId::new(), "knows", 0.5);
        assert!(matches!(
            graph.link(&missing).await.unwrap_err(),
            MemoryError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_update_retries_conflicts() {
        let graph = store().await;
        let a = node("a");
        graph.write(&a, &[], None).await.unwrap();

        // First attempt races with a concurrent writer
        let mut raced = false;
        let updated = graph
            .update(&a.id, |n| {
                if !raced {
                    raced = true;
                    let mut other = n.clone();
                    other.content = "concurrent".to_string();
                    let adapter = graph.adapter().clone();
                    futures::executor::block_on(adapter.put_node(&other, None)).unwrap();
                }
                n.access_count += 1;
                true
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.access_count, 1);
        assert_eq!(updated.content, "concurrent");
        assert_eq!(updated.version, 3);
    }

    #[tokio::test]
    async fn test_scoring_context_maxima() {
        let graph = store().await;
        let a = node("a");
        let mut b = node("b");
        b.access_count = 7;
        graph.write(&a, &[], None).await.unwrap();
        graph
            .write(&b, &[Edge::new(a.id, b.id, "knows", 0.4)], None)
            .await
            .unwrap();
        let c = node("c");
        graph
            .write(
                &c,
                &[
                    Edge::new(c.id, a.id, "knows", 0.5),
                    Edge::new(c.id, b.id, "knows", 0.5),
                ],
                None,
            )
            .await
            .unwrap();

        let ctx = graph.scoring_context(Utc::now());
        assert_eq!(ctx.max_access_count, 7);
        assert!((ctx.max_weighted_degree - 1.0).abs() < 1e-6);
        assert!((graph.projected_degree(&a.id, &[]).await.unwrap() - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_maxima_fall_when_leader_removed() {
        let graph = store().await;
        let mut hub = node("hub");
        hub.access_count = 12;
        let mut leaf = node("leaf");
        leaf.access_count = 3;
        let other = node("other");
        graph.write(&hub, &[], None).await.unwrap();
        graph.write(&leaf, &[], None).await.unwrap();
        graph.write(&other, &[], None).await.unwrap();
        graph
            .link(&Edge::new(hub.id, leaf.id, "knows", 0.8))
            .await
            .unwrap();
        graph
            .link(&Edge::new(hub.id, other.id, "knows", 0.6))
            .await
            .unwrap();
        graph
            .link(&Edge::new(leaf.id, other.id, "knows", 0.1))
            .await
            .unwrap();

        let ctx = graph.scoring_context(Utc::now());
        assert_eq!(ctx.max_access_count, 12);
        assert!((ctx.max_weighted_degree - 1.4).abs() < 1e-6);

        graph.remove(&hub.id).await.unwrap();
        let ctx = graph.scoring_context(Utc::now());
        assert_eq!(ctx.max_access_count, 3);
        assert!((ctx.max_weighted_degree - 0.1).abs() < 1e-6);

        graph
            .update(&leaf.id, |n| {
                n.access_count = 40;
                true
            })
            .await
            .unwrap();
        assert_eq!(graph.scoring_context(Utc::now()).max_access_count, 40);
    }

    #[tokio::test]
    async fn test_rolled_back_write_leaves_signals() {
        let graph = store().await;
        let mut a = node("a");
        a.access_count = 2;
        graph.write(&a, &[], None).await.unwrap();

        let mut busy = node("busy");
        busy.access_count = 50;
        let dangling = Edge::new(busy.id, NodeId::new(), "knows", 0.5);
        assert!(graph.write(&busy, &[dangling], None).await.is_err());
        assert!(graph.get(&busy.id).await.unwrap().is_none());

        let ctx = graph.scoring_context(Utc::now());
        assert_eq!(ctx.max_access_count, 2);
        assert_eq!(ctx.max_weighted_degree, 0.0);
    }
}
