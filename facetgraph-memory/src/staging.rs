//! Per-node staging buffer
//!
//! A node write touches up to three layers (node record, edges, facet
//! vectors), possibly on different backends. Every applied sub-write pushes
//! the operation that reverses it; on failure the log is replayed backwards.

use std::sync::Arc;

use crate::backend::BackendAdapter;
use crate::config::RetryConfig;
use crate::error::{MemoryError, Result};
use crate::node::{Edge, EdgeKey, MemoryNode, NodeId};
use crate::retry::with_retry;

/// Reverses one applied sub-write
pub(crate) enum UndoOp {
    /// Put back the node as it was, or delete it if it did not exist
    Node {
        adapter: Arc<dyn BackendAdapter>,
        id: NodeId,
        previous: Option<MemoryNode>,
    },
    /// Put back a replaced edge, or delete an inserted one
    Edge {
        adapter: Arc<dyn BackendAdapter>,
        key: EdgeKey,
        previous: Option<Edge>,
    },
    /// Re-insert edges removed by a cascade
    RemovedEdges {
        adapter: Arc<dyn BackendAdapter>,
        edges: Vec<Edge>,
    },
    /// Put back a replaced vector, or delete an inserted one
    Vector {
        adapter: Arc<dyn BackendAdapter>,
        facet: String,
        id: NodeId,
        previous: Option<Vec<f32>>,
    },
}

impl UndoOp {
    async fn apply(&self, retry: &RetryConfig) -> Result<()> {
        match self {
            UndoOp::Node {
                adapter,
                id,
                previous: Some(node),
            } => {
                with_retry(retry, "restore node", || adapter.put_node(node, None)).await?;
                log::debug!("Restored node {}", id);
            }
            UndoOp::Node {
                adapter,
                id,
                previous: None,
            } => {
                with_retry(retry, "remove staged node", || adapter.delete_node(id, None)).await?;
            }
            UndoOp::Edge {
                adapter,
                previous: Some(edge),
                ..
            } => {
                with_retry(retry, "restore edge", || adapter.put_edge(edge)).await?;
            }
            UndoOp::Edge {
                adapter,
                key,
                previous: None,
            } => {
                with_retry(retry, "remove staged edge", || adapter.delete_edge(key)).await?;
            }
            UndoOp::RemovedEdges { adapter, edges } => {
                for edge in edges {
                    with_retry(retry, "restore edge", || adapter.put_edge(edge)).await?;
                }
            }
            UndoOp::Vector {
                adapter,
                facet,
                id,
                previous: Some(vector),
            } => {
                with_retry(retry, "restore vector", || {
                    adapter.put_vector(facet, id, vector)
                })
                .await?;
            }
            UndoOp::Vector {
                adapter,
                facet,
                id,
                previous: None,
            } => {
                with_retry(retry, "remove staged vector", || {
                    adapter.delete_vector(facet, id)
                })
                .await?;
            }
        }
        Ok(())
    }
}

/// Undo log for one node's multi-layer write
pub struct StagedWrite {
    node_id: NodeId,
    undo: Vec<UndoOp>,
}

impl StagedWrite {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            undo: Vec::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Number of applied sub-writes
    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    pub(crate) fn record(&mut self, op: UndoOp) {
        self.undo.push(op);
    }

    /// Discard the log; the write stands
    pub fn commit(self) {
        log::trace!(
            "Committed {} staged writes for {}",
            self.undo.len(),
            self.node_id
        );
    }

    /// Reverse every applied sub-write, newest first. All undo operations are
    /// attempted; the first failure is returned.
    pub async fn rollback(self, retry: &RetryConfig) -> Result<()> {
        let total = self.undo.len();
        let mut first_error = None;
        for op in self.undo.iter().rev() {
            if let Err(e) = op.apply(retry).await {
                log::error!("Rollback step for {} failed: {}", self.node_id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                log::warn!("Rolled back {} writes for {}", total, self.node_id);
                Ok(())
            }
        }
    }
}

/// Turn the failure of a staged operation into the error the caller sees.
///
/// Nothing applied: the original error. Rolled back cleanly: `PartialWrite`
/// without quarantine. Rollback failed: `PartialWrite` with `quarantined`
/// reporting whether `quarantine` managed to flag the node.
pub(crate) async fn settle<T, Q, Fut>(
    staged: StagedWrite,
    outcome: Result<T>,
    retry: &RetryConfig,
    quarantine: Q,
) -> Result<T>
where
    Q: FnOnce(NodeId) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let error = match outcome {
        Ok(value) => {
            staged.commit();
            return Ok(value);
        }
        Err(e) => e,
    };
    if staged.is_empty() {
        return Err(error);
    }

    let id = staged.node_id();
    match staged.rollback(retry).await {
        Ok(()) => Err(MemoryError::partial_write(
            id.to_string(),
            format!("rolled back after: {}", error),
            false,
        )),
        Err(rollback_error) => {
            let quarantined = match quarantine(id).await {
                Ok(()) => {
                    log::error!("Quarantined node {} after failed rollback", id);
                    true
                }
                Err(e) => {
                    log::error!("Could not quarantine node {}: {}", id, e);
                    false
                }
            };
            Err(MemoryError::partial_write(
                id.to_string(),
                format!("{}; rollback failed: {}", error, rollback_error),
                quarantined,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultyAdapter, MemoryAdapter, Operation};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_state() {
        let adapter: Arc<dyn BackendAdapter> = Arc::new(MemoryAdapter::new(16));
        let original = MemoryNode::builder().content("v1").build().unwrap();
        adapter.put_node(&original, None).await.unwrap();
        let stored = adapter.get_node(&original.id).await.unwrap();

        let mut staged = StagedWrite::new(original.id);
        let mut updated = original.clone();
        updated.content = "v2".to_string();
        adapter.put_node(&updated, Some(1)).await.unwrap();
        staged.record(UndoOp::Node {
            adapter: adapter.clone(),
            id: original.id,
            previous: stored,
        });
        adapter.put_vector("topic", &original.id, &[1.0]).await.unwrap();
        staged.record(UndoOp::Vector {
            adapter: adapter.clone(),
            facet: "topic".to_string(),
            id: original.id,
            previous: None,
        });

        staged.rollback(&fast()).await.unwrap();
        let node = adapter.get_node(&original.id).await.unwrap().unwrap();
        assert_eq!(node.content, "v1");
        assert!(adapter
            .get_vector("topic", &original.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_settle_reports_quarantine_when_rollback_fails() {
        let inner: Arc<dyn BackendAdapter> = Arc::new(MemoryAdapter::new(16));
        let faulty = Arc::new(FaultyAdapter::new(inner.clone()));
        let adapter: Arc<dyn BackendAdapter> = faulty.clone();

        let node = MemoryNode::builder().content("x").build().unwrap();
        adapter.put_node(&node, None).await.unwrap();
        let mut staged = StagedWrite::new(node.id);
        staged.record(UndoOp::Node {
            adapter: adapter.clone(),
            id: node.id,
            previous: None,
        });
        faulty.fail(Operation::DeleteNode);

        let outcome: Result<()> = Err(MemoryError::unavailable("vector store down"));
        let err = settle(staged, outcome, &fast(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::PartialWrite {
                quarantined: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_settle_passes_through_when_nothing_applied() {
        let staged = StagedWrite::new(NodeId::new());
        let outcome: Result<()> = Err(MemoryError::conflict("n", 1, 2));
        let err = settle(staged, outcome, &fast(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
