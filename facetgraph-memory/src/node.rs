//! Memory node and edge types
//!
//! Core types for representing the knowledge graph: nodes carrying named
//! facet embeddings, and weighted, optionally directed relations between them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for memory nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random NodeId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Arbitrary caller-supplied metadata
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Facet name to embedding vector
pub type FacetVectors = BTreeMap<String, Vec<f32>>;

/// A memory node in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNode {
    /// Unique identifier
    pub id: NodeId,
    /// Observed fact or text
    pub content: String,
    /// Named embeddings; the facet set may differ per node
    pub facets: FacetVectors,
    /// Retrieval priority in [0, 1]
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub metadata: Metadata,
    /// Optimistic concurrency counter, advanced by the backend on every write
    pub version: u64,
    /// Set when a failed write could not be rolled back; excluded from retrieval
    pub quarantined: bool,
}

impl MemoryNode {
    /// Create a new builder for MemoryNode
    pub fn builder() -> MemoryNodeBuilder {
        MemoryNodeBuilder::new()
    }

    /// Time since the node was last retrieved (or created)
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_accessed).max(chrono::Duration::zero())
    }

    /// Register a retrieval hit
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        if now > self.last_accessed {
            self.last_accessed = now;
        }
    }

    /// Facet names shared with another node
    pub fn shared_facets<'a>(&'a self, other: &'a MemoryNode) -> impl Iterator<Item = &'a str> {
        self.facets
            .keys()
            .filter(move |facet| other.facets.contains_key(*facet))
            .map(String::as_str)
    }
}

/// Builder for MemoryNode with fluent API
#[derive(Debug, Default)]
pub struct MemoryNodeBuilder {
    id: Option<NodeId>,
    content: Option<String>,
    facets: FacetVectors,
    importance: Option<f32>,
    created_at: Option<DateTime<Utc>>,
    metadata: Metadata,
}

impl MemoryNodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node ID (auto-generated if not set)
    pub fn id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the content
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Add a facet embedding
    pub fn facet(mut self, name: impl Into<String>, vector: Vec<f32>) -> Self {
        self.facets.insert(name.into(), vector);
        self
    }

    /// Replace all facet embeddings
    pub fn facets(mut self, facets: FacetVectors) -> Self {
        self.facets = facets;
        self
    }

    /// Set the initial importance
    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    /// Set creation (and initial access) time
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Add a metadata entry
    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Replace all metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build the MemoryNode
    pub fn build(self) -> Result<MemoryNode, MemoryNodeBuilderError> {
        let content = self.content.ok_or(MemoryNodeBuilderError::MissingContent)?;
        let created_at = self.created_at.unwrap_or_else(Utc::now);

        Ok(MemoryNode {
            id: self.id.unwrap_or_default(),
            content,
            facets: self.facets,
            importance: self.importance.unwrap_or(0.0),
            created_at,
            last_accessed: created_at,
            access_count: 0,
            metadata: self.metadata,
            version: 0,
            quarantined: false,
        })
    }
}

/// Errors that can occur when building a MemoryNode
#[derive(Debug, thiserror::Error)]
pub enum MemoryNodeBuilderError {
    #[error("Missing required field: content")]
    MissingContent,
}

/// Identity of an edge: one edge per (source, target, relation)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeId,
    pub target: NodeId,
    pub relation: String,
}

/// Weighted relation between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub relation: String,
    /// Strength in (0, 1]
    pub weight: f32,
    /// Directed edges are traversed source → target only
    pub directed: bool,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId, relation: impl Into<String>, weight: f32) -> Self {
        Self {
            source,
            target,
            relation: relation.into(),
            weight,
            directed: true,
        }
    }

    pub fn undirected(mut self) -> Self {
        self.directed = false;
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.source,
            target: self.target,
            relation: self.relation.clone(),
        }
    }

    pub fn touches(&self, id: &NodeId) -> bool {
        self.source == *id || self.target == *id
    }

    /// The node reached by following this edge out of `from`, honouring direction
    pub fn traverse_from(&self, from: &NodeId) -> Option<NodeId> {
        if self.source == *from {
            Some(self.target)
        } else if !self.directed && self.target == *from {
            Some(self.source)
        } else {
            None
        }
    }

    /// The endpoint that is not `id`
    pub fn other_end(&self, id: &NodeId) -> NodeId {
        if self.source == *id {
            self.target
        } else {
            self.source
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generation() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_node_id_parse() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_builder() {
        let node = MemoryNode::builder()
            .content("Alice leads the platform team")
            .facet("role", vec![1.0, 0.0])
            .facet("skill", vec![0.0, 1.0, 0.0])
            .meta("source", serde_json::json!("standup"))
            .importance(1.7)
            .build()
            .unwrap();

        assert_eq!(node.facets.len(), 2);
        assert_eq!(node.importance, 1.0);
        assert_eq!(node.version, 0);
        assert_eq!(node.access_count, 0);
        assert_eq!(node.created_at, node.last_accessed);
        assert!(!node.quarantined);
    }

    #[test]
    fn test_builder_missing_content() {
        let result = MemoryNode::builder().facet("role", vec![1.0]).build();
        assert!(matches!(result, Err(MemoryNodeBuilderError::MissingContent)));
    }

    #[test]
    fn test_record_access() {
        let start = Utc::now();
        let mut node = MemoryNode::builder()
            .content("x")
            .created_at(start)
            .build()
            .unwrap();
        node.record_access(start + chrono::Duration::seconds(30));
        assert_eq!(node.access_count, 1);
        assert_eq!(node.idle_for(start + chrono::Duration::seconds(40)).num_seconds(), 10);

        // Out-of-order access never moves the timestamp backwards
        node.record_access(start);
        assert_eq!(node.access_count, 2);
        assert_eq!(node.last_accessed, start + chrono::Duration::seconds(30));
    }

    #[test]
    fn test_shared_facets() {
        let a = MemoryNode::builder()
            .content("a")
            .facet("role", vec![1.0])
            .facet("skill", vec![1.0])
            .build()
            .unwrap();
        let b = MemoryNode::builder()
            .content("b")
            .facet("skill", vec![1.0])
            .facet("team", vec![1.0])
            .build()
            .unwrap();
        let shared: Vec<&str> = a.shared_facets(&b).collect();
        assert_eq!(shared, vec!["skill"]);
    }

    #[test]
    fn test_edge_traversal_direction() {
        let a = NodeId::new();
        let b = NodeId::new();
        let directed = Edge::new(a, b, "knows", 0.5);
        assert_eq!(directed.traverse_from(&a), Some(b));
        assert_eq!(directed.traverse_from(&b), None);

        let undirected = directed.clone().undirected();
        assert_eq!(undirected.traverse_from(&b), Some(a));
        assert_eq!(undirected.other_end(&a), b);
    }

    #[test]
    fn test_node_serialization() {
        let node = MemoryNode::builder()
            .content("Test")
            .facet("role", vec![0.5, 0.5])
            .meta("k", serde_json::json!({"nested": [1, 2]}))
            .build()
            .unwrap();

        let bytes = rmp_serde::to_vec_named(&node).unwrap();
        let decoded: MemoryNode = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(node, decoded);
    }
}
