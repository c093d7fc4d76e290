//! Memory engine facade
//!
//! Owns the graph store, vector index, scorer, retrieval orchestrator and
//! pruner behind one handle.
//!
//! ```ignore
//! use facetgraph_memory::{IngestRequest, MemoryConfig, MemoryEngine, QueryRequest, SystemClock};
//!
//! let engine = MemoryEngine::open(config, Arc::new(SystemClock)).await?;
//! let id = engine
//!     .ingest(IngestRequest::new("Deploys freeze on Fridays", facets))
//!     .await?;
//! let result = engine.query(&QueryRequest::new(query_facets, 5).depth(1)).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::backend::{AdapterPool, BackendAdapter};
use crate::config::MemoryConfig;
use crate::embedding::{EmbeddingProvider, FacetEmbedder};
use crate::error::{MemoryError, Result};
use crate::graph::{validate_edge, GraphStore};
use crate::node::{Edge, FacetVectors, MemoryNode, Metadata, NodeId};
use crate::pruner::{PruneReport, PruneSettings, Pruner, PrunerHandle};
use crate::registry::VectorSpaceRegistry;
use crate::retrieval::{QueryRequest, QueryResult, RetrievalOrchestrator, RetrievalSettings};
use crate::scorer::ImportanceScorer;
use crate::staging::StagedWrite;
use crate::temporal::Clock;
use crate::vector_index::VectorIndex;

/// Edge to an existing node, declared while ingesting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    /// The existing node on the other end
    pub node: NodeId,
    pub relation: String,
    pub weight: f32,
    #[serde(default = "default_directed")]
    pub directed: bool,
    /// Edge runs from `node` to the ingested node rather than away from it
    #[serde(default)]
    pub incoming: bool,
}

fn default_directed() -> bool {
    true
}

impl EdgeSpec {
    /// Directed edge from the ingested node to `node`
    pub fn to(node: NodeId, relation: impl Into<String>, weight: f32) -> Self {
        Self {
            node,
            relation: relation.into(),
            weight,
            directed: true,
            incoming: false,
        }
    }

    /// Directed edge from `node` to the ingested node
    pub fn from(node: NodeId, relation: impl Into<String>, weight: f32) -> Self {
        Self {
            incoming: true,
            ..Self::to(node, relation, weight)
        }
    }

    pub fn undirected(mut self) -> Self {
        self.directed = false;
        self
    }

    fn to_edge(&self, id: NodeId) -> Edge {
        let (source, target) = if self.incoming {
            (self.node, id)
        } else {
            (id, self.node)
        };
        let mut edge = Edge::new(source, target, self.relation.clone(), self.weight);
        edge.directed = self.directed;
        edge
    }
}

/// A memory to store. With `id` set and already present, the node is updated
/// in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub id: Option<NodeId>,
    pub content: String,
    pub facets: FacetVectors,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Initial importance; computed from the scorer when absent
    #[serde(default)]
    pub importance: Option<f32>,
}

impl IngestRequest {
    pub fn new(content: impl Into<String>, facets: FacetVectors) -> Self {
        Self {
            content: content.into(),
            facets,
            ..Default::default()
        }
    }

    pub fn id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }
}

/// Store-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub nodes: usize,
    pub edges: usize,
    /// Stored vectors per registered facet
    pub vectors: BTreeMap<String, usize>,
    pub quarantined: usize,
}

pub struct MemoryEngine {
    config: MemoryConfig,
    graph: Arc<GraphStore>,
    vectors: Arc<VectorIndex>,
    scorer: Arc<ImportanceScorer>,
    clock: Arc<dyn Clock>,
    retrieval: RetrievalOrchestrator,
    pruner: Arc<Pruner>,
    prune_trigger: Arc<Notify>,
    embedder: Option<FacetEmbedder>,
}

impl MemoryEngine {
    /// Validate `config` and open the backends it names
    pub async fn open(config: MemoryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(VectorSpaceRegistry::from_dimensions(
            &config.facet_dimensions,
        ));
        let mut pool = AdapterPool::new(config.exact_search_threshold);
        let graph_adapter = pool.get(&config.backends.graph)?;
        let vectors =
            VectorIndex::from_config(registry, &config.backends, &mut pool, config.retry.clone())?;
        Self::assemble(config, graph_adapter, vectors, clock).await
    }

    /// Build on caller-supplied adapters; `config.backends` is ignored
    pub async fn with_adapters(
        config: MemoryConfig,
        graph_adapter: Arc<dyn BackendAdapter>,
        vector_adapter: Arc<dyn BackendAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(VectorSpaceRegistry::from_dimensions(
            &config.facet_dimensions,
        ));
        let vectors = VectorIndex::new(registry, vector_adapter, config.retry.clone());
        Self::assemble(config, graph_adapter, vectors, clock).await
    }

    async fn assemble(
        config: MemoryConfig,
        graph_adapter: Arc<dyn BackendAdapter>,
        vectors: VectorIndex,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let graph = Arc::new(
            GraphStore::open(graph_adapter, config.retry.clone(), config.conflict_retries).await?,
        );
        // Facets with stored vectors keep their dimensionality
        for facet in vectors.registry().facets() {
            if vectors.count(&facet).await? > 0 {
                vectors.registry().mark_in_use(&facet);
            }
        }
        let vectors = Arc::new(vectors);
        let scorer = Arc::new(ImportanceScorer::new(&config.scorer));
        let retrieval = RetrievalOrchestrator::new(
            graph.clone(),
            vectors.clone(),
            scorer.clone(),
            clock.clone(),
            RetrievalSettings::from_config(&config),
        );
        let pruner = Arc::new(Pruner::new(
            graph.clone(),
            vectors.clone(),
            scorer.clone(),
            clock.clone(),
            PruneSettings::from_config(&config),
        ));

        log::info!(
            "Memory engine ready: {} facets, {} nodes",
            config.facet_dimensions.len(),
            graph.node_count().await?
        );

        Ok(Self {
            config,
            graph,
            vectors,
            scorer,
            clock,
            retrieval,
            pruner,
            prune_trigger: Arc::new(Notify::new()),
            embedder: None,
        })
    }

    /// Attach an embedding provider for `embed_facets` and `query_text`
    pub fn with_embedder(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        log::info!("Using {} embeddings", provider.name());
        self.embedder = Some(FacetEmbedder::new(provider, self.vectors.registry().clone()));
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    pub fn vectors(&self) -> &Arc<VectorIndex> {
        &self.vectors
    }

    /// Store a memory with its facet vectors and edges to existing nodes.
    /// Node, edges and vectors are applied together or rolled back together.
    pub async fn ingest(&self, request: IngestRequest) -> Result<NodeId> {
        self.validate_ingest(&request)?;
        let id = request.id.unwrap_or_default();
        let edges: Vec<Edge> = request.edges.iter().map(|spec| spec.to_edge(id)).collect();
        for edge in &edges {
            validate_edge(edge)?;
        }
        for spec in &request.edges {
            if self.graph.get(&spec.node).await?.is_none() {
                return Err(MemoryError::not_found(format!("edge endpoint {}", spec.node)));
            }
        }

        let mut attempt = 0;
        let outcome = loop {
            match self.write_ingest(id, &request, &edges).await {
                Err(e) if e.is_conflict() && attempt < self.config.conflict_retries => {
                    let delay = self.config.retry.delay_for(attempt);
                    log::debug!("Conflict ingesting {}, retrying in {:?}", id, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other,
            }
        };
        self.graph.refresh_edges(id, &edges).await;

        let created = outcome?;
        log::debug!(
            "{} memory {} ({} facets, {} edges)",
            if created { "Ingested" } else { "Updated" },
            id,
            request.facets.len(),
            edges.len()
        );
        self.check_capacity().await;
        Ok(id)
    }

    fn validate_ingest(&self, request: &IngestRequest) -> Result<()> {
        if request.content.trim().is_empty() {
            return Err(MemoryError::validation("memory content must not be empty"));
        }
        if request.facets.is_empty() {
            return Err(MemoryError::validation("a memory needs at least one facet"));
        }
        self.vectors.validate(&request.facets)?;
        if let Some(hint) = request.importance {
            if !(0.0..=1.0).contains(&hint) {
                return Err(MemoryError::validation(format!(
                    "importance must be in [0, 1], got {}",
                    hint
                )));
            }
        }
        Ok(())
    }

    /// One attempt at the staged write. Returns true when the node is new.
    async fn write_ingest(&self, id: NodeId, request: &IngestRequest, edges: &[Edge]) -> Result<bool> {
        let now = self.clock.now();
        let existing = self.graph.get(&id).await?;

        let mut node = match &existing {
            Some(previous) => MemoryNode {
                content: request.content.clone(),
                facets: request.facets.clone(),
                metadata: request.metadata.clone(),
                quarantined: false,
                ..previous.clone()
            },
            None => MemoryNode::builder()
                .id(id)
                .content(request.content.clone())
                .facets(request.facets.clone())
                .metadata(request.metadata.clone())
                .created_at(now)
                .build()
                .map_err(|e| MemoryError::validation(e.to_string()))?,
        };
        node.importance = match request.importance {
            Some(hint) => hint,
            None => {
                let degree = self.graph.projected_degree(&id, edges).await?;
                let ctx = self.graph.scoring_context(now);
                self.scorer.score(&node, degree, &ctx)
            }
        };

        // Absent nodes count as version 0, so a concurrent create conflicts
        let expected = existing.as_ref().map_or(0, |n| n.version);
        let dropped: Vec<String> = existing
            .iter()
            .flat_map(|previous| previous.facets.keys())
            .filter(|facet| !node.facets.contains_key(*facet))
            .cloned()
            .collect();

        let mut staged = StagedWrite::new(id);
        let outcome = self
            .stage_ingest(&mut staged, &node, edges, expected, &dropped)
            .await;
        self.graph.settle(staged, outcome).await?;
        Ok(existing.is_none())
    }

    async fn stage_ingest(
        &self,
        staged: &mut StagedWrite,
        node: &MemoryNode,
        edges: &[Edge],
        expected: u64,
        dropped: &[String],
    ) -> Result<()> {
        self.graph
            .stage_node_and_edges(staged, node, edges, Some(expected))
            .await?;
        for (facet, vector) in &node.facets {
            self.vectors.stage_put(staged, facet, &node.id, vector).await?;
        }
        for facet in dropped {
            self.vectors.stage_remove(staged, facet, &node.id).await?;
        }
        Ok(())
    }

    async fn check_capacity(&self) {
        let Some(max) = self.config.max_memories else {
            return;
        };
        match self.graph.node_count().await {
            Ok(count) if count > max => {
                log::info!("{} memories exceed the cap of {}, requesting a prune", count, max);
                self.prune_trigger.notify_one();
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not check memory count: {}", e),
        }
    }

    /// Add or replace an edge between existing nodes and refresh the
    /// endpoints' importance. Returns the edge it replaced.
    pub async fn link(
        &self,
        source: NodeId,
        target: NodeId,
        relation: impl Into<String>,
        weight: f32,
        directed: bool,
    ) -> Result<Option<Edge>> {
        let mut edge = Edge::new(source, target, relation, weight);
        edge.directed = directed;
        let previous = self.graph.link(&edge).await?;

        let ctx = self.graph.scoring_context(self.clock.now());
        for id in [source, target] {
            let degree = self.graph.weighted_degree(&id);
            let refreshed = self
                .graph
                .update(&id, |node| {
                    let importance = self.scorer.reinforce(node, degree, &ctx);
                    if importance <= node.importance {
                        return false;
                    }
                    node.importance = importance;
                    true
                })
                .await;
            if let Err(e) = refreshed {
                log::warn!("Could not refresh importance of {}: {}", id, e);
            }
        }
        Ok(previous)
    }

    /// Two-phase retrieve with diversified selection
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.retrieval.query(request).await
    }

    /// Embed `text` for `facets` with the attached provider and query with
    /// the result. Facets that could not be embedded are reported degraded.
    pub async fn query_text(&self, text: &str, facets: &[String], k: usize) -> Result<QueryResult> {
        let (vectors, unembedded) = self.embed_facets(text, facets).await?;
        if vectors.is_empty() {
            return Err(MemoryError::unavailable("no query facet could be embedded"));
        }
        let mut result = self.query(&QueryRequest::new(vectors, k)).await?;
        result.degraded_facets.extend(unembedded);
        result.degraded_facets.sort();
        result.degraded_facets.dedup();
        Ok(result)
    }

    /// Embed `text` per facet. Returns the vectors and the facets that failed.
    pub async fn embed_facets(
        &self,
        text: &str,
        facets: &[String],
    ) -> Result<(FacetVectors, Vec<String>)> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| MemoryError::validation("no embedding provider attached"))?;
        if let Some(unknown) = facets.iter().find(|f| !self.vectors.registry().contains(f)) {
            return Err(MemoryError::validation(format!(
                "facet '{}' is not registered",
                unknown
            )));
        }
        let (vectors, failed) = embedder.embed_facets(text, facets).await;
        Ok((vectors, failed.into_keys().collect()))
    }

    /// Run one pruning sweep now
    pub async fn prune(&self, dry_run: bool) -> Result<PruneReport> {
        self.pruner.sweep(dry_run, None).await
    }

    /// Start periodic pruning. Exceeding `maxMemories` also wakes it.
    pub fn spawn_pruner(&self) -> PrunerHandle {
        PrunerHandle::spawn(self.pruner.clone(), self.prune_trigger.clone())
    }

    pub async fn get(&self, id: &NodeId) -> Result<Option<MemoryNode>> {
        self.graph.get(id).await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let mut stats = EngineStats {
            nodes: self.graph.node_count().await?,
            edges: self.graph.edge_count().await?,
            ..Default::default()
        };
        for facet in self.vectors.registry().facets() {
            let count = self.vectors.count(&facet).await?;
            stats.vectors.insert(facet, count);
        }
        for id in self.graph.list_node_ids().await? {
            if self.graph.get(&id).await?.is_some_and(|n| n.quarantined) {
                stats.quarantined += 1;
            }
        }
        Ok(stats)
    }

    /// Re-validate a node, rewrite its vectors from the node record, drop
    /// vectors for facets it no longer has, and clear quarantine
    pub async fn repair(&self, id: &NodeId) -> Result<MemoryNode> {
        let node = self
            .graph
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::not_found(id.to_string()))?;
        self.vectors.validate(&node.facets)?;

        let stray: Vec<String> = self
            .vectors
            .registry()
            .facets()
            .into_iter()
            .filter(|facet| !node.facets.contains_key(facet))
            .collect();
        let mut staged = StagedWrite::new(*id);
        let outcome = self.stage_repair(&mut staged, &node, &stray).await;
        self.graph.settle(staged, outcome).await?;

        let edges = self.graph.edges_of(id).await?;
        self.graph.refresh_edges(*id, &edges).await;

        let repaired = self
            .graph
            .set_quarantine(id, false)
            .await?
            .ok_or_else(|| MemoryError::not_found(id.to_string()))?;
        if node.quarantined {
            log::info!("Repaired quarantined node {}", id);
        }
        Ok(repaired)
    }

    async fn stage_repair(
        &self,
        staged: &mut StagedWrite,
        node: &MemoryNode,
        stray: &[String],
    ) -> Result<()> {
        for (facet, vector) in &node.facets {
            self.vectors.stage_put(staged, facet, &node.id, vector).await?;
        }
        for facet in stray {
            self.vectors.stage_remove(staged, facet, &node.id).await?;
        }
        Ok(())
    }
}
