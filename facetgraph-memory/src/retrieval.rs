//! Retrieval orchestration
//!
//! Two phases under one deadline. The semantic phase searches every query
//! facet concurrently and keeps each node's best similarity. The graph phase
//! expands from those seeds with bounded fan-out, discounting relevance by
//! path weight and hop distance. The merged pool is weighted by importance,
//! diversified with MMR, and the selected nodes are reinforced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::GraphStore;
use crate::mmr::MmrSelector;
use crate::node::{FacetVectors, MemoryNode, NodeId};
use crate::scorer::ImportanceScorer;
use crate::temporal::Clock;
use crate::vector_index::VectorIndex;

/// How a candidate entered the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Semantic,
    Graph,
}

/// One ranked memory in a query result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedMemory {
    pub node: MemoryNode,
    /// max(semantic similarity, graph-propagated relevance), in [0, 1]
    pub relevance: f32,
    /// relevance × importance
    pub score: f32,
    pub source: CandidateSource,
    /// Hops from the nearest seed; 0 for semantic hits
    pub distance: usize,
}

/// A retrieval request. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Query embedding per facet
    pub facets: FacetVectors,
    pub k: usize,
    #[serde(default)]
    pub depth: Option<usize>,
    #[serde(default)]
    pub lambda: Option<f32>,
    /// Only traverse edges with this relation
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(facets: FacetVectors, k: usize) -> Self {
        Self {
            facets,
            k,
            ..Default::default()
        }
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn lambda(mut self, lambda: f32) -> Self {
        self.lambda = Some(lambda);
        self
    }

    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }
}

/// Ranked memories plus what went missing on the way
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub memories: Vec<RetrievedMemory>,
    /// Facets whose search failed or timed out
    pub degraded_facets: Vec<String>,
    /// Set when the deadline or a failed branch cut the candidate pool short
    pub partial: bool,
}

/// Query-time knobs taken from configuration
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub top_k_per_facet: usize,
    pub traversal_depth: usize,
    pub distance_decay: f32,
    pub graph_fanout: usize,
    pub mmr_lambda: f32,
    pub query_deadline: Duration,
}

impl RetrievalSettings {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            top_k_per_facet: config.top_k_per_facet,
            traversal_depth: config.traversal_depth,
            distance_decay: config.distance_decay,
            graph_fanout: config.graph_fanout.max(1),
            mmr_lambda: config.mmr_lambda,
            query_deadline: config.query_deadline(),
        }
    }
}

/// Candidate pool keeping first-seen order for tie-breaking
#[derive(Default)]
struct CandidatePool {
    order: Vec<NodeId>,
    entries: HashMap<NodeId, RetrievedMemory>,
}

impl CandidatePool {
    fn offer(&mut self, node: MemoryNode, relevance: f32, source: CandidateSource, distance: usize) {
        match self.entries.get_mut(&node.id) {
            Some(existing) => {
                if relevance > existing.relevance {
                    existing.relevance = relevance;
                    existing.source = source;
                    existing.distance = distance;
                }
            }
            None => {
                self.order.push(node.id);
                self.entries.insert(
                    node.id,
                    RetrievedMemory {
                        node,
                        relevance,
                        score: 0.0,
                        source,
                        distance,
                    },
                );
            }
        }
    }

    fn raise(&mut self, id: &NodeId, relevance: f32, distance: usize) -> bool {
        match self.entries.get_mut(id) {
            Some(existing) => {
                if relevance > existing.relevance {
                    existing.relevance = relevance;
                    existing.source = CandidateSource::Graph;
                    existing.distance = distance;
                }
                true
            }
            None => false,
        }
    }

    fn seeds(&self) -> Vec<(NodeId, f32)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|c| (*id, c.relevance)))
            .collect()
    }

    fn into_scored(mut self) -> Vec<RetrievedMemory> {
        self.order
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|mut c| {
                c.score = c.relevance * c.node.importance;
                c
            })
            .collect()
    }
}

/// Runs the two-phase retrieve
pub struct RetrievalOrchestrator {
    graph: Arc<GraphStore>,
    vectors: Arc<VectorIndex>,
    scorer: Arc<ImportanceScorer>,
    clock: Arc<dyn Clock>,
    settings: RetrievalSettings,
}

impl RetrievalOrchestrator {
    pub fn new(
        graph: Arc<GraphStore>,
        vectors: Arc<VectorIndex>,
        scorer: Arc<ImportanceScorer>,
        clock: Arc<dyn Clock>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            graph,
            vectors,
            scorer,
            clock,
            settings,
        }
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        if request.facets.is_empty() {
            return Err(MemoryError::validation("query needs at least one facet"));
        }
        self.vectors.validate(&request.facets)?;
        let lambda = request.lambda.unwrap_or(self.settings.mmr_lambda);
        if !(0.0..=1.0).contains(&lambda) {
            return Err(MemoryError::validation(format!(
                "lambda must be in [0, 1], got {}",
                lambda
            )));
        }
        if request.k == 0 {
            return Ok(QueryResult::default());
        }

        let budget = request
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.query_deadline);
        let deadline = Instant::now() + budget;
        let depth = request.depth.unwrap_or(self.settings.traversal_depth);
        let mut result = QueryResult::default();

        let semantic = self.semantic_phase(request, deadline, budget, &mut result).await?;

        let mut pool = CandidatePool::default();
        for (node, similarity) in self.hydrate(semantic, deadline, &mut result).await {
            pool.offer(node, similarity, CandidateSource::Semantic, 0);
        }

        if depth > 0 {
            self.graph_phase(
                &mut pool,
                depth,
                request.relation.as_deref(),
                deadline,
                &mut result,
            )
            .await;
        }

        let candidates = pool.into_scored();
        log::debug!(
            "Query pool: {} candidates, {} degraded facets",
            candidates.len(),
            result.degraded_facets.len()
        );

        let selected = MmrSelector::new(lambda).select(candidates, request.k);
        result.memories = self.reinforce(selected).await;
        Ok(result)
    }

    /// Best similarity per node across facets, most similar first
    async fn semantic_phase(
        &self,
        request: &QueryRequest,
        deadline: Instant,
        budget: Duration,
        result: &mut QueryResult,
    ) -> Result<Vec<(NodeId, f32)>> {
        let k1 = self.settings.top_k_per_facet.max(request.k);
        let searches = request.facets.iter().map(|(facet, query)| async move {
            let outcome = timeout_at(deadline, self.vectors.search(facet, query, k1)).await;
            (facet, outcome)
        });

        let mut best: HashMap<NodeId, f32> = HashMap::new();
        let mut last_error = None;
        for (facet, outcome) in futures::future::join_all(searches).await {
            match outcome {
                Ok(Ok(hits)) => {
                    for (id, similarity) in hits {
                        let entry = best.entry(id).or_insert(similarity);
                        *entry = entry.max(similarity);
                    }
                }
                Ok(Err(e)) => {
                    log::warn!("Facet '{}' search failed: {}", facet, e);
                    result.degraded_facets.push(facet.clone());
                    last_error = Some(e);
                }
                Err(_) => {
                    log::warn!("Facet '{}' search timed out", facet);
                    result.degraded_facets.push(facet.clone());
                    last_error = Some(MemoryError::Timeout {
                        duration_ms: budget.as_millis() as u64,
                    });
                }
            }
        }

        if result.degraded_facets.len() == request.facets.len() {
            return Err(last_error
                .unwrap_or_else(|| MemoryError::unavailable("every facet search failed")));
        }

        let mut ranked: Vec<(NodeId, f32)> = best.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(ranked)
    }

    /// Fetch nodes for ids, preserving order. Unknown and quarantined nodes are dropped.
    async fn hydrate(
        &self,
        ids: Vec<(NodeId, f32)>,
        deadline: Instant,
        result: &mut QueryResult,
    ) -> Vec<(MemoryNode, f32)> {
        let fetched: Vec<_> = stream::iter(ids)
            .map(|(id, relevance)| async move {
                let outcome = timeout_at(deadline, self.graph.get(&id)).await;
                (id, relevance, outcome)
            })
            .buffered(self.settings.graph_fanout)
            .collect()
            .await;

        let mut nodes = Vec::with_capacity(fetched.len());
        for (id, relevance, outcome) in fetched {
            match outcome {
                Ok(Ok(Some(node))) if !node.quarantined => nodes.push((node, relevance)),
                Ok(Ok(Some(_))) => log::debug!("Skipping quarantined node {}", id),
                Ok(Ok(None)) => log::debug!("Dropping vector hit for unknown node {}", id),
                Ok(Err(e)) => {
                    log::warn!("Could not load node {}: {}", id, e);
                    result.partial = true;
                }
                Err(_) => result.partial = true,
            }
        }
        nodes
    }

    async fn graph_phase(
        &self,
        pool: &mut CandidatePool,
        depth: usize,
        relation: Option<&str>,
        deadline: Instant,
        result: &mut QueryResult,
    ) {
        let seeds = pool.seeds();
        let mut expansions: Vec<_> = stream::iter(seeds.into_iter().enumerate())
            .map(|(position, (seed, relevance))| async move {
                let outcome = timeout_at(deadline, self.graph.neighbors(&seed, relation, depth)).await;
                (position, seed, relevance, outcome)
            })
            .buffer_unordered(self.settings.graph_fanout)
            .collect()
            .await;
        expansions.sort_by_key(|(position, ..)| *position);

        let gamma = self.settings.distance_decay;
        let mut discovered: Vec<(NodeId, f32, usize)> = Vec::new();
        let mut index: HashMap<NodeId, usize> = HashMap::new();
        for (_, seed, seed_relevance, outcome) in expansions {
            let neighbors = match outcome {
                Ok(Ok(neighbors)) => neighbors,
                Ok(Err(e)) => {
                    log::warn!("Expansion from {} failed: {}", seed, e);
                    result.partial = true;
                    continue;
                }
                Err(_) => {
                    result.partial = true;
                    continue;
                }
            };
            for neighbor in neighbors {
                let relevance =
                    seed_relevance * neighbor.path_weight * gamma.powi(neighbor.hop as i32);
                if pool.raise(&neighbor.id, relevance, neighbor.hop) {
                    continue;
                }
                match index.get(&neighbor.id) {
                    Some(&i) => {
                        if relevance > discovered[i].1 {
                            discovered[i] = (neighbor.id, relevance, neighbor.hop);
                        }
                    }
                    None => {
                        index.insert(neighbor.id, discovered.len());
                        discovered.push((neighbor.id, relevance, neighbor.hop));
                    }
                }
            }
        }

        let hops: HashMap<NodeId, usize> = discovered.iter().map(|(id, _, hop)| (*id, *hop)).collect();
        let ids = discovered.into_iter().map(|(id, rel, _)| (id, rel)).collect();
        for (node, relevance) in self.hydrate(ids, deadline, result).await {
            let hop = hops.get(&node.id).copied().unwrap_or(1);
            pool.offer(node, relevance, CandidateSource::Graph, hop);
        }
    }

    /// Record the access on every selected node. Failures keep the unreinforced copy.
    async fn reinforce(&self, selected: Vec<RetrievedMemory>) -> Vec<RetrievedMemory> {
        let now = self.clock.now();
        let ctx = self.graph.scoring_context(now);
        let updates = selected.into_iter().map(|mut hit| async move {
            let id = hit.node.id;
            let degree = self.graph.weighted_degree(&id);
            let outcome = self
                .graph
                .update(&id, |node| {
                    node.record_access(now);
                    node.importance = self.scorer.reinforce(node, degree, &ctx);
                    true
                })
                .await;
            match outcome {
                Ok(Some(node)) => hit.node = node,
                Ok(None) => log::debug!("Node {} vanished before reinforcement", id),
                Err(e) => log::warn!("Could not reinforce {}: {}", id, e),
            }
            hit
        });
        futures::future::join_all(updates).await
    }
}
