//! Engine configuration
//!
//! Loaded from camelCase JSON. Scorer weights and the recency half-life have
//! no defaults and must always be supplied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Which storage technology backs a store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local concurrent maps, lost on restart
    Memory,
    /// Persistent RocksDB database at `path`
    RocksDb { path: PathBuf },
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Memory
    }
}

/// Backend selection per store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Backend owning nodes and edges
    #[serde(default)]
    pub graph: BackendKind,
    /// Default backend for facet vectors
    #[serde(default)]
    pub vectors: BackendKind,
    /// Per-facet overrides of `vectors`
    #[serde(default)]
    pub facets: BTreeMap<String, BackendKind>,
}

impl BackendConfig {
    /// Backend holding vectors for `facet`
    pub fn vector_backend_for(&self, facet: &str) -> &BackendKind {
        self.facets.get(facet).unwrap_or(&self.vectors)
    }
}

/// Relative weights of the importance signals; must sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub recency: f32,
    pub usage: f32,
    pub centrality: f32,
}

impl ScorerWeights {
    pub fn sum(&self) -> f32 {
        self.recency + self.usage + self.centrality
    }
}

/// Importance scorer parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorerConfig {
    pub weights: ScorerWeights,
    /// Idle time after which the recency signal halves
    pub recency_half_life_secs: u64,
}

/// Backoff policy for transient backend failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 25,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Configuration for the memory engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(default)]
    pub backends: BackendConfig,

    /// Soft cap on node count; exceeding it triggers an early pruning sweep
    #[serde(default)]
    pub max_memories: Option<usize>,

    /// Facet name to embedding dimensionality
    pub facet_dimensions: BTreeMap<String, usize>,

    /// Idle time after which a low-score node may be evicted
    #[serde(default = "default_pruning_ttl_secs")]
    pub pruning_ttl_secs: u64,

    /// Period of the background pruning sweep
    #[serde(default = "default_pruning_interval_secs")]
    pub pruning_interval_secs: u64,

    /// Nodes scoring below this are eviction candidates
    #[serde(default = "default_eviction_score_threshold")]
    pub eviction_score_threshold: f32,

    /// Nodes with an incident edge heavier than this are never evicted
    #[serde(default = "default_protection_edge_weight")]
    pub protection_edge_weight: f32,

    /// MMR trade-off: 1 = pure relevance, 0 = pure diversity
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,

    /// Candidates fetched per facet in the semantic phase
    #[serde(default = "default_top_k_per_facet")]
    pub top_k_per_facet: usize,

    /// Default hop limit of the graph phase
    #[serde(default = "default_traversal_depth")]
    pub traversal_depth: usize,

    /// Per-hop relevance decay (gamma)
    #[serde(default = "default_distance_decay")]
    pub distance_decay: f32,

    /// Concurrent neighbor expansions per query
    #[serde(default = "default_graph_fanout")]
    pub graph_fanout: usize,

    /// Default per-query deadline
    #[serde(default = "default_query_deadline_ms")]
    pub query_deadline_ms: u64,

    /// Facet indexes at or below this size are searched exhaustively
    #[serde(default = "default_exact_search_threshold")]
    pub exact_search_threshold: usize,

    pub scorer: ScorerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Re-read/re-apply attempts after an optimistic version conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

fn default_pruning_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_pruning_interval_secs() -> u64 {
    60 * 60
}

fn default_eviction_score_threshold() -> f32 {
    0.2
}

fn default_protection_edge_weight() -> f32 {
    0.9
}

fn default_mmr_lambda() -> f32 {
    0.7
}

fn default_top_k_per_facet() -> usize {
    20
}

fn default_traversal_depth() -> usize {
    1
}

fn default_distance_decay() -> f32 {
    0.5
}

fn default_graph_fanout() -> usize {
    8
}

fn default_query_deadline_ms() -> u64 {
    2_000
}

fn default_exact_search_threshold() -> usize {
    2_048
}

fn default_conflict_retries() -> u32 {
    5
}

impl MemoryConfig {
    /// Build a configuration with the required parts and defaults elsewhere
    pub fn new(facet_dimensions: BTreeMap<String, usize>, scorer: ScorerConfig) -> Self {
        Self {
            backends: BackendConfig::default(),
            max_memories: None,
            facet_dimensions,
            pruning_ttl_secs: default_pruning_ttl_secs(),
            pruning_interval_secs: default_pruning_interval_secs(),
            eviction_score_threshold: default_eviction_score_threshold(),
            protection_edge_weight: default_protection_edge_weight(),
            mmr_lambda: default_mmr_lambda(),
            top_k_per_facet: default_top_k_per_facet(),
            traversal_depth: default_traversal_depth(),
            distance_decay: default_distance_decay(),
            graph_fanout: default_graph_fanout(),
            query_deadline_ms: default_query_deadline_ms(),
            exact_search_threshold: default_exact_search_threshold(),
            scorer,
            retry: RetryConfig::default(),
            conflict_retries: default_conflict_retries(),
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        log::debug!("Loaded memory config from {}", path.display());
        Self::from_json_str(&raw)
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        for (facet, dim) in &self.facet_dimensions {
            if facet.is_empty() {
                return Err(MemoryError::validation("facet names must not be empty"));
            }
            if *dim == 0 {
                return Err(MemoryError::validation(format!(
                    "facet '{}' has zero dimensionality",
                    facet
                )));
            }
        }

        let weights = &self.scorer.weights;
        if weights.recency < 0.0 || weights.usage < 0.0 || weights.centrality < 0.0 {
            return Err(MemoryError::validation("scorer weights must be non-negative"));
        }
        if (weights.sum() - 1.0).abs() > 1e-3 {
            return Err(MemoryError::validation(format!(
                "scorer weights must sum to 1, got {}",
                weights.sum()
            )));
        }
        if self.scorer.recency_half_life_secs == 0 {
            return Err(MemoryError::validation("recency half-life must be positive"));
        }

        check_unit("mmrLambda", self.mmr_lambda)?;
        check_unit("evictionScoreThreshold", self.eviction_score_threshold)?;
        check_unit("protectionEdgeWeight", self.protection_edge_weight)?;
        if !(self.distance_decay > 0.0 && self.distance_decay <= 1.0) {
            return Err(MemoryError::validation(format!(
                "distanceDecay must be in (0, 1], got {}",
                self.distance_decay
            )));
        }
        if self.pruning_interval_secs == 0 {
            return Err(MemoryError::validation("pruningIntervalSecs must be positive"));
        }
        if self.top_k_per_facet == 0 {
            return Err(MemoryError::validation("topKPerFacet must be positive"));
        }
        if self.graph_fanout == 0 {
            return Err(MemoryError::validation("graphFanout must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(MemoryError::validation("retry.maxAttempts must be positive"));
        }
        if self.max_memories == Some(0) {
            return Err(MemoryError::validation("maxMemories must be positive when set"));
        }
        Ok(())
    }

    pub fn pruning_ttl(&self) -> Duration {
        Duration::from_secs(self.pruning_ttl_secs)
    }

    pub fn pruning_interval(&self) -> Duration {
        Duration::from_secs(self.pruning_interval_secs)
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.query_deadline_ms)
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MemoryError::validation(format!(
            "{} must be in [0, 1], got {}",
            name, value
        )))
    }
}
