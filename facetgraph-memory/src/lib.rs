//! FacetGraph Memory
//!
//! Hybrid graph + multi-facet vector memory for agents. Facts are stored as
//! nodes of a knowledge graph, each carrying several named embeddings
//! ("facets"), and retrieved by combining per-facet similarity search with
//! graph traversal, importance weighting and MMR diversification.
//!
//! ## Features
//!
//! - **Multi-facet vectors** - independent embedding spaces per facet, each with a fixed dimensionality
//! - **Two-phase retrieval** - semantic seeds expanded through weighted, optionally directed edges
//! - **Importance scoring** - recency, usage and centrality blended with configured weights
//! - **Staleness pruning** - background sweep evicting idle, low-value, unprotected nodes
//! - **Pluggable backends** - in-memory maps or RocksDB with an HNSW vector cache, per store or per facet
//! - **Per-node atomicity** - staged writes with rollback and quarantine across backends
//!
//! ## Example
//!
//! ```ignore
//! use facetgraph_memory::{EdgeSpec, IngestRequest, MemoryEngine, QueryRequest, SystemClock};
//!
//! let engine = MemoryEngine::open(config, Arc::new(SystemClock)).await?;
//! let cause = engine.ingest(IngestRequest::new("Disk filled up", facets_a)).await?;
//! engine
//!     .ingest(IngestRequest::new("Service crashed", facets_b).edge(EdgeSpec::from(cause, "causes", 0.8)))
//!     .await?;
//!
//! let result = engine.query(&QueryRequest::new(query, 5).depth(1).lambda(0.7)).await?;
//! let pruner = engine.spawn_pruner();
//! ```

pub mod backend;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hnsw;
pub mod mmr;
pub mod node;
pub mod pruner;
pub mod registry;
pub mod retrieval;
pub mod retry;
pub mod scorer;
pub mod staging;
pub mod temporal;
pub mod vector_index;

// Re-exports for convenience
pub use backend::{BackendAdapter, MemoryAdapter, Neighbor, RocksDbAdapter};
pub use config::{
    BackendConfig, BackendKind, MemoryConfig, RetryConfig, ScorerConfig, ScorerWeights,
};
pub use embedding::{EmbeddingProvider, FacetEmbedder, HashingEmbedder};
pub use engine::{EdgeSpec, EngineStats, IngestRequest, MemoryEngine};
pub use error::{MemoryError, Result};
pub use graph::GraphStore;
pub use mmr::MmrSelector;
pub use node::{Edge, EdgeKey, FacetVectors, MemoryNode, MemoryNodeBuilder, Metadata, NodeId};
pub use pruner::{PruneReport, Pruner, PrunerHandle};
pub use registry::VectorSpaceRegistry;
pub use retrieval::{CandidateSource, QueryRequest, QueryResult, RetrievedMemory};
pub use scorer::ImportanceScorer;
pub use temporal::{Clock, ManualClock, SystemClock};
pub use vector_index::VectorIndex;
