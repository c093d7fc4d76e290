//! FacetGraph CLI
//!
//! Drives a memory engine from JSON request files. Every subcommand opens the
//! store named by `--config`, so persistent use needs a RocksDB backend.

mod input;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facetgraph_memory::{
    EmbeddingProvider, FacetVectors, HashingEmbedder, MemoryConfig, MemoryEngine, NodeId,
    SystemClock,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::input::{read_json, IngestInput, OneOrMany, QueryInput};

#[derive(Parser)]
#[command(name = "facetgraph")]
#[command(about = "Hybrid graph + multi-facet vector memory")]
#[command(version)]
struct Args {
    /// Engine configuration (JSON)
    #[arg(long, short, global = true, default_value = "facetgraph.json")]
    config: PathBuf,

    /// How `embed` facets in request files are computed
    #[arg(long, global = true, value_enum, default_value_t = Embedder::Hashing)]
    embedder: Embedder,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Embedder {
    /// Deterministic feature hashing, sized per facet from the config
    Hashing,
    /// Local BGE-Small-EN-v1.5 (384 dimensions)
    #[cfg(feature = "fastembed")]
    Fastembed,
}

#[derive(Subcommand)]
enum Command {
    /// Store one memory or a list of them
    Ingest {
        #[arg(long, short)]
        file: PathBuf,
    },
    /// Retrieve memories for a query
    Query {
        #[arg(long, short)]
        file: PathBuf,
    },
    /// Add or replace an edge between two existing memories
    Link {
        #[arg(long)]
        source: NodeId,
        #[arg(long)]
        target: NodeId,
        #[arg(long)]
        relation: String,
        #[arg(long)]
        weight: f32,
        #[arg(long)]
        undirected: bool,
    },
    /// Show one memory
    Get {
        #[arg(long)]
        id: NodeId,
    },
    /// Run one pruning sweep
    Prune {
        /// Report candidates without evicting
        #[arg(long)]
        dry_run: bool,
    },
    /// Store counters
    Stats,
    /// Re-validate a memory and clear its quarantine flag
    Repair {
        #[arg(long)]
        id: NodeId,
    },
    /// Prune periodically until Ctrl-C
    RunPruner,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facetgraph=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let engine = open_engine(&args.config, args.embedder).await?;

    match args.command {
        Command::Ingest { file } => {
            let inputs = read_json::<OneOrMany<IngestInput>>(&file)?.into_vec();
            let mut ids = Vec::with_capacity(inputs.len());
            for input in inputs {
                let embedded = embed(&engine, &input.content, &input.embed).await?;
                let id = engine
                    .ingest(input.into_request(embedded))
                    .await
                    .context("Ingest failed")?;
                ids.push(id);
            }
            tracing::info!("Ingested {} memories", ids.len());
            print_json(&ids)
        }
        Command::Query { file } => {
            let input: QueryInput = read_json(&file)?;
            let embedded = match &input.text {
                Some(text) => embed(&engine, text, &input.embed).await?,
                None => FacetVectors::new(),
            };
            let result = engine
                .query(&input.into_request(embedded))
                .await
                .context("Query failed")?;
            if !result.degraded_facets.is_empty() {
                tracing::warn!("Degraded facets: {}", result.degraded_facets.join(", "));
            }
            print_json(&result)
        }
        Command::Link {
            source,
            target,
            relation,
            weight,
            undirected,
        } => {
            let replaced = engine
                .link(source, target, relation, weight, !undirected)
                .await
                .context("Link failed")?;
            print_json(&serde_json::json!({ "replaced": replaced }))
        }
        Command::Get { id } => {
            let node = engine
                .get(&id)
                .await?
                .with_context(|| format!("No memory {}", id))?;
            print_json(&node)
        }
        Command::Prune { dry_run } => print_json(&engine.prune(dry_run).await?),
        Command::Stats => print_json(&engine.stats().await?),
        Command::Repair { id } => print_json(&engine.repair(&id).await?),
        Command::RunPruner => {
            let handle = engine.spawn_pruner();
            tracing::info!(
                "Pruning every {}s, press Ctrl-C to stop",
                engine.config().pruning_interval_secs
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            handle.shutdown().await;
            Ok(())
        }
    }
}

async fn open_engine(config_path: &Path, embedder: Embedder) -> Result<MemoryEngine> {
    let config = MemoryConfig::from_json_file(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let provider: Arc<dyn EmbeddingProvider> = match embedder {
        Embedder::Hashing => Arc::new(HashingEmbedder::new(config.facet_dimensions.clone())),
        #[cfg(feature = "fastembed")]
        Embedder::Fastembed => Arc::new(facetgraph_memory::embedding::FastEmbedProvider::new()),
    };
    let engine = MemoryEngine::open(config, Arc::new(SystemClock))
        .await
        .context("Failed to open memory engine")?;
    Ok(engine.with_embedder(provider))
}

async fn embed(engine: &MemoryEngine, text: &str, facets: &[String]) -> Result<FacetVectors> {
    if facets.is_empty() {
        return Ok(FacetVectors::new());
    }
    let (vectors, failed) = engine.embed_facets(text, facets).await?;
    if !failed.is_empty() {
        tracing::warn!("Could not embed facets: {}", failed.join(", "));
    }
    Ok(vectors)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
