use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use facetgraph_memory::{
    EdgeSpec, FacetVectors, IngestRequest, MemoryAdapter, MemoryConfig, MemoryEngine, NodeId,
    QueryRequest, ScorerConfig, ScorerWeights, SystemClock,
};
use tokio::runtime::Runtime;

const DIM: usize = 64;

fn config() -> MemoryConfig {
    MemoryConfig::new(
        BTreeMap::from([("topic".to_string(), DIM), ("style".to_string(), DIM)]),
        ScorerConfig {
            weights: ScorerWeights {
                recency: 0.5,
                usage: 0.3,
                centrality: 0.2,
            },
            recency_half_life_secs: 86_400,
        },
    )
}

/// Deterministic pseudo-random unit vector
fn vector(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut v: Vec<f32> = (0..DIM)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((state >> 33) as f32 / u32::MAX as f32) - 0.25
        })
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

fn facets(seed: u64) -> FacetVectors {
    BTreeMap::from([
        ("topic".to_string(), vector(seed)),
        ("style".to_string(), vector(seed ^ 0xdead_beef)),
    ])
}

async fn populated(size: u64) -> (MemoryEngine, Vec<NodeId>) {
    let engine = MemoryEngine::with_adapters(
        config(),
        Arc::new(MemoryAdapter::new(256)),
        Arc::new(MemoryAdapter::new(256)),
        Arc::new(SystemClock),
    )
    .await
    .expect("engine");
    let mut ids: Vec<NodeId> = Vec::with_capacity(size as usize);
    for seed in 0..size {
        let mut request = IngestRequest::new(format!("memory {}", seed), facets(seed));
        if let Some(previous) = ids.last() {
            request = request.edge(EdgeSpec::from(*previous, "follows", 0.5));
        }
        ids.push(engine.ingest(request).await.expect("ingest"));
    }
    (engine, ids)
}

fn bench_ingest(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let (engine, _) = runtime.block_on(populated(500));
    let mut seed = 10_000u64;

    c.bench_function("ingest_two_facets", |b| {
        b.to_async(&runtime).iter(|| {
            seed += 1;
            let request = IngestRequest::new("bench", facets(seed));
            let engine = &engine;
            async move { black_box(engine.ingest(request).await.expect("ingest")) }
        })
    });
}

fn bench_query(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("query");

    // Below and above the exact-search threshold
    for size in [200u64, 2_000] {
        let (engine, _) = runtime.block_on(populated(size));
        for depth in [0usize, 2] {
            group.bench_with_input(
                BenchmarkId::new(format!("depth_{}", depth), size),
                &depth,
                |b, &depth| {
                    b.to_async(&runtime).iter(|| {
                        let request = QueryRequest::new(facets(7), 10).depth(depth);
                        let engine = &engine;
                        async move { black_box(engine.query(&request).await.expect("query")) }
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_ingest, bench_query);
criterion_main!(benches);
