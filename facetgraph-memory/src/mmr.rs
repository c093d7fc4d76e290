//! Maximal Marginal Relevance selection
//!
//! Greedy re-ranking that trades a candidate's score against its similarity
//! to what has already been picked:
//!
//! MMR(c) = λ · score(c) − (1 − λ) · max_{s ∈ selected} sim(c, s)
//!
//! `sim` is the mean clamped cosine similarity over the facets both nodes
//! carry, 0 when they share none.

use std::cmp::Ordering;

use crate::hnsw::clamp_similarity;
use crate::node::MemoryNode;
use crate::retrieval::RetrievedMemory;

/// Diversified top-k selector
#[derive(Debug, Clone, Copy)]
pub struct MmrSelector {
    lambda: f32,
}

impl MmrSelector {
    /// `lambda` is clamped to [0, 1]; 1 ranks purely by score
    pub fn new(lambda: f32) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
        }
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// Pick up to `k` candidates in selection order
    pub fn select(&self, candidates: Vec<RetrievedMemory>, k: usize) -> Vec<RetrievedMemory> {
        let k = k.min(candidates.len());
        if k == 0 {
            return Vec::new();
        }

        let mut remaining: Vec<usize> = (0..candidates.len()).collect();
        // Highest similarity of each candidate to anything selected so far
        let mut max_sim = vec![0.0f32; candidates.len()];
        let mut order = Vec::with_capacity(k);

        // First pick: highest score regardless of lambda
        let first = pick(&remaining, &candidates, |i| candidates[i].score);
        order.push(first);
        remaining.retain(|&i| i != first);

        while order.len() < k {
            let last = &candidates[order[order.len() - 1]].node;
            for &i in &remaining {
                max_sim[i] = max_sim[i].max(facet_similarity(&candidates[i].node, last));
            }
            let best = pick(&remaining, &candidates, |i| {
                self.lambda * candidates[i].score - (1.0 - self.lambda) * max_sim[i]
            });
            order.push(best);
            remaining.retain(|&i| i != best);
        }

        let mut slots: Vec<Option<RetrievedMemory>> = candidates.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect()
    }
}

/// Argmax of `value` over `remaining`; ties go to higher importance, then more
/// recent access, then earlier position
fn pick<F>(remaining: &[usize], candidates: &[RetrievedMemory], value: F) -> usize
where
    F: Fn(usize) -> f32,
{
    let mut best = remaining[0];
    let mut best_value = value(best);
    for &i in &remaining[1..] {
        let v = value(i);
        if prefer(i, v, best, best_value, candidates) {
            best = i;
            best_value = v;
        }
    }
    best
}

fn prefer(
    i: usize,
    value: f32,
    current: usize,
    current_value: f32,
    candidates: &[RetrievedMemory],
) -> bool {
    let a = &candidates[i].node;
    let b = &candidates[current].node;
    value
        .partial_cmp(&current_value)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            a.importance
                .partial_cmp(&b.importance)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.last_accessed.cmp(&b.last_accessed))
        .then_with(|| current.cmp(&i))
        == Ordering::Greater
}

/// Mean clamped cosine similarity over shared facets
pub fn facet_similarity(a: &MemoryNode, b: &MemoryNode) -> f32 {
    let mut total = 0.0;
    let mut shared = 0;
    for facet in a.shared_facets(b) {
        if let (Some(va), Some(vb)) = (a.facets.get(facet), b.facets.get(facet)) {
            total += clamp_similarity(va, vb);
            shared += 1;
        }
    }
    if shared == 0 {
        0.0
    } else {
        total / shared as f32
    }
}
