//! Per-facet vector index
//!
//! Vectors live in a concurrent map; searches over small facets scan
//! exhaustively, larger ones go through an instant-distance HNSW graph that
//! is rebuilt lazily after writes.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use instant_distance::{Builder, HnswMap, Point, Search};
use parking_lot::RwLock;

use crate::node::NodeId;

/// Candidate list width used while building and searching the HNSW graph
const HNSW_EF: usize = 100;

/// HNSW point wrapper for semantic search
#[derive(Clone)]
struct FacetPoint(Vec<f32>);

impl Point for FacetPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1 - similarity (HNSW finds minimum)
        1.0 - cosine_similarity(&self.0, &other.0)
    }
}

/// Vectors of one facet plus their approximate index
pub struct FacetIndex {
    vectors: DashMap<NodeId, Vec<f32>>,
    hnsw: RwLock<Option<HnswMap<FacetPoint, NodeId>>>,
    dirty: AtomicBool,
    exact_threshold: usize,
}

impl FacetIndex {
    pub fn new(exact_threshold: usize) -> Self {
        Self {
            vectors: DashMap::new(),
            hnsw: RwLock::new(None),
            dirty: AtomicBool::new(false),
            exact_threshold,
        }
    }

    pub fn insert(&self, id: NodeId, vector: Vec<f32>) -> Option<Vec<f32>> {
        let previous = self.vectors.insert(id, vector);
        self.dirty.store(true, Ordering::Release);
        previous
    }

    pub fn remove(&self, id: &NodeId) -> Option<Vec<f32>> {
        let removed = self.vectors.remove(id).map(|(_, v)| v);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    pub fn get(&self, id: &NodeId) -> Option<Vec<f32>> {
        self.vectors.get(id).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Up to `k` nearest ids by descending similarity in [0, 1]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        if k == 0 || self.vectors.is_empty() {
            return Vec::new();
        }
        if self.vectors.len() <= self.exact_threshold || k > HNSW_EF {
            return self.linear_search(query, k);
        }

        if self.dirty.load(Ordering::Acquire) || self.hnsw.read().is_none() {
            self.rebuild();
        }

        let guard = self.hnsw.read();
        let index = match guard.as_ref() {
            Some(index) => index,
            None => return self.linear_search(query, k),
        };

        let query_point = FacetPoint(query.to_vec());
        let mut search = Search::default();
        let mut results = Vec::with_capacity(k);
        for item in index.search(&query_point, &mut search) {
            // Entries removed since the last rebuild are skipped
            if let Some(vector) = self.vectors.get(item.value) {
                results.push((*item.value, clamp_similarity(query, vector.value())));
            }
            if results.len() >= k {
                break;
            }
        }
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results
    }

    /// Exhaustive fallback
    fn linear_search(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        let mut results: Vec<(NodeId, f32)> = self
            .vectors
            .iter()
            .map(|entry| (*entry.key(), clamp_similarity(query, entry.value())))
            .collect();

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(k);
        results
    }

    /// Rebuild the HNSW graph from the current vectors
    fn rebuild(&self) {
        let mut guard = self.hnsw.write();
        if !self.dirty.swap(false, Ordering::AcqRel) && guard.is_some() {
            return;
        }

        let (ids, points): (Vec<NodeId>, Vec<FacetPoint>) = self
            .vectors
            .iter()
            .map(|entry| (*entry.key(), FacetPoint(entry.value().clone())))
            .unzip();

        if points.is_empty() {
            *guard = None;
            return;
        }

        log::debug!("Rebuilding HNSW index over {} vectors", points.len());
        let hnsw = Builder::default()
            .ef_construction(HNSW_EF)
            .ef_search(HNSW_EF)
            .build(points, ids);
        *guard = Some(hnsw);
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Cosine similarity normalized to [0, 1]; opposed vectors count as unrelated
pub fn clamp_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_opposite_is_clamped() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 0.001);
        assert_eq!(clamp_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_linear_search_orders_by_similarity() {
        let index = FacetIndex::new(1024);
        let near = NodeId::new();
        let mid = NodeId::new();
        let far = NodeId::new();
        index.insert(near, vec![1.0, 0.0]);
        index.insert(mid, vec![1.0, 1.0]);
        index.insert(far, vec![0.0, 1.0]);

        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, near);
        assert_eq!(hits[1].0, mid);
        assert!(hits[0].1 >= hits[1].1);
    }

    #[test]
    fn test_hnsw_search_finds_exact_match() {
        // Threshold 0 forces the HNSW path
        let index = FacetIndex::new(0);
        let mut target = None;
        for i in 0..200 {
            let angle = i as f32 * 0.03;
            let id = NodeId::new();
            if i == 57 {
                target = Some(id);
            }
            index.insert(id, vec![angle.cos(), angle.sin(), 0.1]);
        }
        let target = target.unwrap();
        let angle = 57.0_f32 * 0.03;
        let hits = index.search(&[angle.cos(), angle.sin(), 0.1], 5);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, target);
        assert!(hits[0].1 > 0.999);
    }

    #[test]
    fn test_removed_vectors_not_returned() {
        let index = FacetIndex::new(0);
        let ids: Vec<NodeId> = (0..20).map(|_| NodeId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            index.insert(*id, vec![1.0, i as f32 * 0.01]);
        }
        index.search(&[1.0, 0.0], 3);
        index.remove(&ids[0]);
        let hits = index.search(&[1.0, 0.0], 20);
        assert!(hits.iter().all(|(id, _)| *id != ids[0]));
        assert_eq!(index.len(), 19);
    }
}
