//! Importance scoring
//!
//! A node's importance blends three signals, each normalized to [0, 1]:
//! recency of access (exponential half-life), usage (log-scaled access
//! count) and centrality (weighted degree relative to the best connected
//! node). Reinforcement may only raise a stored score and decay may only
//! lower it.

use chrono::{DateTime, Utc};

use crate::config::{ScorerConfig, ScorerWeights};
use crate::node::MemoryNode;

/// Graph-wide maxima the signals are normalized against, captured once per
/// operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringContext {
    pub now: DateTime<Utc>,
    pub max_access_count: u64,
    pub max_weighted_degree: f32,
}

/// Computes and refreshes node importance
#[derive(Debug, Clone)]
pub struct ImportanceScorer {
    weights: ScorerWeights,
    half_life_secs: f64,
}

impl ImportanceScorer {
    pub fn new(config: &ScorerConfig) -> Self {
        Self {
            weights: config.weights,
            half_life_secs: config.recency_half_life_secs as f64,
        }
    }

    /// 0.5 ^ (idle / half-life)
    pub fn recency(&self, node: &MemoryNode, now: DateTime<Utc>) -> f32 {
        if self.half_life_secs <= 0.0 {
            return 0.0;
        }
        let idle = node.idle_for(now).num_milliseconds() as f64 / 1000.0;
        0.5f64.powf(idle / self.half_life_secs) as f32
    }

    /// ln(1 + count) / ln(1 + max count)
    pub fn usage(&self, access_count: u64, max_access_count: u64) -> f32 {
        let max = max_access_count.max(access_count);
        if max == 0 {
            return 0.0;
        }
        ((1.0 + access_count as f64).ln() / (1.0 + max as f64).ln()) as f32
    }

    /// weighted degree / max weighted degree
    pub fn centrality(&self, weighted_degree: f32, max_weighted_degree: f32) -> f32 {
        let max = max_weighted_degree.max(weighted_degree);
        if max <= 0.0 {
            return 0.0;
        }
        (weighted_degree / max).clamp(0.0, 1.0)
    }

    /// Weighted blend of the three signals, in [0, 1]
    pub fn score(&self, node: &MemoryNode, weighted_degree: f32, ctx: &ScoringContext) -> f32 {
        let total = self.weights.sum();
        if total <= 0.0 {
            return 0.0;
        }
        let blended = self.weights.recency * self.recency(node, ctx.now)
            + self.weights.usage * self.usage(node.access_count, ctx.max_access_count)
            + self.weights.centrality * self.centrality(weighted_degree, ctx.max_weighted_degree);
        (blended / total).clamp(0.0, 1.0)
    }

    /// Score after an access; never below the stored score
    pub fn reinforce(&self, node: &MemoryNode, weighted_degree: f32, ctx: &ScoringContext) -> f32 {
        node.importance.max(self.score(node, weighted_degree, ctx))
    }

    /// Score after a sweep; never above the stored score
    pub fn decay(&self, node: &MemoryNode, weighted_degree: f32, ctx: &ScoringContext) -> f32 {
        node.importance.min(self.score(node, weighted_degree, ctx))
    }
}
