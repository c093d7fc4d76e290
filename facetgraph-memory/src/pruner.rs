//! Staleness-driven eviction
//!
//! A sweep decays every node's importance (never raising it) and evicts nodes
//! that are idle past the TTL, score below the threshold and carry no strong
//! edge. Eviction removes vectors, incident edges and the node as one staged
//! write and is abandoned if the node changed since the sweep read it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::GraphStore;
use crate::node::{MemoryNode, NodeId};
use crate::scorer::{ImportanceScorer, ScoringContext};
use crate::staging::StagedWrite;
use crate::temporal::{to_chrono, Clock};
use crate::vector_index::VectorIndex;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub dry_run: bool,
    /// Nodes that met every eviction condition
    pub candidates: Vec<NodeId>,
    /// Nodes actually removed (empty on dry runs)
    pub evicted: Vec<NodeId>,
    /// Nodes whose lowered importance was written (zero on dry runs)
    pub decayed: usize,
    /// Nodes left alone because they changed during the sweep
    pub skipped: usize,
    /// Nodes whose processing failed
    pub errors: usize,
    /// False when the deadline stopped the sweep early
    pub complete: bool,
}

/// Eviction thresholds taken from configuration
#[derive(Debug, Clone)]
pub struct PruneSettings {
    pub ttl: Duration,
    pub score_threshold: f32,
    pub protection_edge_weight: f32,
    pub interval: Duration,
}

impl PruneSettings {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            ttl: config.pruning_ttl(),
            score_threshold: config.eviction_score_threshold,
            protection_edge_weight: config.protection_edge_weight,
            interval: config.pruning_interval(),
        }
    }
}

enum Verdict {
    Keep,
    Skip,
    Evict(MemoryNode),
}

pub struct Pruner {
    graph: Arc<GraphStore>,
    vectors: Arc<VectorIndex>,
    scorer: Arc<ImportanceScorer>,
    clock: Arc<dyn Clock>,
    settings: PruneSettings,
}

impl Pruner {
    pub fn new(
        graph: Arc<GraphStore>,
        vectors: Arc<VectorIndex>,
        scorer: Arc<ImportanceScorer>,
        clock: Arc<dyn Clock>,
        settings: PruneSettings,
    ) -> Self {
        Self {
            graph,
            vectors,
            scorer,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &PruneSettings {
        &self.settings
    }

    /// Run one sweep. Nodes not reached before `deadline` wait for the next one.
    pub async fn sweep(&self, dry_run: bool, deadline: Option<Instant>) -> Result<PruneReport> {
        let started = self.clock.now();
        let ctx = self.graph.scoring_context(started);
        let ids = self.graph.list_node_ids().await?;
        let mut report = PruneReport {
            dry_run,
            complete: true,
            ..Default::default()
        };

        for id in ids {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.complete = false;
                break;
            }
            match self.judge(&id, &ctx, dry_run, &mut report).await {
                Ok(Verdict::Keep) => {}
                Ok(Verdict::Skip) => report.skipped += 1,
                Ok(Verdict::Evict(node)) => {
                    report.candidates.push(id);
                    if dry_run {
                        continue;
                    }
                    match self.evict(&node, &ctx).await {
                        Ok(true) => report.evicted.push(id),
                        Ok(false) => report.skipped += 1,
                        Err(e) => {
                            log::warn!("Could not evict {}: {}", id, e);
                            report.errors += 1;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Pruner skipped {}: {}", id, e);
                    report.errors += 1;
                }
            }
        }

        log::info!(
            "Prune sweep{}: {} candidates, {} evicted, {} decayed, {} skipped, {} errors{}",
            if dry_run { " (dry run)" } else { "" },
            report.candidates.len(),
            report.evicted.len(),
            report.decayed,
            report.skipped,
            report.errors,
            if report.complete { "" } else { ", stopped at deadline" }
        );
        Ok(report)
    }

    /// Decay the node's score and decide whether it goes
    async fn judge(
        &self,
        id: &NodeId,
        ctx: &ScoringContext,
        dry_run: bool,
        report: &mut PruneReport,
    ) -> Result<Verdict> {
        let Some(mut node) = self.graph.get(id).await? else {
            return Ok(Verdict::Keep);
        };
        if node.quarantined {
            return Ok(Verdict::Keep);
        }
        if node.last_accessed > ctx.now {
            return Ok(Verdict::Skip);
        }

        let degree = self.graph.weighted_degree(id);
        let decayed = self.scorer.decay(&node, degree, ctx);
        if decayed < node.importance {
            if !dry_run {
                let expected = node.version;
                let mut updated = node.clone();
                updated.importance = decayed;
                match self.graph.put_if_version(&updated, expected).await {
                    Ok(version) => {
                        updated.version = version;
                        node = updated;
                        report.decayed += 1;
                    }
                    // Reinforced since we read it
                    Err(e) if e.is_conflict() => return Ok(Verdict::Skip),
                    Err(e) => return Err(e),
                }
            }
        }

        let idle = node.idle_for(ctx.now);
        if idle <= to_chrono(self.settings.ttl) || decayed >= self.settings.score_threshold {
            return Ok(Verdict::Keep);
        }
        let protected = self
            .graph
            .edges_of(id)
            .await?
            .iter()
            .any(|e| e.weight > self.settings.protection_edge_weight);
        if protected {
            return Ok(Verdict::Keep);
        }
        Ok(Verdict::Evict(node))
    }

    /// Remove vectors, edges and node atomically. Returns false when the node
    /// changed since it was judged.
    async fn evict(&self, judged: &MemoryNode, ctx: &ScoringContext) -> Result<bool> {
        let current = match self.graph.get(&judged.id).await? {
            Some(node) => node,
            None => return Ok(false),
        };
        if current.version != judged.version || current.last_accessed > ctx.now {
            log::debug!("Node {} changed during sweep, keeping it", judged.id);
            return Ok(false);
        }

        let touched = self.graph.edges_of(&judged.id).await?;
        let mut staged = StagedWrite::new(judged.id);
        let outcome = match self.stage_eviction(&mut staged, &current).await {
            Ok(()) => self.graph.settle(staged, Ok(true)).await,
            // Lost the race on the final version check: undo and keep the node
            Err(e) if e.is_conflict() => match staged.rollback(self.graph.retry_config()).await {
                Ok(()) => Ok(false),
                Err(rollback_error) => {
                    let quarantined = self.graph.set_quarantine(&judged.id, true).await.is_ok();
                    Err(MemoryError::partial_write(
                        judged.id.to_string(),
                        format!("eviction raced a writer; rollback failed: {}", rollback_error),
                        quarantined,
                    ))
                }
            },
            Err(e) => self.graph.settle(staged, Err(e)).await,
        };
        self.graph.refresh_edges(judged.id, &touched).await;
        if let Ok(true) = outcome {
            log::debug!("Evicted {}", judged.id);
        }
        outcome
    }

    async fn stage_eviction(&self, staged: &mut StagedWrite, node: &MemoryNode) -> Result<()> {
        for facet in node.facets.keys() {
            self.vectors.stage_remove(staged, facet, &node.id).await?;
        }
        self.graph
            .stage_remove(staged, &node.id, Some(node.version))
            .await?;
        Ok(())
    }
}

/// Handle to the background pruning task
pub struct PrunerHandle {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PrunerHandle {
    /// Start sweeping every `interval`, and whenever `trigger` is notified
    pub fn spawn(pruner: Arc<Pruner>, trigger: Arc<Notify>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = pruner.settings().interval;
        let notify = trigger.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("Background pruner started (interval {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {
                        log::debug!("Pruner triggered");
                    }
                    _ = shutdown_rx.changed() => break,
                }
                // One interval per sweep; leftovers roll over to the next
                let deadline = Instant::now() + interval;
                if let Err(e) = pruner.sweep(false, Some(deadline)).await {
                    log::error!("Prune sweep failed: {}", e);
                }
            }
            log::info!("Background pruner stopped");
        });

        Self {
            trigger,
            shutdown,
            task,
        }
    }

    /// Request an immediate sweep
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the task and wait for the current sweep to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("Pruner task ended abnormally: {}", e);
        }
    }
}
