//! Incremental SIMILAR_TO edges for newly inserted insights.
//!
//! Each insert links the new node to its nearest same-cluster neighbors above the edge
//! threshold, then trims every touched node back to the per-node cap, weakest edge first.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atlas_common::{GraphSettings, SimilarityEdge};

use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use crate::store::{AtlasStore, StoreError};

pub struct SimilarityGraphBuilder {
    store: Arc<dyn AtlasStore>,
    settings: GraphSettings,
    retry: RetryPolicy,
    locks: KeyedLocks<Uuid>,
}

impl SimilarityGraphBuilder {
    pub fn new(store: Arc<dyn AtlasStore>, settings: GraphSettings) -> Self {
        Self {
            retry: RetryPolicy::from_settings(&settings),
            store,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// Create edges for `new_id` and enforce the cap on every touched node.
    ///
    /// Returns the new node's edges that survived pruning. Never fails: a failed
    /// neighbor query leaves the node with no edges and is only logged.
    pub async fn upsert_edges(
        &self,
        new_id: Uuid,
        cluster_id: &str,
        vector: &[f32],
    ) -> Vec<SimilarityEdge> {
        let candidates = match self
            .store
            .query_knn(vector, cluster_id, self.settings.edge_candidates, Some(new_id))
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(insight_id = %new_id, cluster_id, error = %e, "Neighbor query failed, node keeps zero edges");
                return Vec::new();
            }
        };

        let survivors: Vec<_> = candidates
            .into_iter()
            .filter(|n| {
                n.insight.id != new_id
                    && n.insight.cluster_id == cluster_id
                    && n.similarity >= self.settings.edge_similarity_threshold
            })
            .collect();
        if survivors.is_empty() {
            return Vec::new();
        }

        let mut touched: Vec<Uuid> = survivors.iter().map(|n| n.insight.id).collect();
        touched.push(new_id);
        let mut held = touched.clone();
        let mut guards = self.locks.lock_many(&held).await;

        let now = Utc::now();
        let mut created = Vec::with_capacity(survivors.len());
        for neighbor in &survivors {
            let edge = SimilarityEdge::new(new_id, neighbor.insight.id, neighbor.similarity, now);
            match self.insert_with_retry(&edge).await {
                Ok(()) => created.push(edge),
                Err(e) => warn!(
                    src = %edge.src,
                    dst = %edge.dst,
                    error = %e,
                    "Edge insert failed, skipping"
                ),
            }
        }

        // Evicting an edge changes both endpoints, so the far end of every edge about to
        // go must be held as well. Widen the lock set and re-plan until it is.
        let mut released = false;
        loop {
            let missing = self.unheld_far_ends(&touched, &held).await;
            if missing.is_empty() {
                break;
            }
            debug!(insight_id = %new_id, extra = missing.len(), "Widening lock set for pruning");
            held.extend(missing);
            released = true;
            drop(guards);
            guards = self.locks.lock_many(&held).await;
        }

        let mut evicted: HashSet<(Uuid, Uuid)> = HashSet::new();
        for node in &touched {
            match self.prune_node(*node).await {
                Ok(keys) => evicted.extend(keys),
                Err(e) => warn!(insight_id = %node, error = %e, "Edge pruning failed"),
            }
        }
        created.retain(|e| !evicted.contains(&e.key()));
        // Another writer may have pruned one of ours while the locks were down.
        if released {
            match self.store.edges_for_node(new_id).await {
                Ok(live) => {
                    let live: HashSet<_> = live.iter().map(SimilarityEdge::key).collect();
                    created.retain(|e| live.contains(&e.key()));
                }
                Err(e) => warn!(insight_id = %new_id, error = %e, "Edge re-read failed"),
            }
        }
        drop(guards);

        info!(
            insight_id = %new_id,
            cluster_id,
            edges = created.len(),
            evicted = evicted.len(),
            "Similarity edges built"
        );
        created
    }

    async fn insert_with_retry(&self, edge: &SimilarityEdge) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.insert_edge(edge).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    self.retry.wait(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Opposite endpoints of the edges pruning would evict right now that are not in `held`.
    /// A failed read is skipped here; `prune_node` reports it.
    async fn unheld_far_ends(&self, touched: &[Uuid], held: &[Uuid]) -> Vec<Uuid> {
        let mut missing = Vec::new();
        for node in touched {
            let Ok(edges) = self.store.edges_for_node(*node).await else {
                continue;
            };
            missing.extend(
                victims(*node, edges, self.settings.max_edges_per_node)
                    .iter()
                    .filter_map(|e| e.other(*node))
                    .filter(|far| !held.contains(far)),
            );
        }
        missing.sort();
        missing.dedup();
        missing
    }

    /// Trim `node` down to the cap. Returns the keys of the evicted edges.
    ///
    /// Callers hold the locks of `node` and of every far endpoint it would evict.
    async fn prune_node(&self, node: Uuid) -> Result<Vec<(Uuid, Uuid)>, StoreError> {
        let edges = self.store.edges_for_node(node).await?;
        let doomed = victims(node, edges, self.settings.max_edges_per_node);

        let mut evicted = Vec::with_capacity(doomed.len());
        for edge in doomed {
            self.store.delete_edge(edge.src, edge.dst).await?;
            debug!(
                insight_id = %node,
                src = %edge.src,
                dst = %edge.dst,
                weight = edge.weight,
                "Evicted weakest edge"
            );
            evicted.push(edge.key());
        }
        Ok(evicted)
    }
}

/// The edges `node` must drop to get back to `cap`.
fn victims(node: Uuid, edges: Vec<SimilarityEdge>, cap: usize) -> Vec<SimilarityEdge> {
    let excess = edges.len().saturating_sub(cap);
    if excess == 0 {
        return Vec::new();
    }
    eviction_order(node, edges).into_iter().take(excess).collect()
}

/// Edges of `node` in the order they should be evicted: lowest weight first, then
/// earliest created, then by the opposite endpoint's id.
pub fn eviction_order(node: Uuid, mut edges: Vec<SimilarityEdge>) -> Vec<SimilarityEdge> {
    edges.sort_by(|a, b| {
        a.weight
            .partial_cmp(&b.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.other(node).cmp(&b.other(node)))
    });
    edges
}
