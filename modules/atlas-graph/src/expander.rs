//! Bounded breadth-first neighborhood expansion over the similarity graph.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use atlas_common::{AtlasError, GraphSettings, InsightNode, SimilarityEdge, Subgraph};

use crate::store::{AtlasStore, StoreError};

pub const MIN_DEPTH: usize = 1;
pub const MAX_DEPTH: usize = 3;
pub const MIN_BUDGET: usize = 10;
pub const MAX_BUDGET: usize = 500;

pub struct NeighborhoodExpander {
    store: Arc<dyn AtlasStore>,
    deadline: Duration,
}

/// Nodes reached by traversal, in admission order.
struct Traversal {
    admitted: Vec<Uuid>,
    truncated: bool,
}

impl NeighborhoodExpander {
    pub fn new(store: Arc<dyn AtlasStore>, settings: &GraphSettings) -> Self {
        Self {
            store,
            deadline: settings.expand_deadline,
        }
    }

    /// Induced subgraph around `root` (or the most recent insights when `root` is `None`).
    ///
    /// Returns a partial result with `truncated = true` rather than failing when the
    /// deadline runs out.
    pub async fn expand(
        &self,
        root: Option<Uuid>,
        depth: usize,
        budget: usize,
    ) -> Result<Subgraph, AtlasError> {
        validate_bounds(depth, budget)?;
        let deadline = Instant::now() + self.deadline;

        let (nodes, truncated) = match root {
            None => {
                let recent = match timeout_at(deadline, self.store.recent_insights(budget)).await {
                    Ok(r) => r?,
                    Err(_) => return Err(AtlasError::Timeout("recent insights".into())),
                };
                (recent, false)
            }
            Some(root_id) => {
                let root_node = match timeout_at(deadline, self.store.get_insight(root_id)).await {
                    Ok(r) => r?,
                    Err(_) => return Err(AtlasError::Timeout(format!("insight {root_id}"))),
                };
                if root_node.is_none() {
                    return Err(AtlasError::NotFound(format!("insight {root_id}")));
                }
                let traversal = self.traverse(root_id, depth, budget, deadline).await?;
                let nodes = self.load_in_order(&traversal.admitted, deadline).await;
                match nodes {
                    Some(nodes) => (nodes, traversal.truncated),
                    // Out of time loading rows: fall back to the root alone.
                    None => (root_node.into_iter().collect(), true),
                }
            }
        };

        self.assemble(nodes, truncated, deadline).await
    }

    async fn traverse(
        &self,
        root: Uuid,
        depth: usize,
        budget: usize,
        deadline: Instant,
    ) -> Result<Traversal, AtlasError> {
        let mut admitted = vec![root];
        let mut seen: HashSet<Uuid> = HashSet::from([root]);
        let mut frontier = vec![root];
        let mut truncated = false;

        for level in 1..=depth {
            if frontier.is_empty() || admitted.len() >= budget {
                break;
            }

            let lookups = join_all(frontier.iter().map(|id| self.store.edges_for_node(*id)));
            let adjacency = match timeout_at(deadline, lookups).await {
                Ok(lists) => lists.into_iter().collect::<Result<Vec<_>, StoreError>>()?,
                Err(_) => {
                    info!(root = %root, level, admitted = admitted.len(), "Expansion deadline hit, returning partial graph");
                    truncated = true;
                    break;
                }
            };

            let level_nodes = rank_level(&frontier, &adjacency, &seen);
            let room = budget - admitted.len();
            if level_nodes.len() > room {
                debug!(root = %root, level, dropped = level_nodes.len() - room, "Level truncated to budget");
            }

            frontier = level_nodes.into_iter().take(room).collect();
            seen.extend(frontier.iter().copied());
            admitted.extend(frontier.iter().copied());
        }

        Ok(Traversal { admitted, truncated })
    }

    /// Fetch rows for `ids`, preserving their order. `None` if the deadline passed.
    async fn load_in_order(&self, ids: &[Uuid], deadline: Instant) -> Option<Vec<InsightNode>> {
        let rows = match timeout_at(deadline, self.store.get_insights(ids)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(_)) | Err(_) => return None,
        };
        let mut by_id: HashMap<Uuid, InsightNode> = rows.into_iter().map(|n| (n.id, n)).collect();
        Some(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Induced edges plus cluster summaries for `nodes`. Each lookup gets a short grace
    /// window past the deadline; if it still misses, the result is marked truncated.
    async fn assemble(
        &self,
        nodes: Vec<InsightNode>,
        mut truncated: bool,
        deadline: Instant,
    ) -> Result<Subgraph, AtlasError> {
        let ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
        let grace = deadline.max(Instant::now()) + self.deadline / 4;

        let mut edges = match bounded(grace, self.store.edges_among(&ids)).await {
            Some(edges) => edges?,
            None => {
                truncated = true;
                Vec::new()
            }
        };
        let members: HashSet<Uuid> = ids.iter().copied().collect();
        edges.retain(|e| members.contains(&e.src) && members.contains(&e.dst));
        sort_edges(&mut edges);

        let mut cluster_ids: Vec<String> = nodes.iter().map(|n| n.cluster_id.clone()).collect();
        cluster_ids.sort();
        cluster_ids.dedup();
        let clusters = match bounded(grace, self.store.get_clusters(&cluster_ids)).await {
            Some(clusters) => clusters?
                .into_iter()
                .map(|c| (c.id.clone(), c.summary()))
                .collect(),
            None => {
                truncated = true;
                BTreeMap::new()
            }
        };

        Ok(Subgraph {
            nodes: nodes.iter().map(InsightNode::view).collect(),
            edges,
            clusters,
            truncated,
        })
    }
}

async fn bounded<T>(until: Instant, fut: impl Future<Output = T>) -> Option<T> {
    timeout_at(until, fut).await.ok()
}

pub fn validate_bounds(depth: usize, budget: usize) -> Result<(), AtlasError> {
    if !(MIN_DEPTH..=MAX_DEPTH).contains(&depth) {
        return Err(AtlasError::Validation(format!(
            "depth must be within {MIN_DEPTH}..={MAX_DEPTH}, got {depth}"
        )));
    }
    if !(MIN_BUDGET..=MAX_BUDGET).contains(&budget) {
        return Err(AtlasError::Validation(format!(
            "budget must be within {MIN_BUDGET}..={MAX_BUDGET}, got {budget}"
        )));
    }
    Ok(())
}

/// Unseen neighbors of `frontier`, strongest connecting edge first, ties by id.
fn rank_level(frontier: &[Uuid], adjacency: &[Vec<SimilarityEdge>], seen: &HashSet<Uuid>) -> Vec<Uuid> {
    let mut best: HashMap<Uuid, f64> = HashMap::new();
    for (node, edges) in frontier.iter().zip(adjacency) {
        for edge in edges {
            let Some(other) = edge.other(*node) else {
                continue;
            };
            if seen.contains(&other) {
                continue;
            }
            let weight = best.entry(other).or_insert(f64::MIN);
            if edge.weight > *weight {
                *weight = edge.weight;
            }
        }
    }

    let mut ranked: Vec<(Uuid, f64)> = best.into_iter().collect();
    ranked.sort_by(|(a_id, a_w), (b_id, b_w)| {
        b_w.partial_cmp(a_w)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a_id.cmp(b_id))
    });
    ranked.into_iter().map(|(id, _)| id).collect()
}

fn sort_edges(edges: &mut Vec<SimilarityEdge>) {
    edges.sort_by_key(|e| e.key());
    edges.dedup_by_key(|e| e.key());
}
