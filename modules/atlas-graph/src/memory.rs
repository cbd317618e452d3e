use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use atlas_common::{cosine_similarity, edge_key, ClusterNode, InsightNode, Neighbor, SimilarityEdge};

use crate::store::{
    sort_neighbors, ClusterStore, ClusterWrite, GraphStore, InsightStore, StoreError,
    UpsertOutcome,
};

#[derive(Default)]
struct MemoryState {
    clusters: BTreeMap<String, ClusterNode>,
    insights: HashMap<Uuid, InsightNode>,
    by_key: HashMap<String, Uuid>,
    /// Commit order, used to break created_at ties.
    order: Vec<Uuid>,
    edges: HashMap<(Uuid, Uuid), SimilarityEdge>,
    adjacency: HashMap<Uuid, BTreeSet<Uuid>>,
}

/// In-process implementation of the full storage contract.
///
/// All state sits behind one `RwLock`, so `upsert_insight` is trivially atomic.
/// Fault injection hooks let tests exercise the transient-failure paths.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    failing_neighbor_queries: AtomicBool,
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Make `query_knn` fail while leaving the rest of the store healthy.
    pub fn fail_neighbor_queries(&self, failing: bool) {
        self.failing_neighbor_queries.store(failing, Ordering::SeqCst);
    }

    /// Force the next `n` versioned cluster writes to lose their compare-and-swap.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Total stored edges (test assertions).
    pub fn edge_count(&self) -> usize {
        self.state.read().map(|s| s.edges.len()).unwrap_or(0)
    }

    /// Total stored insights (test assertions).
    pub fn insight_count(&self) -> usize {
        self.state.read().map(|s| s.insights.len()).unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StoreError> {
        self.check_available()?;
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StoreError> {
        self.check_available()?;
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn apply_versioned(
        &self,
        state: &mut MemoryState,
        cluster: &ClusterNode,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        if self.take_injected_conflict() {
            return Err(StoreError::Conflict(cluster.id.clone()));
        }
        let Some(current) = state.clusters.get(&cluster.id) else {
            return Err(StoreError::Invalid(format!("unknown cluster {}", cluster.id)));
        };
        if current.version != expected_version {
            return Err(StoreError::Conflict(cluster.id.clone()));
        }
        let mut next = cluster.clone();
        next.version = expected_version + 1;
        state.clusters.insert(next.id.clone(), next);
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn load_clusters(&self) -> Result<Vec<ClusterNode>, StoreError> {
        Ok(self.read()?.clusters.values().cloned().collect())
    }

    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterNode>, StoreError> {
        Ok(self.read()?.clusters.get(id).cloned())
    }

    async fn get_clusters(&self, ids: &[String]) -> Result<Vec<ClusterNode>, StoreError> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.clusters.get(id).cloned())
            .collect())
    }

    async fn upsert_cluster(
        &self,
        cluster: &ClusterNode,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match expected_version {
            Some(v) => self.apply_versioned(&mut state, cluster, v),
            None => {
                state.clusters.insert(cluster.id.clone(), cluster.clone());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl InsightStore for MemoryStore {
    async fn upsert_insight(
        &self,
        insight: &InsightNode,
        cluster: &ClusterWrite,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.write()?;

        if let Some(existing) = state
            .by_key
            .get(&insight.normalized_key)
            .and_then(|id| state.insights.get(id))
        {
            return Ok(UpsertOutcome::Duplicate(existing.clone()));
        }
        if state.insights.contains_key(&insight.id) {
            return Err(StoreError::Invalid(format!("insight {} already exists", insight.id)));
        }
        if insight.cluster_id != cluster.cluster().id {
            return Err(StoreError::Invalid(format!(
                "insight {} targets {} but cluster write is for {}",
                insight.id,
                insight.cluster_id,
                cluster.cluster().id
            )));
        }

        match cluster {
            ClusterWrite::Create(c) => {
                if state.clusters.contains_key(&c.id) {
                    return Err(StoreError::Conflict(c.id.clone()));
                }
                state.clusters.insert(c.id.clone(), c.clone());
            }
            ClusterWrite::Update {
                cluster,
                expected_version,
            } => self.apply_versioned(&mut state, cluster, *expected_version)?,
        }

        state
            .by_key
            .insert(insight.normalized_key.clone(), insight.id);
        state.order.push(insight.id);
        state.insights.insert(insight.id, insight.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn find_by_key(&self, normalized_key: &str) -> Result<Option<InsightNode>, StoreError> {
        let state = self.read()?;
        Ok(state
            .by_key
            .get(normalized_key)
            .and_then(|id| state.insights.get(id))
            .cloned())
    }

    async fn get_insight(&self, id: Uuid) -> Result<Option<InsightNode>, StoreError> {
        Ok(self.read()?.insights.get(&id).cloned())
    }

    async fn get_insights(&self, ids: &[Uuid]) -> Result<Vec<InsightNode>, StoreError> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.insights.get(id).cloned())
            .collect())
    }

    async fn recent_insights(&self, limit: usize) -> Result<Vec<InsightNode>, StoreError> {
        let state = self.read()?;
        let mut ranked: Vec<(usize, &InsightNode)> = state
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| state.insights.get(id).map(|n| (seq, n)))
            .collect();
        ranked.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(_, n)| n.clone())
            .collect())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn insert_edge(&self, edge: &SimilarityEdge) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if edge.src == edge.dst {
            return Err(StoreError::Invalid("self-loop edge".into()));
        }
        let (Some(a), Some(b)) = (state.insights.get(&edge.src), state.insights.get(&edge.dst))
        else {
            return Err(StoreError::Invalid(format!(
                "edge {} -> {} references a missing insight",
                edge.src, edge.dst
            )));
        };
        if a.cluster_id != b.cluster_id {
            return Err(StoreError::Invalid(format!(
                "edge {} -> {} crosses clusters",
                edge.src, edge.dst
            )));
        }

        state.edges.insert(edge.key(), edge.clone());
        state.adjacency.entry(edge.src).or_default().insert(edge.dst);
        state.adjacency.entry(edge.dst).or_default().insert(edge.src);
        Ok(())
    }

    async fn delete_edge(&self, a: Uuid, b: Uuid) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let removed = state.edges.remove(&edge_key(a, b)).is_some();
        if removed {
            if let Some(adj) = state.adjacency.get_mut(&a) {
                adj.remove(&b);
            }
            if let Some(adj) = state.adjacency.get_mut(&b) {
                adj.remove(&a);
            }
        }
        Ok(removed)
    }

    async fn edges_for_node(&self, node: Uuid) -> Result<Vec<SimilarityEdge>, StoreError> {
        let state = self.read()?;
        let Some(adj) = state.adjacency.get(&node) else {
            return Ok(Vec::new());
        };
        Ok(adj
            .iter()
            .filter_map(|other| state.edges.get(&edge_key(node, *other)).cloned())
            .collect())
    }

    async fn edges_among(&self, ids: &[Uuid]) -> Result<Vec<SimilarityEdge>, StoreError> {
        let state = self.read()?;
        let wanted: BTreeSet<Uuid> = ids.iter().copied().collect();
        let mut out = Vec::new();
        for id in &wanted {
            let Some(adj) = state.adjacency.get(id) else {
                continue;
            };
            for other in adj.range(id..) {
                if other != id && wanted.contains(other) {
                    if let Some(edge) = state.edges.get(&edge_key(*id, *other)) {
                        out.push(edge.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn query_knn(
        &self,
        vector: &[f32],
        cluster_id: &str,
        k: usize,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Neighbor>, StoreError> {
        if self.failing_neighbor_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("neighbor query failed".into()));
        }
        let state = self.read()?;
        let mut hits: Vec<Neighbor> = state
            .insights
            .values()
            .filter(|n| n.cluster_id == cluster_id && Some(n.id) != exclude)
            .map(|n| Neighbor {
                similarity: cosine_similarity(vector, &n.embedding),
                insight: n.clone(),
            })
            .collect();
        sort_neighbors(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}
