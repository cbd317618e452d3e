//! Read-side queries: neighborhood expansion, supporter/challenger lookups, listings.
//!
//! Nothing here takes a write lock; every call works from whatever the store returns.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use atlas_common::{AtlasError, ClusterSummary, GraphSettings, InsightNode, InsightView, Split, Subgraph};

use crate::expander::NeighborhoodExpander;
use crate::splitter::SupporterChallengerSplitter;
use crate::store::AtlasStore;

pub const MIN_TOP_K: usize = 1;
pub const MAX_TOP_K: usize = 20;
/// Candidates fetched per requested insight on each side of a split.
const POOL_PER_TOP_K: usize = 6;

pub struct AtlasReader {
    store: Arc<dyn AtlasStore>,
    expander: NeighborhoodExpander,
    splitter: SupporterChallengerSplitter,
    candidate_pool: usize,
}

impl AtlasReader {
    pub fn new(store: Arc<dyn AtlasStore>, settings: &GraphSettings) -> Self {
        Self {
            expander: NeighborhoodExpander::new(store.clone(), settings),
            splitter: SupporterChallengerSplitter::new(),
            candidate_pool: settings.relation_candidate_pool,
            store,
        }
    }

    pub async fn expand(
        &self,
        root: Option<Uuid>,
        depth: usize,
        budget: usize,
    ) -> Result<Subgraph, AtlasError> {
        self.expander.expand(root, depth, budget).await
    }

    /// `supportersAndChallengers(insight_id, top_k)`.
    pub async fn supporters_and_challengers(&self, id: Uuid, top_k: usize) -> Result<Split, AtlasError> {
        if !(MIN_TOP_K..=MAX_TOP_K).contains(&top_k) {
            return Err(AtlasError::Validation(format!(
                "top_k must be within {MIN_TOP_K}..={MAX_TOP_K}, got {top_k}"
            )));
        }
        let root = self.require_insight(id).await?;
        self.split_for(&root, top_k).await
    }

    /// Split the same-cluster neighbors of `root`, `limit` on each side.
    pub async fn split_for(&self, root: &InsightNode, limit: usize) -> Result<Split, AtlasError> {
        let pool = (limit * POOL_PER_TOP_K).max(self.candidate_pool);
        let candidates = self
            .store
            .query_knn(&root.embedding, &root.cluster_id, pool, Some(root.id))
            .await?;
        Ok(self.splitter.split(root, &candidates, limit))
    }

    /// Like `split_for`, but a failed neighbor query degrades to an empty split.
    pub async fn split_or_empty(&self, root: &InsightNode, limit: usize) -> Split {
        match self.split_for(root, limit).await {
            Ok(split) => split,
            Err(e) => {
                warn!(insight_id = %root.id, error = %e, "Relation lookup failed, returning empty split");
                Split::default()
            }
        }
    }

    pub async fn get_insight(&self, id: Uuid) -> Result<InsightView, AtlasError> {
        Ok(self.require_insight(id).await?.view())
    }

    /// Every cluster, sorted by id.
    pub async fn list_clusters(&self) -> Result<Vec<ClusterSummary>, AtlasError> {
        let mut clusters: Vec<ClusterSummary> = self
            .store
            .load_clusters()
            .await?
            .iter()
            .map(|c| c.summary())
            .collect();
        clusters.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(clusters)
    }

    async fn require_insight(&self, id: Uuid) -> Result<InsightNode, AtlasError> {
        self.store
            .get_insight(id)
            .await?
            .ok_or_else(|| AtlasError::NotFound(format!("insight {id}")))
    }
}
