//! Insert path: validate, assign a cluster, commit, link, then build the initial view.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use atlas_common::{
    insight_text_key, validate_insight_text, AtlasError, ClusterNode, ClusterSummary,
    GraphSettings, InsightNode, InsightView, NewInsight, SimilarityEdge, Split, Subgraph,
};

use crate::assigner::ClusterAssigner;
use crate::reader::AtlasReader;
use crate::similarity::SimilarityGraphBuilder;
use crate::splitter::DEFAULT_SPLIT_LIMIT;
use crate::store::{AtlasStore, StoreError, UpsertOutcome};

/// Initial view handed back with every insert.
const INITIAL_VIEW_DEPTH: usize = 1;
const INITIAL_VIEW_BUDGET: usize = 32;

/// Result of the insert trigger.
#[derive(Debug, Clone, Serialize)]
pub struct InsertOutcome {
    pub insight: InsightView,
    pub cluster: ClusterSummary,
    pub cluster_created: bool,
    /// The text matched an existing insight; nothing was written.
    pub duplicate: bool,
    /// Edges of the returned node after pruning.
    pub edges: Vec<SimilarityEdge>,
    #[serde(flatten)]
    pub split: Split,
    /// Best-effort depth-1 neighborhood. Absent if expansion failed.
    pub subgraph: Option<Subgraph>,
}

pub struct InsightPipeline {
    store: Arc<dyn AtlasStore>,
    assigner: ClusterAssigner,
    builder: SimilarityGraphBuilder,
    reader: Arc<AtlasReader>,
}

impl InsightPipeline {
    pub fn new(store: Arc<dyn AtlasStore>, settings: GraphSettings, reader: Arc<AtlasReader>) -> Self {
        Self {
            assigner: ClusterAssigner::new(store.clone(), settings.clone()),
            builder: SimilarityGraphBuilder::new(store.clone(), settings),
            store,
            reader,
        }
    }

    pub fn assigner(&self) -> &ClusterAssigner {
        &self.assigner
    }

    /// Insert an already moderated, embedded and stance-labeled insight.
    ///
    /// The cluster write and the insight row commit together or not at all. Edges are
    /// built afterwards and never fail the insert.
    pub async fn insert(&self, new: NewInsight) -> Result<InsertOutcome, AtlasError> {
        let text = validate_insight_text(&new.text)?;
        self.assigner.validate_vector(&new.embedding)?;
        let normalized_key = insight_text_key(&text);

        if let Some(existing) = self.store.find_by_key(&normalized_key).await? {
            info!(insight_id = %existing.id, "Duplicate submission, returning existing insight");
            return self.existing_outcome(existing).await;
        }

        let candidate = InsightNode {
            id: Uuid::new_v4(),
            text,
            normalized_key,
            embedding: new.embedding,
            cluster_id: String::new(),
            stance: new.stance,
            canonical_claim: new.canonical_claim.filter(|c| !c.trim().is_empty()),
            counterclaim: new.counterclaim.filter(|c| !c.trim().is_empty()),
            created_at: Utc::now(),
        };

        let store = self.store.clone();
        let (committed, write) = self
            .assigner
            .assign_with(&candidate.embedding, |write| {
                let store = store.clone();
                let mut node = candidate.clone();
                node.cluster_id = write.cluster().id.clone();
                async move {
                    let outcome = store.upsert_insight(&node, &write).await?;
                    Ok::<_, StoreError>((outcome, node))
                }
            })
            .await?;

        let node = match committed {
            (UpsertOutcome::Duplicate(existing), _) => {
                info!(insight_id = %existing.id, "Concurrent duplicate resolved to existing insight");
                return self.existing_outcome(existing).await;
            }
            (UpsertOutcome::Inserted, node) => node,
        };

        info!(
            insight_id = %node.id,
            cluster_id = %node.cluster_id,
            cluster_created = write.created(),
            "Insight committed"
        );

        let edges = self
            .builder
            .upsert_edges(node.id, &node.cluster_id, &node.embedding)
            .await;
        let split = self.reader.split_or_empty(&node, DEFAULT_SPLIT_LIMIT).await;
        let subgraph = self.initial_view(node.id).await;

        Ok(InsertOutcome {
            insight: node.view(),
            cluster: write.cluster().summary(),
            cluster_created: write.created(),
            duplicate: false,
            edges,
            split,
            subgraph,
        })
    }

    /// The existing insight for `text`, shaped like an insert result, if it was already submitted.
    pub async fn find_existing(&self, text: &str) -> Result<Option<InsertOutcome>, AtlasError> {
        let key = insight_text_key(&validate_insight_text(text)?);
        match self.store.find_by_key(&key).await? {
            Some(existing) => Ok(Some(self.existing_outcome(existing).await?)),
            None => Ok(None),
        }
    }

    /// Replace a cluster's title and summary.
    pub async fn relabel_cluster(
        &self,
        cluster_id: &str,
        title: &str,
        summary: &str,
    ) -> Result<ClusterSummary, AtlasError> {
        let cluster = self.assigner.relabel(cluster_id, title, summary).await?;
        info!(cluster_id, title = %cluster.title, "Cluster relabeled");
        Ok(cluster.summary())
    }

    async fn existing_outcome(&self, existing: InsightNode) -> Result<InsertOutcome, AtlasError> {
        let cluster: Option<ClusterNode> = self.store.get_cluster(&existing.cluster_id).await?;
        let cluster = cluster.ok_or_else(|| {
            AtlasError::Internal(format!(
                "insight {} references missing cluster {}",
                existing.id, existing.cluster_id
            ))
        })?;
        let edges = self.store.edges_for_node(existing.id).await?;
        let split = self.reader.split_or_empty(&existing, DEFAULT_SPLIT_LIMIT).await;
        let subgraph = self.initial_view(existing.id).await;

        Ok(InsertOutcome {
            insight: existing.view(),
            cluster: cluster.summary(),
            cluster_created: false,
            duplicate: true,
            edges,
            split,
            subgraph,
        })
    }

    async fn initial_view(&self, id: Uuid) -> Option<Subgraph> {
        match self
            .reader
            .expand(Some(id), INITIAL_VIEW_DEPTH, INITIAL_VIEW_BUDGET)
            .await
        {
            Ok(subgraph) => Some(subgraph),
            Err(e) => {
                warn!(insight_id = %id, error = %e, "Initial view expansion failed");
                None
            }
        }
    }
}
