//! Storage contract consumed by the clustering and graph engine.
//!
//! Every call is a single request/response against a durable store that can answer
//! vector-similarity queries. Implemented by `Neo4jStore` (production) and
//! `MemoryStore` (tests, local runs).

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use atlas_common::{AtlasError, ClusterNode, InsightNode, Neighbor, SimilarityEdge};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Store unreachable or timed out. Transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Compare-and-swap lost against a concurrent writer. Transient.
    #[error("write conflict on {0}")]
    Conflict(String),

    /// The store rejected the request outright.
    #[error("invalid store request: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

impl From<StoreError> for AtlasError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => AtlasError::StoreUnavailable(msg),
            StoreError::Conflict(key) => AtlasError::Contention { key, attempts: 1 },
            StoreError::Invalid(msg) => AtlasError::Internal(msg),
        }
    }
}

impl From<neo4rs::Error> for StoreError {
    fn from(e: neo4rs::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// How the cluster side of an insight commit is written.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterWrite {
    /// Found a new cluster. Fails with `Conflict` if the id is taken.
    Create(ClusterNode),
    /// Replace centroid and item_count, only if the stored version still equals
    /// `expected_version`. The stored version becomes `expected_version + 1`.
    Update {
        cluster: ClusterNode,
        expected_version: u64,
    },
}

impl ClusterWrite {
    pub fn cluster(&self) -> &ClusterNode {
        match self {
            ClusterWrite::Create(c) => c,
            ClusterWrite::Update { cluster, .. } => cluster,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, ClusterWrite::Create(_))
    }
}

/// Result of `upsert_insight`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// Insight row and cluster write committed together.
    Inserted,
    /// An insight with the same normalized key already exists. Nothing was written.
    Duplicate(InsightNode),
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn load_clusters(&self) -> Result<Vec<ClusterNode>, StoreError>;

    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterNode>, StoreError>;

    async fn get_clusters(&self, ids: &[String]) -> Result<Vec<ClusterNode>, StoreError>;

    /// Create or replace a cluster. With `expected_version`, the write only applies if the
    /// stored version matches (else `Conflict`), and the stored version is bumped.
    async fn upsert_cluster(
        &self,
        cluster: &ClusterNode,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait InsightStore: Send + Sync {
    /// Atomically write the cluster side and the insight row. Unique on `normalized_key`:
    /// a key collision returns the existing insight and applies neither write.
    async fn upsert_insight(
        &self,
        insight: &InsightNode,
        cluster: &ClusterWrite,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn find_by_key(&self, normalized_key: &str) -> Result<Option<InsightNode>, StoreError>;

    async fn get_insight(&self, id: Uuid) -> Result<Option<InsightNode>, StoreError>;

    async fn get_insights(&self, ids: &[Uuid]) -> Result<Vec<InsightNode>, StoreError>;

    /// Most recently created first.
    async fn recent_insights(&self, limit: usize) -> Result<Vec<InsightNode>, StoreError>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or overwrite the edge between `edge.src` and `edge.dst` (either direction).
    async fn insert_edge(&self, edge: &SimilarityEdge) -> Result<(), StoreError>;

    /// Remove the edge between `a` and `b` regardless of stored direction.
    async fn delete_edge(&self, a: Uuid, b: Uuid) -> Result<bool, StoreError>;

    /// All edges touching `node`, regardless of stored direction.
    async fn edges_for_node(&self, node: Uuid) -> Result<Vec<SimilarityEdge>, StoreError>;

    /// Edges whose endpoints both lie in `ids`.
    async fn edges_among(&self, ids: &[Uuid]) -> Result<Vec<SimilarityEdge>, StoreError>;

    /// Up to `k` insights in `cluster_id` nearest to `vector`, most similar first,
    /// with exact cosine similarity.
    async fn query_knn(
        &self,
        vector: &[f32],
        cluster_id: &str,
        k: usize,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Neighbor>, StoreError>;
}

/// The full contract the engine runs against.
pub trait AtlasStore: ClusterStore + InsightStore + GraphStore {}

impl<T: ClusterStore + InsightStore + GraphStore> AtlasStore for T {}

/// Deterministic ordering for KNN results: similarity desc, then id asc.
pub(crate) fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.insight.id.cmp(&b.insight.id))
    });
}
