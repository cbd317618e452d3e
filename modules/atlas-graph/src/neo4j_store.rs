//! Neo4j-backed implementation of the storage contract.
//!
//! Insights are `(:Insight)` nodes linked to their `(:Cluster)` by `[:IN_CLUSTER]`.
//! Similarity edges are `[:SIMILAR_TO]` relationships, stored in one direction and
//! always matched undirected.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use neo4rs::{query, Query, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use atlas_common::{
    cosine_similarity, ClusterNode, EdgeType, InsightNode, Neighbor, SimilarityEdge, Stance,
};

use crate::migrate::INSIGHT_EMBEDDING_INDEX;
use crate::store::{
    sort_neighbors, ClusterStore, ClusterWrite, GraphStore, InsightStore, StoreError,
    UpsertOutcome,
};
use crate::GraphClient;

const INSIGHT_FIELDS: &str = "i.id AS id, i.text AS text, i.normalized_key AS normalized_key, \
     i.embedding AS embedding, i.cluster_id AS cluster_id, i.stance AS stance, \
     i.canonical_claim AS canonical_claim, i.counterclaim AS counterclaim, \
     i.created_at AS created_at";

const CLUSTER_FIELDS: &str = "c.id AS id, c.title AS title, c.summary AS summary, \
     c.centroid AS centroid, c.item_count AS item_count, c.version AS version, \
     c.updated_at AS updated_at";

const EDGE_FIELDS: &str = "startNode(r).id AS src, endNode(r).id AS dst, r.weight AS weight, \
     r.created_at AS created_at";

/// Vector index hits requested per wanted neighbor, before the cluster filter.
const KNN_OVERSAMPLE: usize = 4;
const KNN_MIN_POOL: usize = 64;

pub struct Neo4jStore {
    client: GraphClient,
}

impl Neo4jStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    async fn collect_rows(&self, q: Query) -> Result<Vec<Row>, StoreError> {
        let mut stream = self.client.graph.execute(q).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn collect_insights(&self, q: Query) -> Result<Vec<InsightNode>, StoreError> {
        Ok(self
            .collect_rows(q)
            .await?
            .iter()
            .filter_map(row_to_insight)
            .collect())
    }

    async fn collect_edges(&self, q: Query) -> Result<Vec<SimilarityEdge>, StoreError> {
        Ok(self
            .collect_rows(q)
            .await?
            .iter()
            .filter_map(row_to_edge)
            .collect())
    }

    /// Exact scan of one cluster. Used when the vector index pool came back short.
    async fn scan_cluster(
        &self,
        vector: &[f32],
        cluster_id: &str,
        exclude: &str,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let q = query(&format!(
            "MATCH (i:Insight {{cluster_id: $cluster_id}})
             WHERE i.id <> $exclude
             RETURN {INSIGHT_FIELDS}"
        ))
        .param("cluster_id", cluster_id)
        .param("exclude", exclude);

        Ok(self
            .collect_insights(q)
            .await?
            .into_iter()
            .map(|insight| Neighbor {
                similarity: cosine_similarity(vector, &insight.embedding),
                insight,
            })
            .collect())
    }

    async fn resolve_empty_commit(
        &self,
        insight: &InsightNode,
        cluster_id: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        match self.find_by_key(&insight.normalized_key).await? {
            Some(existing) => Ok(UpsertOutcome::Duplicate(existing)),
            None => Err(StoreError::Conflict(cluster_id.to_string())),
        }
    }
}

#[async_trait]
impl ClusterStore for Neo4jStore {
    async fn load_clusters(&self) -> Result<Vec<ClusterNode>, StoreError> {
        let q = query(&format!("MATCH (c:Cluster) RETURN {CLUSTER_FIELDS} ORDER BY c.id"));
        Ok(self
            .collect_rows(q)
            .await?
            .iter()
            .filter_map(row_to_cluster)
            .collect())
    }

    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterNode>, StoreError> {
        let q = query(&format!("MATCH (c:Cluster {{id: $id}}) RETURN {CLUSTER_FIELDS}"))
            .param("id", id);
        Ok(self.collect_rows(q).await?.iter().find_map(row_to_cluster))
    }

    async fn get_clusters(&self, ids: &[String]) -> Result<Vec<ClusterNode>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let q = query(&format!(
            "MATCH (c:Cluster) WHERE c.id IN $ids RETURN {CLUSTER_FIELDS}"
        ))
        .param("ids", ids.to_vec());
        Ok(self
            .collect_rows(q)
            .await?
            .iter()
            .filter_map(row_to_cluster)
            .collect())
    }

    async fn upsert_cluster(
        &self,
        cluster: &ClusterNode,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError> {
        let Some(expected) = expected_version else {
            let q = query(
                "MERGE (c:Cluster {id: $id})
                 SET c.title = $title,
                     c.summary = $summary,
                     c.centroid = $centroid,
                     c.item_count = $item_count,
                     c.version = $version,
                     c.updated_at = datetime($updated_at)",
            );
            self.client
                .graph
                .run(bind_cluster(q, cluster).param("version", cluster.version as i64))
                .await?;
            return Ok(());
        };

        // Take the node write lock before reading the version.
        let q = query(
            "MATCH (c:Cluster {id: $id})
             SET c._lock = true REMOVE c._lock
             WITH c WHERE c.version = $expected_version
             SET c.title = $title,
                 c.summary = $summary,
                 c.centroid = $centroid,
                 c.item_count = $item_count,
                 c.version = c.version + 1,
                 c.updated_at = datetime($updated_at)
             RETURN c.id AS id",
        )
        .param("expected_version", expected as i64);

        if self.collect_rows(bind_cluster(q, cluster)).await?.is_empty() {
            return match self.get_cluster(&cluster.id).await? {
                Some(_) => Err(StoreError::Conflict(cluster.id.clone())),
                None => Err(StoreError::Invalid(format!("unknown cluster {}", cluster.id))),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl InsightStore for Neo4jStore {
    async fn upsert_insight(
        &self,
        insight: &InsightNode,
        cluster: &ClusterWrite,
    ) -> Result<UpsertOutcome, StoreError> {
        if let Some(existing) = self.find_by_key(&insight.normalized_key).await? {
            return Ok(UpsertOutcome::Duplicate(existing));
        }

        let create_insight = "CREATE (i:Insight {
                 id: $insight_id,
                 text: $text,
                 normalized_key: $normalized_key,
                 embedding: $embedding,
                 cluster_id: $id,
                 stance: $stance,
                 canonical_claim: $canonical_claim,
                 counterclaim: $counterclaim,
                 created_at: datetime($created_at)
             })
             CREATE (i)-[:IN_CLUSTER]->(c)
             RETURN i.id AS insight_id";

        // One statement per commit, so the cluster write and the insight row land together.
        let cypher = match cluster {
            ClusterWrite::Create(_) => format!(
                "OPTIONAL MATCH (dup:Insight {{normalized_key: $normalized_key}})
                 WITH dup WHERE dup IS NULL
                 CREATE (c:Cluster {{
                     id: $id,
                     title: $title,
                     summary: $summary,
                     centroid: $centroid,
                     item_count: $item_count,
                     version: 0,
                     updated_at: datetime($updated_at)
                 }})
                 {create_insight}"
            ),
            ClusterWrite::Update { .. } => format!(
                "MATCH (c:Cluster {{id: $id}})
                 SET c._lock = true REMOVE c._lock
                 WITH c WHERE c.version = $expected_version
                 OPTIONAL MATCH (dup:Insight {{normalized_key: $normalized_key}})
                 WITH c, dup WHERE dup IS NULL
                 SET c.centroid = $centroid,
                     c.item_count = $item_count,
                     c.version = c.version + 1,
                     c.updated_at = datetime($updated_at)
                 {create_insight}"
            ),
        };

        let expected_version = match cluster {
            ClusterWrite::Update {
                expected_version, ..
            } => *expected_version as i64,
            ClusterWrite::Create(_) => 0,
        };
        let q = bind_cluster(query(&cypher), cluster.cluster())
            .param("expected_version", expected_version)
            .param("insight_id", insight.id.to_string())
            .param("text", insight.text.as_str())
            .param("normalized_key", insight.normalized_key.as_str())
            .param("embedding", embedding_to_f64(&insight.embedding))
            .param("stance", insight.stance.map(|s| s.as_str()).unwrap_or(""))
            .param(
                "canonical_claim",
                insight.canonical_claim.clone().unwrap_or_default(),
            )
            .param("counterclaim", insight.counterclaim.clone().unwrap_or_default())
            .param("created_at", format_datetime(&insight.created_at));

        match self.collect_rows(q).await {
            Ok(rows) if !rows.is_empty() => Ok(UpsertOutcome::Inserted),
            Ok(_) => self.resolve_empty_commit(insight, &cluster.cluster().id).await,
            Err(StoreError::Unavailable(msg)) if is_constraint_violation(&msg) => {
                debug!(insight_id = %insight.id, "Constraint violation on commit: {msg}");
                self.resolve_empty_commit(insight, &cluster.cluster().id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn find_by_key(&self, normalized_key: &str) -> Result<Option<InsightNode>, StoreError> {
        let q = query(&format!(
            "MATCH (i:Insight {{normalized_key: $key}}) RETURN {INSIGHT_FIELDS} LIMIT 1"
        ))
        .param("key", normalized_key);
        Ok(self.collect_insights(q).await?.into_iter().next())
    }

    async fn get_insight(&self, id: Uuid) -> Result<Option<InsightNode>, StoreError> {
        let q = query(&format!(
            "MATCH (i:Insight {{id: $id}}) RETURN {INSIGHT_FIELDS}"
        ))
        .param("id", id.to_string());
        Ok(self.collect_insights(q).await?.into_iter().next())
    }

    async fn get_insights(&self, ids: &[Uuid]) -> Result<Vec<InsightNode>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let q = query(&format!(
            "MATCH (i:Insight) WHERE i.id IN $ids RETURN {INSIGHT_FIELDS}"
        ))
        .param("ids", uuids_to_strings(ids));
        self.collect_insights(q).await
    }

    async fn recent_insights(&self, limit: usize) -> Result<Vec<InsightNode>, StoreError> {
        let q = query(&format!(
            "MATCH (i:Insight) RETURN {INSIGHT_FIELDS} ORDER BY i.created_at DESC LIMIT $limit"
        ))
        .param("limit", limit as i64);
        self.collect_insights(q).await
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn insert_edge(&self, edge: &SimilarityEdge) -> Result<(), StoreError> {
        let q = query(
            "MATCH (a:Insight {id: $src}), (b:Insight {id: $dst})
             WHERE a.cluster_id = b.cluster_id AND a.id <> b.id
             OPTIONAL MATCH (a)-[old:SIMILAR_TO]-(b)
             WITH a, b, collect(old) AS olds
             FOREACH (o IN olds | DELETE o)
             CREATE (a)-[r:SIMILAR_TO {
                 weight: $weight,
                 edge_type: $edge_type,
                 created_at: datetime($created_at)
             }]->(b)
             RETURN count(r) AS created",
        )
        .param("src", edge.src.to_string())
        .param("dst", edge.dst.to_string())
        .param("weight", edge.weight)
        .param("edge_type", edge.edge_type.as_str())
        .param("created_at", format_datetime(&edge.created_at));

        let created = self
            .collect_rows(q)
            .await?
            .first()
            .and_then(|row| row.get::<i64>("created").ok())
            .unwrap_or(0);
        if created == 0 {
            return Err(StoreError::Invalid(format!(
                "edge {} -> {} has no same-cluster endpoints",
                edge.src, edge.dst
            )));
        }
        Ok(())
    }

    async fn delete_edge(&self, a: Uuid, b: Uuid) -> Result<bool, StoreError> {
        let q = query(
            "MATCH (:Insight {id: $a})-[r:SIMILAR_TO]-(:Insight {id: $b})
             DELETE r
             RETURN count(*) AS removed",
        )
        .param("a", a.to_string())
        .param("b", b.to_string());

        let removed = self
            .collect_rows(q)
            .await?
            .first()
            .and_then(|row| row.get::<i64>("removed").ok())
            .unwrap_or(0);
        Ok(removed > 0)
    }

    async fn edges_for_node(&self, node: Uuid) -> Result<Vec<SimilarityEdge>, StoreError> {
        let q = query(&format!(
            "MATCH (:Insight {{id: $id}})-[r:SIMILAR_TO]-(:Insight)
             RETURN {EDGE_FIELDS}"
        ))
        .param("id", node.to_string());
        self.collect_edges(q).await
    }

    async fn edges_among(&self, ids: &[Uuid]) -> Result<Vec<SimilarityEdge>, StoreError> {
        if ids.len() < 2 {
            return Ok(Vec::new());
        }
        // Directed match so each stored edge is returned once.
        let q = query(&format!(
            "MATCH (a:Insight)-[r:SIMILAR_TO]->(b:Insight)
             WHERE a.id IN $ids AND b.id IN $ids
             RETURN {EDGE_FIELDS}"
        ))
        .param("ids", uuids_to_strings(ids));
        self.collect_edges(q).await
    }

    async fn query_knn(
        &self,
        vector: &[f32],
        cluster_id: &str,
        k: usize,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Neighbor>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let exclude = exclude.map(|id| id.to_string()).unwrap_or_default();
        let pool = (k * KNN_OVERSAMPLE).max(KNN_MIN_POOL);

        let q = query(&format!(
            "CALL db.index.vector.queryNodes('{INSIGHT_EMBEDDING_INDEX}', $pool, $embedding)
             YIELD node, score
             WITH node AS i, score
             WHERE i.cluster_id = $cluster_id AND i.id <> $exclude
             RETURN {INSIGHT_FIELDS}"
        ))
        .param("pool", pool as i64)
        .param("embedding", embedding_to_f64(vector))
        .param("cluster_id", cluster_id)
        .param("exclude", exclude.as_str());

        // The index score is a rescaled approximation, so every hit is re-scored exactly.
        let mut hits: Vec<Neighbor> = self
            .collect_insights(q)
            .await?
            .into_iter()
            .map(|insight| Neighbor {
                similarity: cosine_similarity(vector, &insight.embedding),
                insight,
            })
            .collect();

        if hits.len() < k {
            debug!(
                cluster_id,
                pool,
                found = hits.len(),
                "Vector pool short for cluster, scanning exactly"
            );
            hits = self.scan_cluster(vector, cluster_id, &exclude).await?;
        }

        sort_neighbors(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}

// --- Helpers ---

fn bind_cluster(q: Query, cluster: &ClusterNode) -> Query {
    q.param("id", cluster.id.as_str())
        .param("title", cluster.title.as_str())
        .param("summary", cluster.summary.as_str())
        .param("centroid", embedding_to_f64(&cluster.centroid))
        .param("item_count", cluster.item_count as i64)
        .param("updated_at", format_datetime(&cluster.updated_at))
}

fn is_constraint_violation(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("constraintvalidationfailed") || msg.contains("already exists")
}

fn embedding_to_f64(embedding: &[f32]) -> Vec<f64> {
    embedding.iter().map(|&v| v as f64).collect()
}

fn embedding_from_f64(values: Vec<f64>) -> Vec<f32> {
    values.into_iter().map(|v| v as f32).collect()
}

fn uuids_to_strings(ids: &[Uuid]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Neo4j's datetime() wants "YYYY-MM-DDThh:mm:ss" without an offset suffix.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn parse_row_datetime(row: &Row, key: &str) -> DateTime<Utc> {
    if let Ok(dt) = row.get::<DateTime<chrono::FixedOffset>>(key) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = row.get::<NaiveDateTime>(key) {
        return ndt.and_utc();
    }
    if let Ok(s) = row.get::<String>(key) {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f") {
            return ndt.and_utc();
        }
    }
    warn!(key, "Unreadable timestamp in row, using now");
    Utc::now()
}

fn non_empty(row: &Row, key: &str) -> Option<String> {
    row.get::<String>(key).ok().filter(|s| !s.is_empty())
}

fn row_to_insight(row: &Row) -> Option<InsightNode> {
    let id_str: String = row.get("id").ok()?;
    let id = Uuid::parse_str(&id_str).ok()?;
    let stance = non_empty(row, "stance").map(|s| Stance::from_label(&s));

    Some(InsightNode {
        id,
        text: row.get("text").unwrap_or_default(),
        normalized_key: row.get("normalized_key").unwrap_or_default(),
        embedding: embedding_from_f64(row.get("embedding").unwrap_or_default()),
        cluster_id: row.get("cluster_id").unwrap_or_default(),
        stance,
        canonical_claim: non_empty(row, "canonical_claim"),
        counterclaim: non_empty(row, "counterclaim"),
        created_at: parse_row_datetime(row, "created_at"),
    })
}

fn row_to_cluster(row: &Row) -> Option<ClusterNode> {
    let id: String = row.get("id").ok()?;
    let item_count: i64 = row.get("item_count").unwrap_or(0);
    let version: i64 = row.get("version").unwrap_or(0);

    Some(ClusterNode {
        id,
        title: row.get("title").unwrap_or_default(),
        summary: row.get("summary").unwrap_or_default(),
        centroid: embedding_from_f64(row.get("centroid").unwrap_or_default()),
        item_count: item_count.max(0) as u64,
        version: version.max(0) as u64,
        updated_at: parse_row_datetime(row, "updated_at"),
    })
}

fn row_to_edge(row: &Row) -> Option<SimilarityEdge> {
    let src: String = row.get("src").ok()?;
    let dst: String = row.get("dst").ok()?;
    Some(SimilarityEdge {
        src: Uuid::parse_str(&src).ok()?,
        dst: Uuid::parse_str(&dst).ok()?,
        weight: row.get("weight").unwrap_or(0.0),
        edge_type: EdgeType::Similarity,
        created_at: parse_row_datetime(row, "created_at"),
    })
}
