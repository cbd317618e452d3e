//! Neo4jStore against a real database.
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p atlas-graph --features test-utils --test neo4j_store_test

#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use atlas_common::{insight_text_key, ClusterNode, GraphSettings, InsightNode, NewInsight, SimilarityEdge, Stance};
use atlas_graph::{
    AtlasReader, AtlasStore, ClusterStore, ClusterWrite, GraphClient, GraphStore, InsightPipeline,
    InsightStore, Neo4jStore, StoreError, UpsertOutcome,
};

const DIM: usize = 4;

/// Spin up a fresh Neo4j container and run migrations.
async fn setup() -> (impl std::any::Any, Arc<Neo4jStore>) {
    let (container, client): (_, GraphClient) = atlas_graph::testutil::neo4j_container().await;
    atlas_graph::migrate(&client, DIM).await.expect("migration failed");
    // Vector indexes populate asynchronously.
    tokio::time::sleep(Duration::from_secs(1)).await;
    (container, Arc::new(Neo4jStore::new(client)))
}

fn node(text: &str, cluster_id: &str, embedding: Vec<f32>, stance: Option<Stance>) -> InsightNode {
    InsightNode {
        id: Uuid::new_v4(),
        text: text.to_string(),
        normalized_key: insight_text_key(text),
        embedding,
        cluster_id: cluster_id.to_string(),
        stance,
        canonical_claim: Some("Remote work improves productivity.".to_string()),
        counterclaim: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn insight_commit_round_trips_with_cluster() {
    let (_container, store) = setup().await;

    let cluster = ClusterNode::seeded(vec![1.0, 0.0, 0.0, 0.0], Utc::now());
    let a = node("remote work boosts productivity.", &cluster.id, vec![1.0, 0.0, 0.0, 0.0], Some(Stance::Pro));
    let out = store
        .upsert_insight(&a, &ClusterWrite::Create(cluster.clone()))
        .await
        .unwrap();
    assert_eq!(out, UpsertOutcome::Inserted);

    let loaded = store.get_insight(a.id).await.unwrap().unwrap();
    assert_eq!(loaded.text, a.text);
    assert_eq!(loaded.cluster_id, cluster.id);
    assert_eq!(loaded.stance, Some(Stance::Pro));
    assert_eq!(loaded.counterclaim, None);
    assert_eq!(loaded.embedding, a.embedding);

    let stored = store.get_cluster(&cluster.id).await.unwrap().unwrap();
    assert_eq!(stored.item_count, 1);
    assert_eq!(stored.version, 0);
    assert_eq!(stored.title, cluster.title);
}

#[tokio::test]
async fn duplicate_and_stale_version_leave_state_untouched() {
    let (_container, store) = setup().await;
    let cluster = ClusterNode::seeded(vec![1.0, 0.0, 0.0, 0.0], Utc::now());
    let a = node("remote work boosts productivity.", &cluster.id, vec![1.0, 0.0, 0.0, 0.0], None);
    store
        .upsert_insight(&a, &ClusterWrite::Create(cluster.clone()))
        .await
        .unwrap();

    let mut bumped = cluster.clone();
    bumped.item_count = 2;
    let dup = node("Remote work boosts productivity!", &cluster.id, vec![1.0, 0.0, 0.0, 0.0], None);
    let out = store
        .upsert_insight(
            &dup,
            &ClusterWrite::Update {
                cluster: bumped.clone(),
                expected_version: 0,
            },
        )
        .await
        .unwrap();
    assert!(matches!(out, UpsertOutcome::Duplicate(existing) if existing.id == a.id));

    let b = node("remote work lowers focus.", &cluster.id, vec![0.8, 0.6, 0.0, 0.0], None);
    let err = store
        .upsert_insight(
            &b,
            &ClusterWrite::Update {
                cluster: bumped,
                expected_version: 7,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Conflict(cluster.id.clone()));

    assert!(store.get_insight(b.id).await.unwrap().is_none());
    assert_eq!(store.get_cluster(&cluster.id).await.unwrap().unwrap().item_count, 1);
}

#[tokio::test]
async fn edges_are_undirected_and_cluster_scoped() {
    let (_container, store) = setup().await;
    let c1 = ClusterNode::seeded(vec![1.0, 0.0, 0.0, 0.0], Utc::now());
    let c2 = ClusterNode::seeded(vec![0.0, 0.0, 1.0, 0.0], Utc::now());
    let a = node("first insight in c1", &c1.id, vec![1.0, 0.0, 0.0, 0.0], None);
    let b = node("second insight in c1", &c1.id, vec![0.8, 0.6, 0.0, 0.0], None);
    let c = node("only insight in c2", &c2.id, vec![0.0, 0.0, 1.0, 0.0], None);

    store.upsert_insight(&a, &ClusterWrite::Create(c1.clone())).await.unwrap();
    let mut c1b = c1.clone();
    c1b.item_count = 2;
    store
        .upsert_insight(&b, &ClusterWrite::Update { cluster: c1b, expected_version: 0 })
        .await
        .unwrap();
    store.upsert_insight(&c, &ClusterWrite::Create(c2)).await.unwrap();

    store
        .insert_edge(&SimilarityEdge::new(b.id, a.id, 0.8, Utc::now()))
        .await
        .unwrap();
    assert_eq!(store.edges_for_node(a.id).await.unwrap().len(), 1);
    assert_eq!(store.edges_for_node(b.id).await.unwrap().len(), 1);
    assert_eq!(store.edges_among(&[a.id, b.id, c.id]).await.unwrap().len(), 1);

    assert!(matches!(
        store
            .insert_edge(&SimilarityEdge::new(a.id, c.id, 0.9, Utc::now()))
            .await,
        Err(StoreError::Invalid(_))
    ));

    let hits = store.query_knn(&[1.0, 0.0, 0.0, 0.0], &c1.id, 5, Some(a.id)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].insight.id, b.id);
    assert!((hits[0].similarity - 0.8).abs() < 1e-6);

    assert!(store.delete_edge(a.id, b.id).await.unwrap());
    assert!(store.edges_for_node(a.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn pipeline_runs_end_to_end_on_neo4j() {
    let (_container, store) = setup().await;
    let settings = GraphSettings {
        embedding_dim: DIM,
        ..GraphSettings::default()
    };
    let dyn_store: Arc<dyn AtlasStore> = store.clone();
    let reader = Arc::new(AtlasReader::new(dyn_store.clone(), &settings));
    let pipeline = InsightPipeline::new(dyn_store, settings, reader.clone());

    let a = pipeline
        .insert(NewInsight {
            text: "remote work boosts productivity".into(),
            embedding: vec![1.0, 0.0, 0.0, 0.0],
            stance: Some(Stance::Pro),
            canonical_claim: None,
            counterclaim: None,
        })
        .await
        .unwrap();
    let b = pipeline
        .insert(NewInsight {
            text: "remote work lowers focus".into(),
            embedding: vec![0.8, 0.6, 0.0, 0.0],
            stance: Some(Stance::Con),
            canonical_claim: None,
            counterclaim: None,
        })
        .await
        .unwrap();

    assert_eq!(b.cluster.id, a.cluster.id);
    assert_eq!(b.edges.len(), 1);

    let split = reader.supporters_and_challengers(a.insight.id, 2).await.unwrap();
    assert!(split.supporters.is_empty());
    assert_eq!(split.challengers.len(), 1);
    assert_eq!(split.challengers[0].insight.id, b.insight.id);

    let graph = reader.expand(None, 1, 10).await.unwrap();
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.nodes[0].id, b.insight.id);
    assert_eq!(graph.edges.len(), 1);
}
