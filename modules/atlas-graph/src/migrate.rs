use neo4rs::query;
use tracing::{info, warn};

use crate::GraphClient;

/// Name of the vector index backing nearest-neighbor queries over insight embeddings.
pub const INSIGHT_EMBEDDING_INDEX: &str = "insight_embedding";

/// Run idempotent schema migrations: constraints, property indexes, the vector index.
pub async fn migrate(client: &GraphClient, embedding_dim: usize) -> Result<(), neo4rs::Error> {
    let g = &client.graph;

    info!("Running schema migrations...");

    let constraints = [
        "CREATE CONSTRAINT cluster_id IF NOT EXISTS FOR (n:Cluster) REQUIRE n.id IS UNIQUE",
        "CREATE CONSTRAINT insight_id IF NOT EXISTS FOR (n:Insight) REQUIRE n.id IS UNIQUE",
        // Dedup backstop for concurrent inserts of the same text.
        "CREATE CONSTRAINT insight_normalized_key IF NOT EXISTS FOR (n:Insight) REQUIRE n.normalized_key IS UNIQUE",
    ];
    for c in &constraints {
        run_ignoring_exists(g, c).await?;
    }
    info!("Uniqueness constraints created");

    let indexes = [
        "CREATE INDEX insight_cluster_id IF NOT EXISTS FOR (n:Insight) ON (n.cluster_id)",
        "CREATE INDEX insight_created_at IF NOT EXISTS FOR (n:Insight) ON (n.created_at)",
    ];
    for idx in &indexes {
        run_ignoring_exists(g, idx).await?;
    }
    info!("Property indexes created");

    let vector = format!(
        "CREATE VECTOR INDEX {INSIGHT_EMBEDDING_INDEX} IF NOT EXISTS FOR (n:Insight) ON (n.embedding) \
         OPTIONS {{indexConfig: {{`vector.dimensions`: {embedding_dim}, `vector.similarity_function`: 'cosine'}}}}"
    );
    run_ignoring_exists(g, &vector).await?;
    info!(dimension = embedding_dim, "Vector index created");

    info!("Schema migrations complete");
    Ok(())
}

async fn run_ignoring_exists(g: &neo4rs::Graph, cypher: &str) -> Result<(), neo4rs::Error> {
    match g.run(query(cypher)).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("already exists") || msg.contains("equivalent") {
                warn!("Already exists (skipped): {}", cypher.chars().take(80).collect::<String>());
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}
