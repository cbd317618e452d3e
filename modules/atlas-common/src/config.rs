use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::AtlasError;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Neo4j. When the URI is unset the API serves from the in-memory store.
    pub neo4j_uri: Option<String>,
    pub neo4j_user: String,
    pub neo4j_password: String,

    // Web server
    pub api_host: String,
    pub api_port: u16,

    pub graph: GraphSettings,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        let neo4j_uri = env::var("NEO4J_URI").ok().filter(|v| !v.trim().is_empty());
        let (neo4j_user, neo4j_password) = if neo4j_uri.is_some() {
            (required_env("NEO4J_USER"), required_env("NEO4J_PASSWORD"))
        } else {
            (String::new(), String::new())
        };

        Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("API_PORT must be a number"),
            graph: GraphSettings::from_env(),
        }
    }
}

/// Tuning for clustering, edge building and the insert/read paths.
/// Defaults match the production deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSettings {
    /// Embedding dimension D. Every vector and centroid must have exactly this length.
    pub embedding_dim: usize,
    /// Minimum cosine to join an existing cluster instead of founding a new one.
    pub cluster_similarity_threshold: f64,
    /// Minimum cosine for a SIMILAR_TO edge between same-cluster insights.
    pub edge_similarity_threshold: f64,
    /// EMA weight given to the incoming vector on centroid update.
    pub cluster_ema_alpha: f64,
    pub max_edges_per_node: usize,
    /// Nearest-neighbor candidates considered when building edges for a new node.
    pub edge_candidates: usize,
    /// Floor on the candidate pool for supporter/challenger lookups.
    pub relation_candidate_pool: usize,
    pub store_max_attempts: u32,
    pub store_retry_base: Duration,
    /// Soft deadline for one neighborhood expansion.
    pub expand_deadline: Duration,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            embedding_dim: 1536,
            cluster_similarity_threshold: 0.78,
            edge_similarity_threshold: 0.72,
            cluster_ema_alpha: 0.25,
            max_edges_per_node: 12,
            edge_candidates: 20,
            relation_candidate_pool: 24,
            store_max_attempts: 4,
            store_retry_base: Duration::from_millis(20),
            expand_deadline: Duration::from_millis(1500),
        }
    }
}

impl GraphSettings {
    /// Defaults overridden by any of the tuning env vars that are set.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            embedding_dim: env_or("EMBEDDING_DIM", d.embedding_dim),
            cluster_similarity_threshold: env_or(
                "CLUSTER_SIMILARITY_THRESHOLD",
                d.cluster_similarity_threshold,
            ),
            edge_similarity_threshold: env_or(
                "EDGE_SIMILARITY_THRESHOLD",
                d.edge_similarity_threshold,
            ),
            cluster_ema_alpha: env_or("CLUSTER_EMA_ALPHA", d.cluster_ema_alpha),
            max_edges_per_node: env_or("MAX_EDGES_PER_NODE", d.max_edges_per_node),
            edge_candidates: env_or("EDGE_CANDIDATES", d.edge_candidates),
            relation_candidate_pool: env_or("RELATION_CANDIDATE_POOL", d.relation_candidate_pool),
            store_max_attempts: env_or("STORE_MAX_ATTEMPTS", d.store_max_attempts),
            store_retry_base: Duration::from_millis(env_or(
                "STORE_RETRY_BASE_MS",
                d.store_retry_base.as_millis() as u64,
            )),
            expand_deadline: Duration::from_millis(env_or(
                "EXPAND_DEADLINE_MS",
                d.expand_deadline.as_millis() as u64,
            )),
        }
    }

    pub fn validate(&self) -> Result<(), AtlasError> {
        if self.embedding_dim == 0 {
            return Err(AtlasError::Validation("EMBEDDING_DIM must be positive".into()));
        }
        if !(-1.0..=1.0).contains(&self.cluster_similarity_threshold) {
            return Err(AtlasError::Validation(
                "CLUSTER_SIMILARITY_THRESHOLD must be within [-1, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.edge_similarity_threshold) {
            return Err(AtlasError::Validation(
                "EDGE_SIMILARITY_THRESHOLD must be within [0, 1]".into(),
            ));
        }
        if !(self.cluster_ema_alpha > 0.0 && self.cluster_ema_alpha <= 1.0) {
            return Err(AtlasError::Validation(
                "CLUSTER_EMA_ALPHA must be within (0, 1]".into(),
            ));
        }
        if self.max_edges_per_node == 0 || self.edge_candidates == 0 {
            return Err(AtlasError::Validation(
                "MAX_EDGES_PER_NODE and EDGE_CANDIDATES must be positive".into(),
            ));
        }
        if self.store_max_attempts == 0 {
            return Err(AtlasError::Validation("STORE_MAX_ATTEMPTS must be positive".into()));
        }
        Ok(())
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn env_or<T: FromStr + std::fmt::Debug>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, ?default, "Unparseable setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}
