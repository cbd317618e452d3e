use std::sync::Arc;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue},
    routing::{get, patch, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atlas_common::Config;
use atlas_graph::{AtlasReader, AtlasStore, GraphClient, InsightPipeline, MemoryStore, Neo4jStore};

mod rest;

pub struct AppState {
    pub pipeline: InsightPipeline,
    pub reader: Arc<AtlasReader>,
}

impl AppState {
    pub fn new(store: Arc<dyn AtlasStore>, config: &Config) -> Self {
        let reader = Arc::new(AtlasReader::new(store.clone(), &config.graph));
        Self {
            pipeline: InsightPipeline::new(store, config.graph.clone(), reader.clone()),
            reader,
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/insights", post(rest::api_insert_insight))
        .route("/v1/insights/{id}", get(rest::api_insight_detail))
        .route("/v1/insights/{id}/relations", get(rest::api_insight_relations))
        .route("/v1/graph", get(rest::api_graph))
        .route("/v1/clusters", get(rest::api_clusters))
        .route("/v1/clusters/{id}", patch(rest::api_relabel_cluster))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        // method + path + status + latency only
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                }),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("atlas=info".parse()?))
        .init();

    let config = Config::from_env();
    config.graph.validate()?;

    let store: Arc<dyn AtlasStore> = match &config.neo4j_uri {
        Some(uri) => {
            let client = GraphClient::connect(uri, &config.neo4j_user, &config.neo4j_password).await?;
            atlas_graph::migrate(&client, config.graph.embedding_dim).await?;
            Arc::new(Neo4jStore::new(client))
        }
        None => {
            info!("NEO4J_URI not set, serving from the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let state = Arc::new(AppState::new(store, &config));

    let addr = format!("{}:{}", config.api_host, config.api_port);
    info!("Atlas API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
