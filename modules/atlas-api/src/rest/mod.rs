use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use atlas_common::{AtlasError, NewInsight};

use crate::AppState;

const DEFAULT_TOP_K: usize = 2;
const DEFAULT_DEPTH: usize = 2;
const DEFAULT_BUDGET: usize = 80;

// --- Query structs ---

#[derive(Deserialize)]
pub struct RelationsQuery {
    top_k: Option<usize>,
}

#[derive(Deserialize)]
pub struct GraphQuery {
    node_id: Option<Uuid>,
    depth: Option<usize>,
    budget: Option<usize>,
}

#[derive(Deserialize)]
pub struct RelabelRequest {
    title: String,
    summary: String,
}

// --- Helpers ---

pub fn status_for(err: &AtlasError) -> StatusCode {
    match err {
        AtlasError::Validation(_) => StatusCode::BAD_REQUEST,
        AtlasError::NotFound(_) => StatusCode::NOT_FOUND,
        AtlasError::StoreUnavailable(_) | AtlasError::Contention { .. } | AtlasError::Timeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AtlasError::Collaborator(_) => StatusCode::BAD_GATEWAY,
        AtlasError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: AtlasError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, status = status.as_u16(), "Request failed");
    }
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("Invalid insight id: {id}") })),
        )
            .into_response()
    })
}

// --- Handlers ---

pub async fn api_insert_insight(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewInsight>,
) -> Response {
    match state.pipeline.insert(body).await {
        Ok(outcome) => {
            let status = if outcome.duplicate {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn api_insight_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.reader.get_insight(id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn api_insight_relations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<RelationsQuery>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let top_k = params.top_k.unwrap_or(DEFAULT_TOP_K);
    match state.reader.supporters_and_challengers(id, top_k).await {
        Ok(split) => Json(split).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn api_graph(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GraphQuery>,
) -> Response {
    let depth = params.depth.unwrap_or(DEFAULT_DEPTH);
    let budget = params.budget.unwrap_or(DEFAULT_BUDGET);
    match state.reader.expand(params.node_id, depth, budget).await {
        Ok(subgraph) => Json(subgraph).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn api_clusters(State(state): State<Arc<AppState>>) -> Response {
    match state.reader.list_clusters().await {
        Ok(clusters) => Json(serde_json::json!({ "clusters": clusters })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn api_relabel_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RelabelRequest>,
) -> Response {
    match state
        .pipeline
        .relabel_cluster(&id, &body.title, &body.summary)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(e),
    }
}
