use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info};

use dagline_core::status::RunStatus;
use dagline_core::types::{EngineType, RunId};

use crate::connection;
use crate::error::ApiError;
use crate::state::AppState;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

// GET /api/metrics — free-form performance metrics
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = state
        .store
        .count_by_status()
        .await
        .map_err(|e| ApiError::from_core(e, uri.path()))?;

    let by_status: serde_json::Map<String, serde_json::Value> = counts
        .iter()
        .map(|(status, count)| (status.to_string(), serde_json::json!(count)))
        .collect();
    let total: usize = counts.values().sum();

    Ok(Json(serde_json::json!({
        "runs": { "total": total, "by_status": by_status },
        "event_subscribers": state.bus.subscriber_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    })))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_limit() -> usize {
    20
}

// GET /api/dag-runs?limit&offset&status
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
    uri: Uri,
) -> Result<Json<serde_json::Value>, ApiError> {
    // An invalid status filter is a client error, never silently ignored
    let status = match &q.status {
        Some(raw) => Some(
            RunStatus::parse_lenient(raw)
                .map_err(|e| ApiError::validation(e.to_string(), uri.path()))?,
        ),
        None => None,
    };

    let (items, total) = state
        .store
        .list_runs(q.limit, q.offset, status)
        .await
        .map_err(|e| ApiError::from_core(e, uri.path()))?;

    let page = if q.limit == 0 { 1 } else { q.offset / q.limit + 1 };
    Ok(Json(serde_json::json!({
        "items": items,
        "total": total,
        "page": page,
        "limit": q.limit,
    })))
}

// GET /api/dag-runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    uri: Uri,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = RunId::from_string(&id);
    let run = state
        .store
        .get_run(&run_id)
        .await
        .map_err(|e| ApiError::from_core(e, uri.path()))?;
    match run {
        Some(run) => Ok(Json(serde_json::to_value(&run).map_err(|e| {
            ApiError::internal(e.to_string(), uri.path())
        })?)),
        None => Err(ApiError::not_found(format!("Run not found: {id}"), uri.path())),
    }
}

#[derive(Deserialize)]
pub struct CreateRunBody {
    pub workflow_path: String,
    #[serde(default)]
    pub engine_type: Option<String>,
    #[serde(default)]
    pub persist: bool,
}

// POST /api/dag-runs
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Json(body): Json<CreateRunBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.workflow_path.is_empty() {
        return Err(ApiError::validation("workflow_path is required", uri.path()));
    }

    let engine_type = match &body.engine_type {
        Some(raw) => raw
            .parse::<EngineType>()
            .map_err(|e| ApiError::validation(e.to_string(), uri.path()))?,
        None => state.default_engine,
    };

    let run = state
        .launcher
        .launch(&body.workflow_path, engine_type, body.persist)
        .await
        .map_err(|e| ApiError::from_core(e, uri.path()))?;

    info!(run_id = %run.id, workflow = %body.workflow_path, "Run accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "run_id": run.id,
            "status": run.status,
        })),
    ))
}

#[derive(Deserialize)]
pub struct UpdateStatusBody {
    pub status: String,
}

// PATCH /api/dag-runs/{id}/status — restricted to cancellation
pub async fn update_run_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    uri: Uri,
    Json(body): Json<UpdateStatusBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requested = RunStatus::parse_lenient(&body.status)
        .map_err(|e| ApiError::validation(e.to_string(), uri.path()))?;
    if requested != RunStatus::Cancelled {
        return Err(ApiError::validation(
            format!("only 'cancelled' may be requested, got '{requested}'"),
            uri.path(),
        ));
    }

    let run_id = RunId::from_string(&id);
    let updated = state
        .launcher
        .cancel(&run_id)
        .await
        .map_err(|e| ApiError::from_core(e, uri.path()))?;

    Ok(Json(serde_json::to_value(&updated).map_err(|e| {
        ApiError::internal(e.to_string(), uri.path())
    })?))
}

// GET /ws — WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        info!("WebSocket client connected");
        connection::handle_connection(socket, state).await;
        debug!("WebSocket client disconnected");
    })
}
