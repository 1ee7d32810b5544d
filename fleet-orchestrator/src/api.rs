use std::sync::Arc;

use axum::http::StatusCode;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::orchestrator::ClusterOrchestrator;

pub type AppState = Arc<ClusterOrchestrator>;

#[derive(Deserialize, Debug)]
pub struct SpawnRequest {
    pub count: usize,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Continuous,
    Stopped,
}

#[derive(Deserialize, Debug)]
pub struct SyncRequest {
    pub mode: SyncMode,
}

#[derive(Deserialize, Debug)]
pub struct BroadcastRequest {
    pub command: String,
}

#[derive(Deserialize, Debug)]
pub struct LogsQuery {
    pub path: String,
    pub lines: Option<usize>,
}

#[derive(Deserialize, Debug)]
pub struct ActionsQuery {
    pub limit: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/admin/spawn", post(spawn))
        .route("/admin/start", post(start))
        .route("/admin/kill", post(kill))
        .route("/admin/stop", post(stop))
        .route("/admin/terminate", post(terminate))
        .route("/admin/sync", post(sync))
        .route("/admin/broadcast", post(broadcast))
        .route("/admin/logs", get(logs))
        .route("/admin/actions", get(actions))
        .with_state(state)
}

async fn root() -> &'static str {
    "Fleet Orchestrator Online"
}

async fn get_status(State(orch): State<AppState>) -> impl IntoResponse {
    Json(orch.status().await)
}

async fn spawn(State(orch): State<AppState>, Json(req): Json<SpawnRequest>) -> impl IntoResponse {
    match orch.spawn(req.count).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))).into_response(),
        Err(e) => {
            let status = if e.is_transient() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::BAD_GATEWAY
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn start(State(orch): State<AppState>) -> impl IntoResponse {
    Json(orch.start().await)
}

async fn kill(State(orch): State<AppState>) -> impl IntoResponse {
    Json(orch.kill().await)
}

async fn stop(State(orch): State<AppState>) -> impl IntoResponse {
    Json(orch.stop().await)
}

async fn terminate(State(orch): State<AppState>) -> impl IntoResponse {
    Json(orch.terminate().await)
}

async fn sync(State(orch): State<AppState>, Json(req): Json<SyncRequest>) -> impl IntoResponse {
    let report = match req.mode {
        SyncMode::Continuous => orch.sync_once().await,
        SyncMode::Stopped => orch.sync_stopped().await,
    };
    Json(report)
}

async fn broadcast(State(orch): State<AppState>, Json(req): Json<BroadcastRequest>) -> impl IntoResponse {
    if req.command.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "command is empty" }))).into_response();
    }
    Json(orch.broadcast(&req.command).await).into_response()
}

async fn logs(State(orch): State<AppState>, Query(q): Query<LogsQuery>) -> impl IntoResponse {
    Json(orch.tail_logs(&q.path, q.lines.unwrap_or(50)).await)
}

async fn actions(State(orch): State<AppState>, Query(q): Query<ActionsQuery>) -> impl IntoResponse {
    Json(orch.recent_actions(q.limit.unwrap_or(100).min(1000)))
}
