use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    BatchInfo, BatchRequest, BatchStatus, FinalOutput, NodeMetrics, TaskView,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::batches::submit_batch;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/batches", post(create_batch))
        .route("/api/v1/batches/:id", get(get_batch))
        .route("/api/v1/batches/:id/results", get(get_batch_results))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/nodes", get(list_nodes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea un batch y lanza su driver en segundo plano
async fn create_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchInfo>), (StatusCode, String)> {
    match submit_batch(&state, req) {
        Ok(info) => {
            info!("POST batch {} -> {} tareas", info.id, info.total_tasks);
            Ok((StatusCode::CREATED, Json(info)))
        }
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatchInfo>, StatusCode> {
    state
        .batches()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// Salida final persistida; 409 mientras el batch sigue corriendo
async fn get_batch_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FinalOutput>, StatusCode> {
    let status = state
        .batches()
        .get(&id)
        .map(|b| b.status)
        .ok_or(StatusCode::NOT_FOUND)?;

    if matches!(status, BatchStatus::Accepted | BatchStatus::Running) {
        return Err(StatusCode::CONFLICT);
    }

    match state.aggregator.load_output(&id) {
        Ok(Some(output)) => Ok(Json(output)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("leyendo salida del batch {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, StatusCode> {
    let task = state.scheduler.task(&id).ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(TaskView {
        owner: state.scheduler.owner(&id),
        outcome: state.aggregator.result(&id).map(|r| r.outcome),
        task_id: task.id,
        batch_id: task.batch_id,
        status: task.status,
        attempt: task.attempt,
        weight: task.weight,
    }))
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeMetrics>> {
    Json(state.registry.snapshot())
}
