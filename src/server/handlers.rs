use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::models::{
    CreateWorkerRequest, DeleteJobQuery, ErrorResponse, JobResultView, JobView, SubmitJobRequest,
};
use super::state::ServerState;
use crate::job::TranslationJob;
use crate::pool::WorkerPool;
use crate::task::TranslateTask;

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn run_server(
    pool: Arc<WorkerPool>,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(ServerState { pool });
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs).post(submit_job).delete(delete_job))
        .route("/api/results", get(list_results))
        .route("/api/workers", get(list_workers).post(create_worker))
        .route("/api/workers/:id/start", post(start_worker))
        .route("/api/workers/:id/stop", post(stop_worker))
        .route("/api/workers/:id", delete(delete_worker))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| "failed to bind server address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn list_jobs(State(state): State<Arc<ServerState>>) -> Json<Vec<JobView>> {
    let jobs = state.pool.store().jobs().await;
    Json(jobs.iter().map(JobView::from).collect())
}

async fn submit_job(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    let task = payload
        .task
        .parse::<TranslateTask>()
        .map_err(bad_request)?;
    let job = TranslationJob::new(
        task,
        payload.description.unwrap_or_default(),
        payload.submitter.unwrap_or_default(),
    );
    let view = JobView::from(&job);
    state.pool.store().submit(job).await.map_err(bad_request)?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn delete_job(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<DeleteJobQuery>,
) -> Result<StatusCode, ApiError> {
    let task = query.task.parse::<TranslateTask>().map_err(bad_request)?;
    state
        .pool
        .store()
        .delete_job(&task)
        .await
        .map_err(bad_request)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_results(State(state): State<Arc<ServerState>>) -> Json<Vec<JobResultView>> {
    let results = state.pool.store().results().await;
    Json(results.iter().map(JobResultView::from).collect())
}

async fn list_workers(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.pool.list().await)
}

async fn create_worker(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<CreateWorkerRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if payload.endpoint.trim().is_empty() {
        return Err(bad_request(anyhow::anyhow!("endpoint is required")));
    }
    let record = state
        .pool
        .create_worker(payload.gpu.trim(), payload.endpoint.trim())
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": record.id }))))
}

async fn start_worker(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.pool.start_worker(&id).await.map_err(bad_request)?;
    Ok(StatusCode::OK)
}

async fn stop_worker(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.pool.stop_worker(&id).await.map_err(bad_request)?;
    Ok(StatusCode::OK)
}

async fn delete_worker(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.pool.delete_worker(&id).await.map_err(bad_request)?;
    Ok(StatusCode::NO_CONTENT)
}

fn bad_request(err: anyhow::Error) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: format!("{:#}", err),
        }),
    )
}

fn internal_error(err: anyhow::Error) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{:#}", err),
        }),
    )
}
