//! Trigger API router.
//!
//! A thin operational surface over the pipeline: enqueue runs, execute them,
//! sweep for inconsistencies. Handlers do their SQLite and LLM work on the
//! blocking pool; the connection lives behind one mutex and every state
//! transition below it is a conditional UPDATE, so holding the lock for a
//! whole execution is correct, just serialized per process.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::Connection;
use tower_http::cors::CorsLayer;

use super::error::ApiError;
use super::types::{ApiContext, EnqueueRunRequest};
use crate::config::APP_VERSION;
use crate::db::runs::{NewRun, RunStore};
use crate::reconcile::{reconcile, ReconcileOptions, ReconcileSummary};
use crate::worker::{DiagnosisRun, RunWorker};

/// Build the trigger API router.
pub fn api_router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/api/runs", post(enqueue_run))
        .route("/api/runs/execute-next", post(execute_next))
        .route("/api/runs/:id", get(get_run))
        .route("/api/runs/:id/execute", post(execute_run))
        .route("/api/admin/reconcile", post(reconcile_sweep))
        .route("/health", get(health))
        .with_state(ctx)
        .layer(CorsLayer::permissive())
}

/// Run a closure against the shared connection on the blocking pool.
async fn with_db<T, F>(ctx: ApiContext, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Connection, &RunWorker) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = ctx
            .db
            .lock()
            .map_err(|_| ApiError::Internal("database lock poisoned".to_string()))?;
        f(&conn, &ctx.worker)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
}

async fn enqueue_run(
    State(ctx): State<ApiContext>,
    Json(request): Json<EnqueueRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.patient_id.trim().is_empty() {
        return Err(ApiError::BadRequest("patient_id is required".to_string()));
    }
    if request.organization_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "organization_id is required".to_string(),
        ));
    }

    let new = NewRun {
        patient_id: request.patient_id,
        organization_id: request.organization_id,
        input_config: request.input_config.unwrap_or_else(|| serde_json::json!({})),
        max_retries: request
            .max_retries
            .unwrap_or(ctx.config.default_max_retries),
    };

    let run = with_db(ctx, move |conn, _| {
        Ok(RunStore::new().enqueue(conn, &new)?)
    })
    .await?;

    tracing::info!(run_id = %run.id, patient_id = %run.patient_id, "Run enqueued");
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<DiagnosisRun>, ApiError> {
    let run = with_db(ctx, move |conn, _| Ok(RunStore::new().get(conn, &id)?)).await?;
    Ok(Json(run))
}

/// Claim and execute the next queued run. An empty queue is an idempotent
/// no-op, not an error.
async fn execute_next(
    State(ctx): State<ApiContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = with_db(ctx, |conn, worker| Ok(worker.execute_next(conn)?)).await?;
    match outcome {
        Some(outcome) => Ok(Json(
            serde_json::to_value(outcome).map_err(|e| ApiError::Internal(e.to_string()))?,
        )),
        None => Ok(Json(serde_json::json!({"status": "idle"}))),
    }
}

/// Execute one specific run. A run that is not claimable reports its actual
/// status in a structured conflict, never a bare 500.
async fn execute_run(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    with_db(ctx, move |conn, worker| {
        match worker.execute_run(conn, &id)? {
            Some(outcome) => Ok(Json(
                serde_json::to_value(outcome).map_err(|e| ApiError::Internal(e.to_string()))?,
            )),
            None => {
                let run = RunStore::new().get(conn, &id)?;
                Err(ApiError::RunNotQueued(format!(
                    "run {id} is not queued (status: {})",
                    run.status
                )))
            }
        }
    })
    .await
}

/// Operator endpoint: run one reconciliation sweep. A body of `{}` is a
/// safe dry run.
async fn reconcile_sweep(
    State(ctx): State<ApiContext>,
    Json(options): Json<ReconcileOptions>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    let summary = with_db(ctx, move |conn, _| Ok(reconcile(conn, &options)?)).await?;
    Ok(Json(summary))
}

async fn health(State(ctx): State<ApiContext>) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = with_db(ctx, |conn, _| Ok(RunStore::new().count_by_status(conn)?)).await?;
    let runs: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count.into()))
        .collect();

    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": APP_VERSION,
        "runs": runs,
    })))
}
