use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::db::DbHandle;
use super::models::{GenerationResult, Job, Request, StepRecord, TriggerEvent};
use super::orchestrator::GenerationPipeline;
use super::quota::{Plan, QuotaDecision, QuotaLedger};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub pipeline: Arc<GenerationPipeline>,
    pub quota: Arc<dyn QuotaLedger>,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRequestPayload {
    pub principal_id: String,
    pub prompt: String,
    pub plan: String,
}

#[derive(Serialize)]
pub struct CreatedRequest {
    pub request: Request,
    pub job: Job,
}

#[derive(Serialize)]
pub struct JobDetail {
    pub job: Job,
    pub trace: Vec<StepRecord>,
    pub result: Option<GenerationResult>,
}

#[derive(Deserialize)]
pub struct QuotaQuery {
    pub plan: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/requests", post(create_request))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/run", post(trigger_job))
        .route("/api/jobs/{id}/result", get(get_result))
        .route("/api/quota/{principal}", get(get_quota))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Creates the immutable Request and its single Pending Job. Generation
/// does not start here; a separate trigger delivers the job to the
/// pipeline.
async fn create_request(
    State(state): State<SharedState>,
    Json(payload): Json<CreateRequestPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("Prompt is required".into()));
    }
    let plan = Plan::from_str(&payload.plan).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let principal_id = payload.principal_id;
    let prompt = payload.prompt;
    let (request, job) = state
        .db
        .call(move |db| {
            let request = db.create_request(&principal_id, &prompt, plan)?;
            let job = db.create_job(request.id)?;
            Ok((request, job))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(CreatedRequest { request, job })))
}

/// Trigger delivery. At-least-once by design: re-posting for a terminal
/// job is accepted and the pipeline treats it as a no-op.
async fn trigger_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = state
        .db
        .call(move |db| db.get_job_context(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let Some((job, request)) = ctx else {
        return Err(ApiError::NotFound(format!("Job {} not found", id)));
    };

    let event = TriggerEvent {
        job_id: job.id,
        request_id: request.id,
        principal_id: request.principal_id,
    };
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        if let Err(e) = pipeline.run(event).await {
            tracing::error!(job_id = id, error = %e, "pipeline run failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            let Some(job) = db.get_job(id)? else {
                return Ok(None);
            };
            let trace = db.get_trace(id)?;
            let result = db.get_result(id)?;
            Ok(Some(JobDetail { job, trace, result }))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("Job {} not found", id))),
    }
}

/// Poll surface for consumers. 404 until the job reaches a terminal
/// status and its Result row exists.
async fn get_result(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .db
        .call(move |db| db.get_result(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match result {
        Some(result) => Ok(Json(result)),
        None => Err(ApiError::NotFound(format!("No result for job {}", id))),
    }
}

/// Pre-flight check. Reads the ledger without consuming.
async fn get_quota(
    State(state): State<SharedState>,
    Path(principal): Path<String>,
    Query(query): Query<QuotaQuery>,
) -> Result<Json<QuotaDecision>, ApiError> {
    let plan = Plan::from_str(&query.plan).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let decision = state
        .quota
        .peek(&principal, plan)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(decision))
}

// ── Tests ─────────────────────────────────────────────────────────────
