// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP surface and lifecycle wiring for the Beacon runner.

/// Admin surface handlers.
pub mod admin;
/// Construction of the full runner from configuration.
pub mod bootstrap;
/// Queue consumer worker loop.
pub mod consumer;
/// Request-id propagation and admin bearer auth.
pub mod middleware;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use beacon_admission::AdmissionPipeline;
use beacon_config::RunnerConfig;
use beacon_core::AdmissionError;
use beacon_executor::MultiRegionExecutor;
use beacon_queue::WorkQueue;
use beacon_store::JobStore;
use beacon_telemetry::Metrics;
use beacon_translog::TransparencyLog;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Admission pipeline.
    pub pipeline: Arc<AdmissionPipeline>,
    /// Durable store.
    pub store: Arc<dyn JobStore>,
    /// Jobs work queue.
    pub queue: Arc<WorkQueue>,
    /// Multi-region executor.
    pub executor: Arc<MultiRegionExecutor>,
    /// Transparency log.
    pub translog: Arc<TransparencyLog>,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Startup configuration (flags move at runtime via the pipeline).
    pub config: Arc<RunnerConfig>,
}

/// Uniform error response: `{error, error_code, details?}` with the
/// taxonomy-mapped status.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Human-readable message.
    pub error: String,
    /// Stable taxonomy code, when one applies.
    pub error_code: Option<String>,
    /// Structured detail, e.g. `{"reason": "too_old"}`.
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// An error outside the admission taxonomy.
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            error_code: None,
            details: None,
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        Self {
            status: StatusCode::from_u16(err.code.http_status())
                .unwrap_or(StatusCode::BAD_REQUEST),
            error: err.message.clone(),
            error_code: Some(err.code.code()),
            details: err.details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error });
        if let Some(code) = &self.error_code {
            body["error_code"] = json!(code);
        }
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        (self.status, Json(body)).into_response()
    }
}

/// Build the public router (jobs + health + retry) with the admin surface
/// nested under `/admin`.
pub fn build_app(state: AppState) -> Router {
    let admin = admin::router(state.clone());
    Router::new()
        .route("/health", get(cmd_health))
        .route("/jobs", post(cmd_submit_job))
        .route("/jobs/{job_id}", get(cmd_get_job))
        .route("/executions/{execution_id}/retry", post(cmd_retry_execution))
        .nest("/admin", admin)
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn cmd_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "queue": state.config.jobs_queue_name,
        "time": Utc::now().to_rfc3339(),
    }))
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".into())
}

async fn cmd_submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let idem_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let ip = client_ip(&headers);

    let ticket = state
        .pipeline
        .submit(&body, &ip, idem_key.as_deref())
        .await?;

    if ticket.idempotent_replay {
        return Ok((
            StatusCode::OK,
            Json(json!({ "id": ticket.job_id, "idempotent": true })),
        )
            .into_response());
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": ticket.job_id, "status": "enqueued" })),
    )
        .into_response())
}

async fn cmd_get_job(
    State(state): State<AppState>,
    AxPath(job_id): AxPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .store
        .job(&job_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "job not found"))?;
    let executions = state
        .store
        .executions_for_job(&job_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(json!({
        "id": job.jobspec_id,
        "status": job.status,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "executions": executions,
    })))
}

/// Body of a content-refusal retry intent.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryRequest {
    /// Region of the attempt.
    pub region: String,
    /// Index of the refused question.
    pub question_index: usize,
}

async fn cmd_retry_execution(
    State(state): State<AppState>,
    AxPath(execution_id): AxPath<String>,
    Json(req): Json<RetryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let decision = state
        .executor
        .retry_question(&execution_id, &req.region, req.question_index)
        .await
        .map_err(|e| match e {
            beacon_executor::ExecutorError::Store(beacon_store::StoreError::NotFound(m)) => {
                ApiError::new(StatusCode::NOT_FOUND, m)
            }
            other => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
        })?;
    info!(execution_id = %execution_id, decision = ?decision, "retry intent handled");
    Ok(Json(json!({ "execution_id": execution_id, "decision": decision })))
}
