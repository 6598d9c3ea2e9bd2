// SPDX-License-Identifier: MIT OR Apache-2.0

//! Admin surface, protected by bearer auth and a token-bucket rate limit.

use crate::middleware::{AdminGate, admin_auth};
use crate::{ApiError, AppState};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// Build the admin router.
pub fn router(state: AppState) -> Router<AppState> {
    let gate = AdminGate::new(state.config.admin_tokens.clone());
    Router::new()
        .route("/flags", get(cmd_get_flags).put(cmd_put_flags))
        .route("/config", get(cmd_get_config))
        .route("/queue-stats", get(cmd_queue_stats))
        .route("/queue-dead", get(cmd_queue_dead))
        .route("/queue-dead/purge", post(cmd_purge_dead))
        .route("/republish-job", post(cmd_republish_job))
        .route("/repair-stuck-jobs", post(cmd_repair_stuck))
        .route("/resource-stats", get(cmd_resource_stats))
        .route("/executions", get(cmd_executions))
        .layer(axum::middleware::from_fn_with_state(gate, admin_auth))
}

async fn cmd_get_flags(State(state): State<AppState>) -> Json<serde_json::Value> {
    let flags = state.pipeline.flags();
    Json(json!({
        "trust_enforce": flags.trust_enforce,
        "sig_bypass": flags.sig_bypass,
        "replay_protection_enabled": flags.replay_protection,
    }))
}

/// Body of a flags update; absent fields are untouched.
#[derive(Debug, Deserialize)]
struct FlagsUpdate {
    trust_enforce: Option<bool>,
    sig_bypass: Option<bool>,
    replay_protection_enabled: Option<bool>,
}

async fn cmd_put_flags(
    State(state): State<AppState>,
    Json(update): Json<FlagsUpdate>,
) -> Json<serde_json::Value> {
    state.pipeline.set_flags(|flags| {
        if let Some(v) = update.trust_enforce {
            flags.trust_enforce = v;
        }
        if let Some(v) = update.sig_bypass {
            flags.sig_bypass = v;
        }
        if let Some(v) = update.replay_protection_enabled {
            flags.replay_protection = v;
        }
    });
    cmd_get_flags(State(state)).await
}

async fn cmd_get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config.redacted())
}

async fn cmd_queue_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let depths = state
        .queue
        .depths()
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    state.metrics.gauge("queue_depth_ready", depths.ready as i64);
    Ok(Json(json!({
        "queue": state.config.jobs_queue_name,
        "depths": depths,
        "breaker": state.queue.breaker_stats(),
    })))
}

#[derive(Debug, Deserialize)]
struct DeadQuery {
    #[serde(default = "default_dead_limit")]
    limit: usize,
}

fn default_dead_limit() -> usize {
    50
}

async fn cmd_queue_dead(
    State(state): State<AppState>,
    Query(query): Query<DeadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dead = state
        .queue
        .dead_letters(query.limit)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(json!({ "count": dead.len(), "messages": dead })))
}

async fn cmd_purge_dead(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let purged = state
        .queue
        .purge_dead()
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    info!(purged, "dead letters purged via admin");
    Ok(Json(json!({ "purged": purged })))
}

#[derive(Debug, Deserialize)]
struct RepublishRequest {
    job_id: String,
}

async fn cmd_republish_job(
    State(state): State<AppState>,
    Json(req): Json<RepublishRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Confirm the job exists before appending another outbox row.
    state
        .store
        .job(&req.job_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "job not found"))?;
    let payload = json!({ "job_id": req.job_id }).to_string();
    let seq = state
        .store
        .append_outbox(&state.config.jobs_queue_name, &payload)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    info!(job_id = %req.job_id, seq, "job republished via admin");
    Ok(Json(json!({ "job_id": req.job_id, "outbox_seq": seq })))
}

#[derive(Debug, Deserialize)]
struct RepairRequest {
    #[serde(default = "default_repair_secs")]
    older_than_secs: u64,
}

fn default_repair_secs() -> u64 {
    600
}

async fn cmd_repair_stuck(
    State(state): State<AppState>,
    Json(req): Json<RepairRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repaired = state
        .store
        .repair_stuck_jobs(Duration::from_secs(req.older_than_secs))
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    info!(count = repaired.len(), "stuck jobs repaired via admin");
    Ok(Json(json!({ "repaired": repaired })))
}

async fn cmd_resource_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "queue_breaker": state.queue.breaker_stats(),
        "transparency_log": {
            "entries": state.translog.len(),
            "root": state.translog.root(),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct ExecutionsQuery {
    job_id: String,
}

async fn cmd_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let executions = state
        .store
        .executions_for_job(&query.job_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(json!({ "job_id": query.job_id, "executions": executions })))
}
