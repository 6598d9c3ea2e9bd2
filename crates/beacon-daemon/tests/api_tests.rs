// SPDX-License-Identifier: MIT OR Apache-2.0
//! Router-level tests over the in-memory wiring.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use beacon_config::RunnerConfig;
use beacon_daemon::bootstrap;
use http_body_util::BodyExt as _;
use serde_json::{Value, json};
use tower::ServiceExt as _;

fn test_config() -> RunnerConfig {
    RunnerConfig {
        admin_tokens: vec!["admin-secret".into()],
        // Keep background loops quiet in router tests.
        worker_count: 1,
        ..Default::default()
    }
}

async fn test_app() -> Router {
    let runner = bootstrap::build(test_config()).await.expect("runner builds");
    runner.router()
}

fn job_body(id: &str) -> Value {
    json!({
        "id": id,
        "version": "v1",
        "benchmark": {
            "name": "llm-bench",
            "container": {
                "image": "beacon/bench",
                "tag": "latest",
                "command": ["run"],
                "resources": {"cpu": 1.0, "mem": "512mb"}
            },
            "input": {"type": "inline", "data": {"prompt": "hi"}, "hash": "in-hash"}
        },
        "constraints": {"regions": ["US"], "min_regions": 1},
        "metadata": {"nonce": format!("nonce-{id}")}
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_job(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_generates_a_request_id() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn request_id_is_echoed_even_on_errors() {
    let app = test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("x-request-id", "req-123")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()["x-request-id"], "req-123");
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "invalid_json");
}

#[tokio::test]
async fn job_submission_is_accepted_and_queryable() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(post_job(&job_body("api-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["id"], "api-1");
    assert_eq!(body["status"], "enqueued");

    let response = app
        .oneshot(Request::get("/jobs/api-1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "api-1");
}

#[tokio::test]
async fn idempotency_key_replays_with_200() {
    let app = test_app().await;
    let first = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("idempotency-key", "idem-1")
        .body(Body::from(job_body("api-1").to_string()))
        .unwrap();
    assert_eq!(
        app.clone().oneshot(first).await.unwrap().status(),
        StatusCode::ACCEPTED
    );

    let second = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("idempotency-key", "idem-1")
        .body(Body::from(job_body("api-2").to_string()))
        .unwrap();
    let response = app.oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "api-1");
    assert_eq!(body["idempotent"], true);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::get("/jobs/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// --- Admin surface ---

fn admin_get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn admin_requires_a_bearer_token() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(admin_get("/admin/flags", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(admin_get("/admin/flags", Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn flags_roundtrip_and_take_effect() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(admin_get("/admin/flags", Some("admin-secret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["trust_enforce"], false);

    let update = Request::builder()
        .method("PUT")
        .uri("/admin/flags")
        .header("authorization", "Bearer admin-secret")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"trust_enforce": true}).to_string()))
        .unwrap();
    let response = app.clone().oneshot(update).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["trust_enforce"], true);

    // Trust enforcement now rejects unsigned submissions.
    let response = app.oneshot(post_job(&job_body("api-3"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "missing_field:signature");
}

#[tokio::test]
async fn config_view_is_redacted() {
    let runner = bootstrap::build(RunnerConfig {
        admin_tokens: vec!["admin-secret".into()],
        receipt_private_key: Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".into()),
        ..Default::default()
    })
    .await
    .unwrap();
    let app = runner.router();
    let response = app
        .oneshot(admin_get("/admin/config", Some("admin-secret")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["receipt_private_key"], "***");
    assert_eq!(body["admin_tokens"], "1 configured");
}

#[tokio::test]
async fn queue_stats_report_depths_and_breaker() {
    let app = test_app().await;
    let response = app
        .oneshot(admin_get("/admin/queue-stats", Some("admin-secret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["queue"], "jobs");
    assert_eq!(body["breaker"]["state"], "closed");
    assert!(body["depths"]["ready"].is_number());
}

#[tokio::test]
async fn republish_unknown_job_is_404() {
    let app = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/admin/republish-job")
        .header("authorization", "Bearer admin-secret")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"job_id": "ghost"}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resource_stats_expose_metrics_and_translog() {
    let app = test_app().await;
    // Generate one accepted admission so the counter is non-zero.
    app.clone()
        .oneshot(post_job(&job_body("api-9")))
        .await
        .unwrap();
    let response = app
        .oneshot(admin_get("/admin/resource-stats", Some("admin-secret")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["metrics"]["counters"]["admission_accepted"], 1);
    assert!(body["transparency_log"]["entries"].is_number());
}
