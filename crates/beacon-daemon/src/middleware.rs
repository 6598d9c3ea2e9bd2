// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request-id propagation and admin bearer auth with rate limiting.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Echo an incoming `X-Request-ID` or generate one, and attach it to every
/// response, errors included.
pub async fn request_id(request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// A small token bucket guarding the admin surface.
pub struct AdminGate {
    tokens: Vec<String>,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// Admin requests admitted per second (burst capacity is double).
const ADMIN_RATE_PER_SEC: f64 = 5.0;

impl AdminGate {
    /// Gate accepting the configured bearer tokens.
    pub fn new(tokens: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            tokens,
            bucket: Mutex::new(Bucket {
                available: ADMIN_RATE_PER_SEC * 2.0,
                last_refill: Instant::now(),
            }),
        })
    }

    fn authorized(&self, header: Option<&str>) -> bool {
        let Some(raw) = header else {
            return false;
        };
        let Some(token) = raw.strip_prefix("Bearer ") else {
            return false;
        };
        self.tokens.iter().any(|t| t == token)
    }

    fn admit(&self) -> bool {
        let mut bucket = self.bucket.lock().expect("gate lock poisoned");
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.available =
            (bucket.available + elapsed * ADMIN_RATE_PER_SEC).min(ADMIN_RATE_PER_SEC * 2.0);
        bucket.last_refill = Instant::now();
        if bucket.available >= 1.0 {
            bucket.available -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Middleware enforcing bearer auth and the rate limit on `/admin`.
pub async fn admin_auth(
    State(gate): State<Arc<AdminGate>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    if !gate.authorized(header) {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({ "error": "missing or invalid admin token" })),
        )
            .into_response();
    }
    if !gate.admit() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(json!({ "error": "admin rate limit exceeded" })),
        )
            .into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_matching() {
        let gate = AdminGate::new(vec!["secret".into()]);
        assert!(gate.authorized(Some("Bearer secret")));
        assert!(!gate.authorized(Some("Bearer wrong")));
        assert!(!gate.authorized(Some("secret")));
        assert!(!gate.authorized(None));
    }

    #[test]
    fn bucket_exhausts_and_refills() {
        let gate = AdminGate::new(vec![]);
        let mut admitted = 0;
        for _ in 0..20 {
            if gate.admit() {
                admitted += 1;
            }
        }
        // Burst capacity bounds a tight loop.
        assert!(admitted >= 10 && admitted < 20, "admitted {admitted}");
    }
}
