// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replay nonce guard and per-identity signature-failure rate limiting.

use crate::{Kv, KvError};
use std::sync::Arc;
use std::time::Duration;

/// Signature failures tolerated per `(ip, kid)` within the window.
pub const FAILURE_THRESHOLD: i64 = 5;

/// Sliding window for the failure counter.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Result of a replay check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The `(kid, nonce)` pair was fresh and is now reserved.
    Fresh,
    /// The pair was already present: a replay.
    Replayed,
}

/// Short-TTL nonce fingerprints keyed by `(kid, nonce)`.
pub struct ReplayGuard {
    kv: Arc<dyn Kv>,
    ttl: Duration,
}

impl ReplayGuard {
    /// Guard whose reservations live for `ttl` (the timestamp max-age).
    pub fn new(kv: Arc<dyn Kv>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Atomically reserve `(kid, nonce)`.
    ///
    /// The stored value is the submission timestamp, useful when inspecting
    /// the store during an incident.
    pub async fn check_and_reserve(
        &self,
        kid: &str,
        nonce: &str,
        timestamp: &str,
    ) -> Result<ReplayOutcome, KvError> {
        let key = format!("replay:{kid}:{nonce}");
        let fresh = self.kv.set_nx_ttl(&key, timestamp, self.ttl).await?;
        Ok(if fresh {
            ReplayOutcome::Fresh
        } else {
            ReplayOutcome::Replayed
        })
    }
}

/// Sliding-window counter of signature failures per `(client_ip, kid)`.
pub struct FailureCounter {
    kv: Arc<dyn Kv>,
}

impl FailureCounter {
    /// Counter over the given KV store.
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(ip: &str, kid: &str) -> String {
        format!("sigfail:{ip}:{kid}")
    }

    /// Whether this identity has already exhausted its failure budget.
    pub async fn is_limited(&self, ip: &str, kid: &str) -> Result<bool, KvError> {
        let current = self
            .kv
            .get(&Self::key(ip, kid))
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(current >= FAILURE_THRESHOLD)
    }

    /// Record one signature failure, returning the updated count.
    pub async fn record_failure(&self, ip: &str, kid: &str) -> Result<i64, KvError> {
        self.kv.incr_ttl(&Self::key(ip, kid), FAILURE_WINDOW).await
    }
}
