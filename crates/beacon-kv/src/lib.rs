// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "KV abstraction backing replay protection, rate limiting, and the work queue."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The [`Kv`] trait is the single seam between the runner and its external
//! KV service. Production uses [`redis::RedisKv`]; tests and DSN-less dev
//! runs use [`memory::MemoryKv`], which honours TTLs against an injected
//! clock.

/// In-memory implementation with virtual-time TTLs.
pub mod memory;
/// Replay nonce guard and signature-failure rate limiting.
pub mod protect;
/// Redis implementation over a connection manager.
pub mod redis;

pub use memory::MemoryKv;
pub use protect::{FailureCounter, ReplayGuard, ReplayOutcome};
pub use redis::RedisKv;

use async_trait::async_trait;
use std::time::Duration;

/// Errors from KV operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The service could not be reached.
    #[error("kv unavailable: {0}")]
    Unavailable(String),
    /// The service answered with an error.
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// Async key-value operations used across the runner.
///
/// String-typed values throughout; callers serialize structured payloads to
/// JSON before storing.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a key with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Write a key with a TTL.
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Atomic set-if-absent with TTL. Returns `true` if the key was written,
    /// `false` if it already existed.
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Increment a counter, applying `ttl` when the key is created.
    /// Returns the post-increment value.
    async fn incr_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;

    /// Delete a key. Returns `true` if it existed.
    async fn del(&self, key: &str) -> Result<bool, KvError>;

    /// Push onto the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Pop from the tail of a list.
    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Read a closed range of a list; negative indexes count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;

    /// List length.
    async fn llen(&self, key: &str) -> Result<usize, KvError>;

    /// Add a member to a sorted set.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), KvError>;

    /// Members with score ≤ `max`, ascending, up to `limit`.
    async fn zrangebyscore(&self, key: &str, max: f64, limit: usize)
    -> Result<Vec<String>, KvError>;

    /// Remove a member from a sorted set. Returns `true` if it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// Count of members in a sorted set.
    async fn zcard(&self, key: &str) -> Result<usize, KvError>;

    /// Keys starting with `prefix`. Used by the reaper to scan claims.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}
