// SPDX-License-Identifier: MIT OR Apache-2.0

//! Redis-backed [`Kv`] over a shared connection manager.
//!
//! The manager reconnects on its own; every error here is mapped to
//! [`KvError`] so callers see the same taxonomy as the in-memory store.

use crate::{Kv, KvError};
use async_trait::async_trait;
use ::redis::AsyncCommands as _;
use ::redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

/// Redis-backed KV store. Cheap to clone.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to the given Redis URL.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client =
            ::redis::Client::open(url).map_err(|e| KvError::Unavailable(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        debug!("redis connection manager established");
        Ok(Self { manager })
    }

    fn map_err(err: ::redis::RedisError) -> KvError {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            KvError::Unavailable(err.to_string())
        } else {
            KvError::Backend(err.to_string())
        }
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(Self::map_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.set(key, value).await.map_err(Self::map_err)
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(Self::map_err)
    }

    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        // SET key value NX EX ttl: one atomic round trip.
        let outcome: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(outcome.is_some())
    }

    async fn incr_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.incr(key, 1).await.map_err(Self::map_err)?;
        if count == 1 {
            let _: bool = conn
                .expire(key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(Self::map_err)?;
        }
        Ok(count)
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await.map_err(Self::map_err)?;
        Ok(removed > 0)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.lpush(key, value).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        conn.rpop(key, None).await.map_err(Self::map_err)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        let mut conn = self.manager.clone();
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(Self::map_err)
    }

    async fn llen(&self, key: &str) -> Result<usize, KvError> {
        let mut conn = self.manager.clone();
        conn.llen(key).await.map_err(Self::map_err)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.zadd(key, member, score).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let mut conn = self.manager.clone();
        ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.zrem(key, member).await.map_err(Self::map_err)?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        let mut conn = self.manager.clone();
        conn.zcard(key).await.map_err(Self::map_err)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        Ok(keys)
    }
}
