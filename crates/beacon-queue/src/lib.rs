// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "At-least-once work queue engine over the KV abstraction."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Queue layout for a queue named `Q`:
//!
//! - `Q` — FIFO list of ready messages.
//! - `Q:retry` — sorted set of delayed messages scored by due time.
//! - `Q:processing:<msg_id>` — claim record written at claim time.
//! - `Q:dead` — dead-letter list.
//!
//! Delivery is at-least-once: the reaper re-enqueues claims whose visibility
//! deadline passed, so consumers must tolerate duplicates. FIFO holds among
//! non-delayed messages; retried messages re-enter at the back with no
//! ordering relative to fresh ones. Every KV operation runs under a named
//! circuit breaker.

use beacon_breaker::{BreakerError, BreakerStats, CircuitBreaker};
use beacon_core::Clock;
use beacon_kv::{Kv, KvError};
use chrono::{DateTime, Utc};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue tuning parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name; prefixes every key.
    pub name: String,
    /// How long a claim stays valid before the reaper may re-enqueue.
    pub visibility_timeout: Duration,
    /// Delivery attempts before dead-lettering.
    pub max_attempts: u32,
    /// Base for exponential retry backoff.
    pub backoff_base: Duration,
    /// Upper bound on a single backoff delay.
    pub max_backoff: Duration,
}

impl QueueConfig {
    /// Defaults for a named queue.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::from_secs(60),
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// A message travelling through the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    /// Message identifier.
    pub msg_id: String,
    /// Opaque payload; producers serialize their own envelope.
    pub payload: String,
    /// Delivery attempts consumed so far.
    pub attempts: u32,
    /// When the message first entered the queue.
    pub first_enqueued_at: DateTime<Utc>,
}

/// A claim handed to a consumer alongside the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// Claimed message id.
    pub msg_id: String,
    /// Consumer that holds the claim.
    pub worker_id: String,
    /// Instant after which the reaper may re-enqueue.
    pub claim_deadline: DateTime<Utc>,
    /// The claimed message, carried so expiry can re-enqueue it.
    pub message: QueueMessage,
}

/// Outcome of a negative acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for redelivery after the given delay.
    Retried {
        /// Redelivery delay applied.
        delay: Duration,
    },
    /// Attempts exhausted; parked on the dead-letter list.
    DeadLettered,
}

/// Depth snapshot across the queue's four key groups.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    /// Ready messages.
    pub ready: usize,
    /// Delayed messages awaiting their due time.
    pub retry: usize,
    /// Outstanding claims.
    pub processing: usize,
    /// Dead-lettered messages.
    pub dead: usize,
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The KV service failed.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// The KV breaker is open; the operation was not attempted.
    #[error("queue kv circuit breaker is open")]
    BreakerOpen,
    /// A stored message or claim failed to decode.
    #[error("corrupt queue record: {0}")]
    Corrupt(String),
}

impl From<BreakerError<KvError>> for QueueError {
    fn from(err: BreakerError<KvError>) -> Self {
        match err {
            BreakerError::Open { .. } => QueueError::BreakerOpen,
            BreakerError::Inner(e) => QueueError::Kv(e),
        }
    }
}

/// The work queue engine.
pub struct WorkQueue {
    kv: Arc<dyn Kv>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    breaker: CircuitBreaker<KvError>,
}

impl WorkQueue {
    /// Build a queue over the given KV store.
    pub fn new(
        kv: Arc<dyn Kv>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
        breaker_config: beacon_breaker::BreakerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            format!("queue:{}", config.name),
            breaker_config,
            clock.clone(),
        );
        Self {
            kv,
            clock,
            config,
            breaker,
        }
    }

    fn main_key(&self) -> String {
        self.config.name.clone()
    }

    fn retry_key(&self) -> String {
        format!("{}:retry", self.config.name)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.config.name)
    }

    fn processing_key(&self, msg_id: &str) -> String {
        format!("{}:processing:{msg_id}", self.config.name)
    }

    fn processing_prefix(&self) -> String {
        format!("{}:processing:", self.config.name)
    }

    /// Enqueue a fresh message, returning its id.
    pub async fn produce(&self, payload: impl Into<String>) -> Result<String, QueueError> {
        let message = QueueMessage {
            msg_id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            attempts: 0,
            first_enqueued_at: self.clock.now(),
        };
        let encoded = encode(&message)?;
        self.breaker
            .call(self.kv.lpush(&self.main_key(), &encoded))
            .await?;
        debug!(queue = %self.config.name, msg_id = %message.msg_id, "message produced");
        Ok(message.msg_id)
    }

    /// Pop the next ready message and record a claim for `worker_id`.
    ///
    /// Returns `None` when the queue is empty. The claim record outlives the
    /// visibility deadline so the reaper can inspect and re-enqueue it; its
    /// KV TTL is twice the visibility timeout as a garbage-collection
    /// backstop.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Claim>, QueueError> {
        let Some(raw) = self.breaker.call(self.kv.rpop(&self.main_key())).await? else {
            return Ok(None);
        };
        let message: QueueMessage = decode(&raw)?;
        let claim = Claim {
            msg_id: message.msg_id.clone(),
            worker_id: worker_id.to_string(),
            claim_deadline: self.clock.now()
                + chrono::Duration::from_std(self.config.visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            message,
        };
        let key = self.processing_key(&claim.msg_id);
        let encoded = encode(&claim)?;
        self.breaker
            .call(
                self.kv
                    .set_ttl(&key, &encoded, self.config.visibility_timeout * 2),
            )
            .await?;
        Ok(Some(claim))
    }

    /// Acknowledge successful processing: the claim is deleted and the
    /// message leaves the system.
    pub async fn ack(&self, claim: &Claim) -> Result<(), QueueError> {
        self.breaker
            .call(self.kv.del(&self.processing_key(&claim.msg_id)))
            .await?;
        debug!(queue = %self.config.name, msg_id = %claim.msg_id, "message acked");
        Ok(())
    }

    /// Report failed processing.
    ///
    /// Below `max_attempts` the message is scheduled for redelivery with
    /// exponential backoff plus jitter; at the limit it is dead-lettered.
    pub async fn nack(&self, claim: &Claim, reason: &str) -> Result<NackOutcome, QueueError> {
        self.breaker
            .call(self.kv.del(&self.processing_key(&claim.msg_id)))
            .await?;

        let mut message = claim.message.clone();
        message.attempts += 1;

        if message.attempts >= self.config.max_attempts {
            let encoded = encode(&message)?;
            self.breaker
                .call(self.kv.lpush(&self.dead_key(), &encoded))
                .await?;
            warn!(
                queue = %self.config.name,
                msg_id = %message.msg_id,
                attempts = message.attempts,
                reason,
                "message dead-lettered"
            );
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = self.backoff(message.attempts);
        let due = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        let encoded = encode(&message)?;
        self.breaker
            .call(
                self.kv
                    .zadd(&self.retry_key(), due.timestamp_millis() as f64, &encoded),
            )
            .await?;
        debug!(
            queue = %self.config.name,
            msg_id = %message.msg_id,
            attempts = message.attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "message scheduled for retry"
        );
        Ok(NackOutcome::Retried { delay })
    }

    /// Promote due messages from the retry set back onto the main queue.
    /// Returns how many moved.
    pub async fn move_due_retries(&self) -> Result<usize, QueueError> {
        let now_ms = self.clock.now().timestamp_millis() as f64;
        let due = self
            .breaker
            .call(self.kv.zrangebyscore(&self.retry_key(), now_ms, 100))
            .await?;
        let mut moved = 0;
        for member in due {
            // Remove first so a concurrent mover cannot double-promote.
            let removed = self
                .breaker
                .call(self.kv.zrem(&self.retry_key(), &member))
                .await?;
            if !removed {
                continue;
            }
            self.breaker
                .call(self.kv.lpush(&self.main_key(), &member))
                .await?;
            moved += 1;
        }
        if moved > 0 {
            debug!(queue = %self.config.name, moved, "retry messages promoted");
        }
        Ok(moved)
    }

    /// Re-enqueue claims whose visibility deadline passed. The re-enqueue
    /// goes through the nack path, so it counts as a failed attempt.
    pub async fn reap_expired(&self) -> Result<usize, QueueError> {
        let keys = self
            .breaker
            .call(self.kv.scan_prefix(&self.processing_prefix()))
            .await?;
        let now = self.clock.now();
        let mut reaped = 0;
        for key in keys {
            let Some(raw) = self.breaker.call(self.kv.get(&key)).await? else {
                continue;
            };
            let claim: Claim = decode(&raw)?;
            if claim.claim_deadline > now {
                continue;
            }
            self.nack(&claim, "visibility timeout expired").await?;
            info!(
                queue = %self.config.name,
                msg_id = %claim.msg_id,
                worker_id = %claim.worker_id,
                "expired claim reaped"
            );
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Depths across ready / retry / processing / dead.
    pub async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let ready = self.breaker.call(self.kv.llen(&self.main_key())).await?;
        let retry = self.breaker.call(self.kv.zcard(&self.retry_key())).await?;
        let processing = self
            .breaker
            .call(self.kv.scan_prefix(&self.processing_prefix()))
            .await?
            .len();
        let dead = self.breaker.call(self.kv.llen(&self.dead_key())).await?;
        Ok(QueueDepths {
            ready,
            retry,
            processing,
            dead,
        })
    }

    /// Peek up to `limit` dead-lettered messages without removing them.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueMessage>, QueueError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let raws = self
            .breaker
            .call(self.kv.lrange(&self.dead_key(), 0, limit.saturating_sub(1) as i64))
            .await?;
        raws.iter().map(|r| decode(r)).collect()
    }

    /// Drop all dead-lettered messages. Returns how many were purged.
    pub async fn purge_dead(&self) -> Result<usize, QueueError> {
        let count = self.breaker.call(self.kv.llen(&self.dead_key())).await?;
        self.breaker.call(self.kv.del(&self.dead_key())).await?;
        if count > 0 {
            info!(queue = %self.config.name, purged = count, "dead letters purged");
        }
        Ok(count)
    }

    /// Stats for the queue's KV breaker.
    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.config.backoff_base;
        let exp = base.saturating_mul(2u32.saturating_pow(attempts.min(16)));
        let jitter_cap = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        (exp + Duration::from_millis(jitter)).min(self.config.max_backoff)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, QueueError> {
    serde_json::to_string(value).map_err(|e| QueueError::Corrupt(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::ManualClock;
    use beacon_kv::MemoryKv;
    use chrono::TimeZone as _;

    fn queue_with(max_attempts: u32) -> (WorkQueue, ManualClock, Arc<MemoryKv>) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let kv = Arc::new(MemoryKv::new(Arc::new(clock.clone())));
        let config = QueueConfig {
            max_attempts,
            ..QueueConfig::named("jobs")
        };
        let q = WorkQueue::new(
            kv.clone(),
            Arc::new(clock.clone()),
            config,
            beacon_breaker::BreakerConfig::default(),
        );
        (q, clock, kv)
    }

    #[tokio::test]
    async fn fifo_among_fresh_messages() {
        let (q, _, _) = queue_with(5);
        let first = q.produce("a").await.unwrap();
        let second = q.produce("b").await.unwrap();
        let c1 = q.claim("w1").await.unwrap().unwrap();
        let c2 = q.claim("w1").await.unwrap().unwrap();
        assert_eq!(c1.msg_id, first);
        assert_eq!(c2.msg_id, second);
        assert!(q.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_removes_the_claim() {
        let (q, _, _) = queue_with(5);
        q.produce("a").await.unwrap();
        let claim = q.claim("w1").await.unwrap().unwrap();
        q.ack(&claim).await.unwrap();
        let depths = q.depths().await.unwrap();
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.processing, 0);
    }

    #[tokio::test]
    async fn nack_schedules_retry_then_dead_letters() {
        let (q, clock, _) = queue_with(2);
        q.produce("a").await.unwrap();
        let claim = q.claim("w1").await.unwrap().unwrap();
        let outcome = q.nack(&claim, "boom").await.unwrap();
        assert!(matches!(outcome, NackOutcome::Retried { .. }));
        assert_eq!(q.depths().await.unwrap().retry, 1);

        // Not due yet.
        assert_eq!(q.move_due_retries().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(600));
        assert_eq!(q.move_due_retries().await.unwrap(), 1);

        let claim = q.claim("w1").await.unwrap().unwrap();
        assert_eq!(claim.message.attempts, 1);
        let outcome = q.nack(&claim, "boom again").await.unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        let depths = q.depths().await.unwrap();
        assert_eq!(depths.dead, 1);
        assert_eq!(depths.retry, 0);

        let dead = q.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn reaper_requeues_expired_claims_as_failed_attempts() {
        let (q, clock, _) = queue_with(5);
        q.produce("a").await.unwrap();
        let claim = q.claim("w1").await.unwrap().unwrap();
        // Claim still live: nothing to reap.
        assert_eq!(q.reap_expired().await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(q.reap_expired().await.unwrap(), 1);

        // The message is back in the retry set with one attempt consumed.
        clock.advance(chrono::Duration::seconds(600));
        q.move_due_retries().await.unwrap();
        let redelivered = q.claim("w2").await.unwrap().unwrap();
        assert_eq!(redelivered.msg_id, claim.msg_id);
        assert_eq!(redelivered.message.attempts, 1);
    }

    #[tokio::test]
    async fn purge_dead_empties_the_list() {
        let (q, _, _) = queue_with(1);
        q.produce("a").await.unwrap();
        let claim = q.claim("w1").await.unwrap().unwrap();
        q.nack(&claim, "fatal").await.unwrap();
        assert_eq!(q.depths().await.unwrap().dead, 1);
        assert_eq!(q.purge_dead().await.unwrap(), 1);
        assert_eq!(q.depths().await.unwrap().dead, 0);
    }

    #[tokio::test]
    async fn kv_outage_surfaces_and_eventually_opens_breaker() {
        let (q, _, kv) = queue_with(5);
        kv.set_down(true);
        for _ in 0..5 {
            assert!(matches!(
                q.produce("x").await,
                Err(QueueError::Kv(KvError::Unavailable(_)))
            ));
        }
        // Breaker open: the KV store is no longer consulted.
        assert!(matches!(
            q.produce("x").await,
            Err(QueueError::BreakerOpen)
        ));
    }

    #[tokio::test]
    async fn backoff_grows_and_is_capped() {
        let (q, _, _) = queue_with(10);
        let d1 = q.backoff(1);
        let d3 = q.backoff(3);
        assert!(d3 > d1);
        assert!(q.backoff(30) <= q.config.max_backoff);
    }
}
