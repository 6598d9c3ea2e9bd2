// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outbox publisher: drains unpublished rows to the work queue in strict
//! `seq` order.
//!
//! Runs as a single task per process. A failed enqueue stops the current
//! batch so ordering is preserved; the row is retried on the next tick.

use crate::JobStore;
use beacon_queue::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Rows loaded per tick.
const BATCH_LIMIT: usize = 100;

/// The outbox publisher loop.
pub struct OutboxPublisher {
    store: Arc<dyn JobStore>,
    queue: Arc<WorkQueue>,
    tick: Duration,
}

impl OutboxPublisher {
    /// Publisher draining `store` into `queue` every `tick`.
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<WorkQueue>, tick: Duration) -> Self {
        Self { store, queue, tick }
    }

    /// Publish one batch. Returns how many rows were published.
    ///
    /// Exposed separately from [`run`](Self::run) so tests and admin
    /// tooling can drive a tick synchronously.
    pub async fn publish_batch(&self) -> usize {
        let pending = match self.store.unpublished_outbox(BATCH_LIMIT).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "outbox load failed; will retry next tick");
                return 0;
            }
        };

        let mut published = 0;
        for entry in pending {
            if let Err(err) = self.queue.produce(entry.payload.clone()).await {
                warn!(seq = entry.seq, error = %err, "outbox enqueue failed; stopping batch");
                break;
            }
            if let Err(err) = self.store.mark_outbox_published(entry.seq).await {
                // The message is already on the queue; the row will be
                // republished next tick and consumers must dedupe.
                warn!(seq = entry.seq, error = %err, "outbox mark failed after enqueue");
                break;
            }
            published += 1;
        }
        if published > 0 {
            debug!(published, "outbox batch published");
        }
        published
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.publish_batch().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("outbox publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobStore as _, MemoryStore};
    use beacon_breaker::BreakerConfig;
    use beacon_core::{ManualClock, SystemClock};
    use beacon_kv::MemoryKv;
    use beacon_queue::QueueConfig;
    use chrono::{TimeZone as _, Utc};

    fn setup() -> (Arc<MemoryStore>, Arc<WorkQueue>, OutboxPublisher) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let kv = Arc::new(MemoryKv::new(Arc::new(clock.clone())));
        let queue = Arc::new(WorkQueue::new(
            kv,
            Arc::new(clock),
            QueueConfig::named("jobs"),
            BreakerConfig::default(),
        ));
        let publisher = OutboxPublisher::new(
            store.clone(),
            queue.clone(),
            Duration::from_millis(50),
        );
        (store, queue, publisher)
    }

    #[tokio::test]
    async fn batch_publishes_in_seq_order_and_marks_rows() {
        let (store, queue, publisher) = setup();
        for i in 0..3 {
            store
                .idempotent_create(None, &format!("j{i}"), "{}", "jobs", &format!("p{i}"))
                .await
                .unwrap();
        }

        assert_eq!(publisher.publish_batch().await, 3);
        assert!(store.unpublished_outbox(10).await.unwrap().is_empty());

        // Queue receives payloads in seq order.
        for expected in ["p0", "p1", "p2"] {
            let claim = queue.claim("w").await.unwrap().unwrap();
            assert_eq!(claim.message.payload, expected);
        }
    }

    #[tokio::test]
    async fn second_batch_is_a_no_op_when_everything_is_published() {
        let (store, _, publisher) = setup();
        store
            .idempotent_create(None, "j1", "{}", "jobs", "p")
            .await
            .unwrap();
        assert_eq!(publisher.publish_batch().await, 1);
        assert_eq!(publisher.publish_batch().await, 0);
    }

    #[tokio::test]
    async fn store_outage_is_retried_not_fatal() {
        let (store, _, publisher) = setup();
        store
            .idempotent_create(None, "j1", "{}", "jobs", "p")
            .await
            .unwrap();
        store.set_down(true);
        assert_eq!(publisher.publish_batch().await, 0);
        store.set_down(false);
        assert_eq!(publisher.publish_batch().await, 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let queue = Arc::new(WorkQueue::new(
            kv,
            clock,
            QueueConfig::named("jobs"),
            BreakerConfig::default(),
        ));
        let publisher = OutboxPublisher::new(store, queue, Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(publisher.run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
