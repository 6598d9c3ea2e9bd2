// SPDX-License-Identifier: MIT OR Apache-2.0

//! Queue consumer: claims job messages and drives the multi-region
//! executor.
//!
//! Duplicate delivery is expected (outbox republish, reaper re-enqueue);
//! consumers tolerate it by skipping jobs that already reached a terminal
//! status.

use beacon_core::JobSpec;
use beacon_executor::{ExecutorError, MultiRegionExecutor};
use beacon_queue::{Claim, WorkQueue};
use beacon_store::{JobStatus, JobStore};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Payload of a jobs-queue message.
#[derive(Debug, Deserialize)]
struct JobMessage {
    job_id: String,
}

/// One consumer worker.
pub struct Consumer {
    worker_id: String,
    queue: Arc<WorkQueue>,
    store: Arc<dyn JobStore>,
    executor: Arc<MultiRegionExecutor>,
    fetch_timeout: Duration,
}

impl Consumer {
    /// A worker named `worker_id` draining `queue`.
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<WorkQueue>,
        store: Arc<dyn JobStore>,
        executor: Arc<MultiRegionExecutor>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            store,
            executor,
            fetch_timeout,
        }
    }

    /// Claim and process one message. Returns `false` when the queue was
    /// empty.
    pub async fn tick(&self) -> bool {
        let claim = match self.queue.claim(&self.worker_id).await {
            Ok(Some(claim)) => claim,
            Ok(None) => return false,
            Err(err) => {
                warn!(worker_id = %self.worker_id, error = %err, "claim failed");
                return false;
            }
        };
        self.process(claim).await;
        true
    }

    async fn process(&self, claim: Claim) {
        let message: JobMessage = match serde_json::from_str(&claim.message.payload) {
            Ok(m) => m,
            Err(err) => {
                warn!(msg_id = %claim.msg_id, error = %err, "malformed job message");
                let _ = self.queue.nack(&claim, "malformed payload").await;
                return;
            }
        };

        let job = match self.store.job(&message.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %message.job_id, "message references unknown job");
                let _ = self.queue.nack(&claim, "unknown job").await;
                return;
            }
            Err(err) => {
                warn!(job_id = %message.job_id, error = %err, "job load failed");
                let _ = self.queue.nack(&claim, "store unavailable").await;
                return;
            }
        };

        // Duplicate delivery: terminal jobs are acked away.
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            debug!(job_id = %job.jobspec_id, "duplicate delivery of terminal job");
            let _ = self.queue.ack(&claim).await;
            return;
        }

        let spec: JobSpec = match serde_json::from_value(job.jobspec_data.clone()) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(job_id = %job.jobspec_id, error = %err, "persisted jobspec is malformed");
                let _ = self.queue.nack(&claim, "malformed jobspec").await;
                return;
            }
        };

        if let Err(err) = self
            .store
            .update_job_status(&job.jobspec_id, JobStatus::Processing)
            .await
        {
            warn!(job_id = %job.jobspec_id, error = %err, "status update failed");
        }

        match self.executor.execute(&spec).await {
            Ok(outcome) => {
                info!(
                    job_id = %outcome.job_id,
                    completed = outcome.completed,
                    success_count = outcome.success_count,
                    "job processed"
                );
                let _ = self.queue.ack(&claim).await;
            }
            Err(ExecutorError::InsufficientRegions { .. }) => {
                // Marketplace population changes over time; retry later.
                if let Err(err) = self
                    .store
                    .update_job_status(&job.jobspec_id, JobStatus::Created)
                    .await
                {
                    warn!(job_id = %job.jobspec_id, error = %err, "status revert failed");
                }
                let _ = self.queue.nack(&claim, "insufficient candidate regions").await;
            }
            Err(err) => {
                warn!(job_id = %job.jobspec_id, error = %err, "execution errored");
                let _ = self.queue.nack(&claim, &err.to_string()).await;
            }
        }
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "consumer started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                processed = self.tick() => {
                    if !processed {
                        tokio::time::sleep(self.fetch_timeout).await;
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "consumer stopped");
    }
}

/// Spawn the retry mover and reaper for a queue.
pub fn spawn_queue_maintenance(
    queue: Arc<WorkQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = queue.move_due_retries().await {
                        warn!(error = %err, "retry mover failed");
                    }
                    if let Err(err) = queue.reap_expired().await {
                        warn!(error = %err, "reaper failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("queue maintenance stopped");
    })
}
