// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Durable job store with transactional outbox and publisher loop."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Exactly-once persistence with at-least-once downstream delivery.
//!
//! Admission writes a job, its outbox row, and (when present) its
//! idempotency row in a single transaction. The [`outbox::OutboxPublisher`]
//! drains unpublished rows to the work queue in strict `seq` order.

/// In-memory store for tests and DSN-less dev runs.
pub mod memory;
/// Outbox publisher loop.
pub mod outbox;
/// Postgres store over sqlx.
pub mod pg;

pub use memory::MemoryStore;
pub use outbox::OutboxPublisher;
pub use pg::PgStore;

use async_trait::async_trait;
use beacon_core::ExecutionAttempt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted and persisted; outbox row pending or published.
    Created,
    /// A consumer picked the job up.
    Processing,
    /// Multi-region execution finished within tolerance.
    Completed,
    /// Multi-region execution fell below tolerance.
    Failed,
}

impl JobStatus {
    /// Wire string stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse a stored status string.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(JobStatus::Created),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier.
    pub jobspec_id: String,
    /// Canonical JobSpec JSON as admitted.
    pub jobspec_data: serde_json::Value,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// First persistence time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// A transactional outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic sequence number; publication order.
    pub seq: i64,
    /// Destination topic (queue name).
    pub topic: String,
    /// Message payload.
    pub payload: String,
    /// Set once the entry reached the queue.
    pub published_at: Option<DateTime<Utc>>,
}

/// Result of an idempotent create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    /// The persisted job id.
    pub job_id: String,
    /// `true` when a prior submission with the same idempotency key won and
    /// nothing was written.
    pub idempotent_replay: bool,
}

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The database rejected the operation.
    #[error("store error: {0}")]
    Backend(String),
    /// A status update would regress a terminal execution state.
    #[error("execution {id} is terminal; refusing update to {to}")]
    TerminalExecution {
        /// Execution attempt id.
        id: String,
        /// Status the caller requested.
        to: String,
    },
    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Durable store operations used by admission, the publisher, the consumer,
/// and the admin surface.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent transactional create.
    ///
    /// When `idem_key` is present and already recorded, returns the prior
    /// job id with `idempotent_replay = true` and writes nothing. Otherwise
    /// upserts the job row (`status = created`), appends one outbox row, and
    /// records the idempotency key, all in one transaction.
    async fn idempotent_create(
        &self,
        idem_key: Option<&str>,
        job_id: &str,
        canon_json: &str,
        topic: &str,
        payload: &str,
    ) -> Result<CreateOutcome, StoreError>;

    /// Fetch a job row.
    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Move a job to a new lifecycle status.
    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError>;

    /// Append an outbox row outside admission (republish tooling).
    async fn append_outbox(&self, topic: &str, payload: &str) -> Result<i64, StoreError>;

    /// Unpublished outbox rows in strict `seq` order.
    async fn unpublished_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Mark an outbox row as published.
    async fn mark_outbox_published(&self, seq: i64) -> Result<(), StoreError>;

    /// Insert or replace an execution attempt row.
    async fn record_execution(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError>;

    /// Fetch one execution attempt.
    async fn execution(&self, id: &str) -> Result<Option<ExecutionAttempt>, StoreError>;

    /// All execution attempts for a job.
    async fn executions_for_job(&self, job_id: &str)
    -> Result<Vec<ExecutionAttempt>, StoreError>;

    /// Persist an updated attempt, refusing to regress terminal states.
    async fn update_execution(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError>;

    /// Re-append outbox rows for jobs stuck in `created` longer than
    /// `older_than`. Returns the repaired job ids.
    async fn repair_stuck_jobs(&self, older_than: Duration) -> Result<Vec<String>, StoreError>;
}
