// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory [`JobStore`] used by tests and DSN-less development runs.

use crate::{CreateOutcome, JobRecord, JobStatus, JobStore, OutboxEntry, StoreError};
use async_trait::async_trait;
use beacon_core::{Clock, ExecutionAttempt, SystemClock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<String, JobRecord>,
    outbox: Vec<OutboxEntry>,
    idempotency: HashMap<String, String>,
    executions: HashMap<String, ExecutionAttempt>,
    next_seq: i64,
}

/// In-memory store. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    down: Arc<Mutex<bool>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Store with timestamps taken from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_seq: 1,
                ..Inner::default()
            })),
            clock,
            down: Arc::new(Mutex::new(false)),
        }
    }

    /// Simulate an outage (`true`) or recovery (`false`).
    pub fn set_down(&self, down: bool) {
        *self.down.lock().expect("store lock poisoned") = down;
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if *self.down.lock().expect("store lock poisoned") {
            return Err(StoreError::Unavailable("memory store marked down".into()));
        }
        Ok(())
    }

    /// Number of persisted jobs. Test helper.
    pub fn job_count(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").jobs.len()
    }

    /// Number of outbox rows ever appended. Test helper.
    pub fn outbox_count(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").outbox.len()
    }

    /// Number of idempotency rows. Test helper.
    pub fn idempotency_count(&self) -> usize {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .idempotency
            .len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn idempotent_create(
        &self,
        idem_key: Option<&str>,
        job_id: &str,
        canon_json: &str,
        topic: &str,
        payload: &str,
    ) -> Result<CreateOutcome, StoreError> {
        self.check_up()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("store lock poisoned");

        if let Some(key) = idem_key {
            if let Some(existing) = inner.idempotency.get(key) {
                return Ok(CreateOutcome {
                    job_id: existing.clone(),
                    idempotent_replay: true,
                });
            }
        }

        let data: serde_json::Value = serde_json::from_str(canon_json)
            .map_err(|e| StoreError::Backend(format!("canonical json: {e}")))?;
        match inner.jobs.get_mut(job_id) {
            Some(row) => {
                row.jobspec_data = data;
                row.updated_at = now;
            }
            None => {
                inner.jobs.insert(
                    job_id.to_string(),
                    JobRecord {
                        jobspec_id: job_id.to_string(),
                        jobspec_data: data,
                        status: JobStatus::Created,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.outbox.push(OutboxEntry {
            seq,
            topic: topic.to_string(),
            payload: payload.to_string(),
            published_at: None,
        });

        if let Some(key) = idem_key {
            inner
                .idempotency
                .entry(key.to_string())
                .or_insert_with(|| job_id.to_string());
        }

        Ok(CreateOutcome {
            job_id: job_id.to_string(),
            idempotent_replay: false,
        })
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        self.check_up()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let row = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        row.status = status;
        row.updated_at = now;
        Ok(())
    }

    async fn append_outbox(&self, topic: &str, payload: &str) -> Result<i64, StoreError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.outbox.push(OutboxEntry {
            seq,
            topic: topic.to_string(),
            payload: payload.to_string(),
            published_at: None,
        });
        Ok(seq)
    }

    async fn unpublished_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .outbox
            .iter()
            .filter(|e| e.published_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_outbox_published(&self, seq: i64) -> Result<(), StoreError> {
        self.check_up()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .outbox
            .iter_mut()
            .find(|e| e.seq == seq)
            .ok_or_else(|| StoreError::NotFound(format!("outbox seq {seq}")))?;
        entry.published_at = Some(now);
        Ok(())
    }

    async fn record_execution(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner
            .executions
            .insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn execution(&self, id: &str) -> Result<Option<ExecutionAttempt>, StoreError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.executions.get(id).cloned())
    }

    async fn executions_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<ExecutionAttempt>, StoreError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut attempts: Vec<ExecutionAttempt> = inner
            .executions
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(attempts)
    }

    async fn update_execution(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(existing) = inner.executions.get(&attempt.id) {
            let regresses = existing.status.is_terminal()
                && existing.status != attempt.status
                && attempt.status != beacon_core::ExecutionStatus::Retrying;
            if regresses {
                return Err(StoreError::TerminalExecution {
                    id: attempt.id.clone(),
                    to: format!("{:?}", attempt.status),
                });
            }
        }
        inner
            .executions
            .insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn repair_stuck_jobs(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
        self.check_up()?;
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.inner.lock().expect("store lock poisoned");

        let stuck: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Created && j.updated_at < cutoff)
            .map(|j| j.jobspec_id.clone())
            .collect();

        let mut repaired = Vec::new();
        for job_id in stuck {
            let payload = serde_json::json!({ "job_id": job_id }).to_string();
            let pending = inner
                .outbox
                .iter()
                .any(|e| e.published_at.is_none() && e.payload.contains(&job_id));
            if pending {
                continue;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.outbox.push(OutboxEntry {
                seq,
                topic: "jobs".into(),
                payload,
                published_at: None,
            });
            repaired.push(job_id);
        }
        Ok(repaired)
    }
}
