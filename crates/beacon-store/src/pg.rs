// SPDX-License-Identifier: MIT OR Apache-2.0

//! Postgres [`JobStore`] over sqlx.
//!
//! Queries are runtime-checked; the schema is ensured at startup so a fresh
//! database is usable without external tooling.

use crate::{CreateOutcome, JobRecord, JobStatus, JobStore, OutboxEntry, StoreError};
use async_trait::async_trait;
use beacon_core::ExecutionAttempt;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row as _;
use std::time::Duration;
use tracing::info;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn map_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

impl PgStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await
            .map_err(map_err)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!("postgres store ready");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        // raw_sql runs on the simple protocol, which permits the
        // multi-statement schema batch.
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                jobspec_id   TEXT PRIMARY KEY,
                jobspec_data JSONB NOT NULL,
                status       TEXT NOT NULL,
                created_at   TIMESTAMPTZ NOT NULL,
                updated_at   TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS outbox (
                seq          BIGSERIAL PRIMARY KEY,
                topic        TEXT NOT NULL,
                payload      TEXT NOT NULL,
                published_at TIMESTAMPTZ
            );
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                idem_key   TEXT PRIMARY KEY,
                jobspec_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS executions (
                id            TEXT PRIMARY KEY,
                job_id        TEXT NOT NULL,
                region        TEXT NOT NULL,
                provider_id   TEXT,
                status        TEXT NOT NULL,
                started_at    TIMESTAMPTZ NOT NULL,
                completed_at  TIMESTAMPTZ,
                output_data   JSONB,
                receipt_data  JSONB,
                retry_count   INTEGER NOT NULL DEFAULT 0,
                max_retries   INTEGER NOT NULL DEFAULT 3,
                last_retry_at TIMESTAMPTZ,
                retry_history JSONB NOT NULL DEFAULT '[]'::jsonb,
                is_content_refusal BOOLEAN NOT NULL DEFAULT FALSE
            );
            CREATE INDEX IF NOT EXISTS executions_job_id_idx ON executions (job_id);
            CREATE INDEX IF NOT EXISTS outbox_unpublished_idx
                ON outbox (seq) WHERE published_at IS NULL;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
        let status_raw: String = row.try_get("status").map_err(map_err)?;
        Ok(JobRecord {
            jobspec_id: row.try_get("jobspec_id").map_err(map_err)?,
            jobspec_data: row.try_get("jobspec_data").map_err(map_err)?,
            status: JobStatus::parse(&status_raw)
                .ok_or_else(|| StoreError::Backend(format!("unknown job status '{status_raw}'")))?,
            created_at: row.try_get("created_at").map_err(map_err)?,
            updated_at: row.try_get("updated_at").map_err(map_err)?,
        })
    }

    fn execution_from_row(row: &PgRow) -> Result<ExecutionAttempt, StoreError> {
        let status_raw: String = row.try_get("status").map_err(map_err)?;
        let status = serde_json::from_value(serde_json::Value::String(status_raw.clone()))
            .map_err(|_| StoreError::Backend(format!("unknown execution status '{status_raw}'")))?;
        let retry_history: serde_json::Value = row.try_get("retry_history").map_err(map_err)?;
        Ok(ExecutionAttempt {
            id: row.try_get("id").map_err(map_err)?,
            job_id: row.try_get("job_id").map_err(map_err)?,
            region: row.try_get("region").map_err(map_err)?,
            provider_id: row.try_get("provider_id").map_err(map_err)?,
            status,
            started_at: row.try_get("started_at").map_err(map_err)?,
            completed_at: row.try_get("completed_at").map_err(map_err)?,
            output_data: row.try_get("output_data").map_err(map_err)?,
            receipt_data: row.try_get("receipt_data").map_err(map_err)?,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(map_err)? as u32,
            max_retries: row.try_get::<i32, _>("max_retries").map_err(map_err)? as u32,
            last_retry_at: row.try_get("last_retry_at").map_err(map_err)?,
            retry_history: serde_json::from_value(retry_history)
                .map_err(|e| StoreError::Backend(format!("retry history: {e}")))?,
            is_content_refusal: row.try_get("is_content_refusal").map_err(map_err)?,
        })
    }

    async fn write_execution(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        let status = serde_json::to_value(attempt.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "pending".into());
        let retry_history = serde_json::to_value(&attempt.retry_history)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, job_id, region, provider_id, status, started_at, completed_at,
                output_data, receipt_data, retry_count, max_retries, last_retry_at,
                retry_history, is_content_refusal
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (id) DO UPDATE SET
                provider_id = EXCLUDED.provider_id,
                status = EXCLUDED.status,
                completed_at = EXCLUDED.completed_at,
                output_data = EXCLUDED.output_data,
                receipt_data = EXCLUDED.receipt_data,
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                last_retry_at = EXCLUDED.last_retry_at,
                retry_history = EXCLUDED.retry_history,
                is_content_refusal = EXCLUDED.is_content_refusal
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.job_id)
        .bind(&attempt.region)
        .bind(&attempt.provider_id)
        .bind(status)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .bind(&attempt.output_data)
        .bind(&attempt.receipt_data)
        .bind(attempt.retry_count as i32)
        .bind(attempt.max_retries as i32)
        .bind(attempt.last_retry_at)
        .bind(retry_history)
        .bind(attempt.is_content_refusal)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn idempotent_create(
        &self,
        idem_key: Option<&str>,
        job_id: &str,
        canon_json: &str,
        topic: &str,
        payload: &str,
    ) -> Result<CreateOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        if let Some(key) = idem_key {
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT jobspec_id FROM idempotency_keys WHERE idem_key = $1")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_err)?;
            if let Some((prior,)) = existing {
                tx.rollback().await.map_err(map_err)?;
                return Ok(CreateOutcome {
                    job_id: prior,
                    idempotent_replay: true,
                });
            }
        }

        let data: serde_json::Value = serde_json::from_str(canon_json)
            .map_err(|e| StoreError::Backend(format!("canonical json: {e}")))?;
        let now: DateTime<Utc> = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO jobs (jobspec_id, jobspec_data, status, created_at, updated_at)
            VALUES ($1, $2, 'created', $3, $3)
            ON CONFLICT (jobspec_id) DO UPDATE
                SET jobspec_data = EXCLUDED.jobspec_data, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job_id)
        .bind(&data)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        sqlx::query("INSERT INTO outbox (topic, payload) VALUES ($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        if let Some(key) = idem_key {
            sqlx::query(
                "INSERT INTO idempotency_keys (idem_key, jobspec_id) VALUES ($1, $2)
                 ON CONFLICT (idem_key) DO NOTHING",
            )
            .bind(key)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }

        tx.commit().await.map_err(map_err)?;
        Ok(CreateOutcome {
            job_id: job_id.to_string(),
            idempotent_replay: false,
        })
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE jobspec_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE jobs SET status = $1, updated_at = $2 WHERE jobspec_id = $3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    async fn append_outbox(&self, topic: &str, payload: &str) -> Result<i64, StoreError> {
        let (seq,): (i64,) =
            sqlx::query_as("INSERT INTO outbox (topic, payload) VALUES ($1, $2) RETURNING seq")
                .bind(topic)
                .bind(payload)
                .fetch_one(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(seq)
    }

    async fn unpublished_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, topic, payload, published_at FROM outbox
             WHERE published_at IS NULL ORDER BY seq ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.iter()
            .map(|row| {
                Ok(OutboxEntry {
                    seq: row.try_get("seq").map_err(map_err)?,
                    topic: row.try_get("topic").map_err(map_err)?,
                    payload: row.try_get("payload").map_err(map_err)?,
                    published_at: row.try_get("published_at").map_err(map_err)?,
                })
            })
            .collect()
    }

    async fn mark_outbox_published(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET published_at = $1 WHERE seq = $2")
            .bind(Utc::now())
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn record_execution(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        self.write_execution(attempt).await
    }

    async fn execution(&self, id: &str) -> Result<Option<ExecutionAttempt>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(Self::execution_from_row).transpose()
    }

    async fn executions_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<ExecutionAttempt>, StoreError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE job_id = $1 ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(Self::execution_from_row).collect()
    }

    async fn update_execution(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        if let Some(existing) = self.execution(&attempt.id).await? {
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
        self.write_execution(attempt).await
    }

    async fn repair_stuck_jobs(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let rows = sqlx::query(
            r#"
            SELECT j.jobspec_id FROM jobs j
            WHERE j.status = 'created'
              AND j.updated_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM outbox o
                  WHERE o.published_at IS NULL AND o.payload LIKE '%' || j.jobspec_id || '%'
              )
            ORDER BY j.jobspec_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut repaired = Vec::new();
        for row in rows {
            let job_id: String = row.try_get("jobspec_id").map_err(map_err)?;
            let payload = serde_json::json!({ "job_id": job_id }).to_string();
            self.append_outbox("jobs", &payload).await?;
            repaired.push(job_id);
        }
        Ok(repaired)
    }
}
