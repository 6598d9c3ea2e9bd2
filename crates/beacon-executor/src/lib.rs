// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Multi-region executor: discovery, acquisition, probes, cost caps, partial success."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Fans one job out to every requested region in parallel:
//!
//! ```text
//! created → discovering → acquiring(strict) → acquiring(relax?) → running
//!         → {completed | failed | timeout | canceled}
//! ```
//!
//! Providers inside a region are tried in score order until one succeeds.
//! Estimated cost accumulates across regions; crossing `max_cost` cancels
//! the remaining regions cooperatively. Each successful attempt produces a
//! signed receipt and a transparency-log entry; failed attempts get a log
//! entry without hashes.

/// Offer classification and the strict / relax acquisition windows.
pub mod acquire;
/// Egress-IP preflight probe and GeoIP resolution.
pub mod probe;

pub use acquire::{AcquisitionOutcome, AcquisitionWindow, OfferClass, RegionFilter, classify};
pub use probe::{GeoIpError, GeoIpResolver, HttpGeoIpResolver, StaticGeoIpResolver};

use acquire::{RegionCandidates, acquire_region, candidates_for_region};
use beacon_core::{
    Clock, DEFAULT_MIN_SUCCESS_RATE, ExecutionAttempt, ExecutionEnv, ExecutionStatus, JobSpec,
};
use beacon_kv::Kv;
use beacon_provider::{ProviderClient, ProviderError, TaskSpec};
use beacon_receipt::ReceiptBuilder;
use beacon_store::{JobStatus, JobStore, StoreError};
use beacon_telemetry::Metrics;
use beacon_translog::{EntryDraft, TransparencyLog};
use beacon_trust::ReceiptSigner;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Executor tuning parameters.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Strict acquisition window per region.
    pub strict_timeout: Duration,
    /// Relax (probe) acquisition window per region.
    pub relax_timeout: Duration,
    /// Default per-region score floor.
    pub min_score: f64,
    /// Default per-region price ceiling.
    pub max_price: f64,
    /// TTL of the retry-intent dedup key.
    pub retry_dedup_ttl: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            strict_timeout: Duration::from_secs(20),
            relax_timeout: Duration::from_secs(40),
            min_score: 0.0,
            max_price: f64::MAX,
            retry_dedup_ttl: Duration::from_secs(30),
        }
    }
}

/// Errors that abort a job before any region runs.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Discovery produced candidates for fewer regions than `min_regions`.
    #[error("only {available} of {requested} regions have candidates; {needed} required")]
    InsufficientRegions {
        /// Regions requested by the job.
        requested: usize,
        /// Regions with at least one candidate.
        available: usize,
        /// The job's `min_regions`.
        needed: u32,
    },
    /// Provider discovery failed outright.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The durable store rejected an attempt write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Terminal summary of one region.
#[derive(Debug, Clone, Serialize)]
pub struct RegionOutcome {
    /// The region bucket.
    pub region: String,
    /// Execution attempt id.
    pub execution_id: String,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Provider that ran the attempt, when one was acquired.
    pub provider_id: Option<String>,
    /// Receipt id, for completed attempts.
    pub receipt_id: Option<String>,
    /// Estimated cost charged against the job's cap.
    pub estimated_cost: f64,
    /// Failure detail for failed attempts.
    pub error: Option<String>,
}

/// Terminal summary of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    /// The job id.
    pub job_id: String,
    /// Whether the partial-success policy was met.
    pub completed: bool,
    /// Number of completed regions.
    pub success_count: usize,
    /// Number of requested regions.
    pub total_regions: usize,
    /// `success_count / total_regions`, rounded to two decimals.
    pub success_rate: f64,
    /// Estimated total cost across regions.
    pub total_cost: f64,
    /// Per-region detail.
    pub regions: Vec<RegionOutcome>,
    /// Aggregated failure summaries.
    pub errors: Vec<String>,
}

/// Result of a content-refusal retry intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// The attempt was marked `retrying`.
    Accepted,
    /// The attempt is already `completed` or `running`; nothing to do.
    ShortCircuited,
    /// An identical retry intent arrived moments ago.
    Duplicate,
    /// The attempt is not eligible (not a refusal, or budget exhausted).
    NotEligible,
}

struct CostLedger {
    total: Mutex<f64>,
    cap: Option<f64>,
}

impl CostLedger {
    fn new(cap: Option<f64>) -> Self {
        Self {
            total: Mutex::new(0.0),
            cap,
        }
    }

    /// Add an estimate; returns `true` when the cap is now exceeded.
    fn charge(&self, amount: f64) -> bool {
        let mut total = self.total.lock().expect("cost lock poisoned");
        *total += amount;
        matches!(self.cap, Some(cap) if *total > cap)
    }

    fn total(&self) -> f64 {
        *self.total.lock().expect("cost lock poisoned")
    }
}

/// The multi-region executor.
pub struct MultiRegionExecutor {
    provider: Arc<dyn ProviderClient>,
    geoip: Arc<dyn GeoIpResolver>,
    store: Arc<dyn JobStore>,
    translog: Arc<TransparencyLog>,
    kv: Arc<dyn Kv>,
    signer: Option<ReceiptSigner>,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl MultiRegionExecutor {
    /// Wire the executor to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        geoip: Arc<dyn GeoIpResolver>,
        store: Arc<dyn JobStore>,
        translog: Arc<TransparencyLog>,
        kv: Arc<dyn Kv>,
        signer: Option<ReceiptSigner>,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            provider,
            geoip,
            store,
            translog,
            kv,
            signer,
            metrics,
            clock,
            config,
        }
    }

    fn region_filter(&self, spec: &JobSpec) -> RegionFilter {
        RegionFilter {
            min_score: self.config.min_score,
            max_price: self.config.max_price,
            whitelist: spec.constraints.providers.clone(),
            blacklist: Vec::new(),
        }
    }

    fn task_spec(spec: &JobSpec, job_id: &str) -> TaskSpec {
        TaskSpec {
            job_id: job_id.to_string(),
            image: format!(
                "{}:{}",
                spec.benchmark.container.image, spec.benchmark.container.tag
            ),
            command: spec.benchmark.container.command.clone(),
            env: spec.benchmark.container.env.clone(),
            input: spec.benchmark.input.data.clone(),
            input_hash: spec.benchmark.input.hash.clone(),
            questions: spec.questions.clone(),
        }
    }

    /// Execute a job across all requested regions and evaluate the
    /// partial-success policy. The whole operation is bounded by
    /// `constraints.timeout`.
    pub async fn execute(self: &Arc<Self>, spec: &JobSpec) -> Result<JobOutcome, ExecutorError> {
        let job_id = spec
            .id
            .clone()
            .unwrap_or_else(|| spec.derived_id(self.clock.now()));
        let regions = spec.constraints.regions.clone();

        // Discovery runs once; candidates are grouped per region.
        let offers = self.provider.discover(&spec.constraints).await?;
        let filter = self.region_filter(spec);
        let grouped: Vec<(String, RegionCandidates)> = regions
            .iter()
            .map(|region| {
                (
                    region.clone(),
                    candidates_for_region(&offers, region, &filter),
                )
            })
            .collect();

        let available = grouped.iter().filter(|(_, c)| !c.is_empty()).count();
        if available < spec.constraints.min_regions as usize {
            return Err(ExecutorError::InsufficientRegions {
                requested: regions.len(),
                available,
                needed: spec.constraints.min_regions,
            });
        }

        let ledger = Arc::new(CostLedger::new(spec.constraints.max_cost));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = Arc::new(Self::task_spec(spec, &job_id));
        let provider_timeout = Duration::from_secs(spec.constraints.provider_timeout);

        // Attempts are recorded before the fan-out so a timed-out region can
        // still be finalised from the outside.
        let mut attempts = Vec::with_capacity(grouped.len());
        for (region, _) in &grouped {
            let attempt = ExecutionAttempt::new(
                format!("exec-{}", Uuid::new_v4()),
                job_id.clone(),
                region.clone(),
                self.clock.now(),
            );
            self.store.record_execution(&attempt).await?;
            attempts.push(attempt);
        }

        let mut set: JoinSet<RegionOutcome> = JoinSet::new();
        for ((region, candidates), attempt) in grouped.into_iter().zip(attempts.iter().cloned()) {
            let executor = self.clone();
            let task = task.clone();
            let ledger = ledger.clone();
            let cancel_tx = cancel_tx.clone();
            let cancel_rx = cancel_rx.clone();
            set.spawn(async move {
                executor
                    .run_region(
                        region,
                        candidates,
                        attempt,
                        task,
                        provider_timeout,
                        ledger,
                        cancel_tx,
                        cancel_rx,
                    )
                    .await
            });
        }

        let overall = Duration::from_secs(spec.constraints.timeout);
        let mut outcomes = Vec::new();
        let deadline = tokio::time::Instant::now() + overall;
        loop {
            let joined = tokio::time::timeout_at(deadline, set.join_next()).await;
            match joined {
                Ok(Some(Ok(outcome))) => outcomes.push(outcome),
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "region task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    // Overall timeout: cancel and finalise what is left.
                    let _ = cancel_tx.send(true);
                    set.abort_all();
                    while let Some(res) = set.join_next().await {
                        if let Ok(outcome) = res {
                            outcomes.push(outcome);
                        }
                    }
                    break;
                }
            }
        }

        // Regions whose task never produced an outcome (aborted mid-flight)
        // are finalised as failed.
        for attempt in &attempts {
            if outcomes.iter().any(|o| o.execution_id == attempt.id) {
                continue;
            }
            let outcome = self
                .finalize_failure(
                    attempt.clone(),
                    None,
                    0.0,
                    "job timeout elapsed before the region finished",
                    false,
                )
                .await;
            outcomes.push(outcome);
        }

        outcomes.sort_by(|a, b| a.region.cmp(&b.region));

        let total_regions = regions.len();
        let success_count = outcomes
            .iter()
            .filter(|o| o.status == ExecutionStatus::Completed)
            .count();
        // Rounded to two decimals so a 2-of-3 fan-out meets the 0.67 floor.
        let success_rate = if total_regions == 0 {
            0.0
        } else {
            (success_count as f64 / total_regions as f64 * 100.0).round() / 100.0
        };
        // min_regions is enforced at discovery (enough candidate regions to
        // dispatch); overall success is governed by the rate floor.
        let threshold = spec
            .constraints
            .min_success_rate
            .max(DEFAULT_MIN_SUCCESS_RATE);
        let completed = success_count > 0 && success_rate >= threshold;

        let errors: Vec<String> = outcomes
            .iter()
            .filter_map(|o| {
                o.error
                    .as_ref()
                    .map(|e| format!("{}: {e}", o.region))
            })
            .collect();

        let status = if completed {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if let Err(err) = self.store.update_job_status(&job_id, status).await {
            warn!(job_id = %job_id, error = %err, "job status update failed");
        }

        info!(
            job_id = %job_id,
            completed,
            success_count,
            total_regions,
            success_rate,
            "multi-region execution finished"
        );

        Ok(JobOutcome {
            job_id,
            completed,
            success_count,
            total_regions,
            success_rate,
            total_cost: ledger.total(),
            regions: outcomes,
            errors,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_region(
        self: Arc<Self>,
        region: String,
        candidates: RegionCandidates,
        mut attempt: ExecutionAttempt,
        task: Arc<TaskSpec>,
        provider_timeout: Duration,
        ledger: Arc<CostLedger>,
        cancel_tx: watch::Sender<bool>,
        cancel_rx: watch::Receiver<bool>,
    ) -> RegionOutcome {
        if *cancel_rx.borrow() {
            return self
                .finalize_failure(attempt, None, 0.0, "canceled before acquisition", false)
                .await;
        }

        let acquisition = match acquire_region(
            &self.provider,
            &self.geoip,
            &candidates,
            &region,
            self.config.strict_timeout,
            self.config.relax_timeout,
        )
        .await
        {
            Ok(AcquisitionOutcome::Acquired {
                acquisition,
                offer,
                window,
            }) => {
                let outcome_label = match window {
                    AcquisitionWindow::Strict => "strict",
                    AcquisitionWindow::Relax => "relax",
                };
                self.metrics
                    .incr_labeled("negotiation", "outcome", outcome_label);
                (acquisition, offer)
            }
            Ok(AcquisitionOutcome::Exhausted { errors }) => {
                self.metrics.incr_labeled("negotiation", "outcome", "exhausted");
                return self
                    .finalize_failure(
                        attempt,
                        None,
                        0.0,
                        &format!("no provider acquired: {}", errors.join("; ")),
                        false,
                    )
                    .await;
            }
            Err(err) => {
                self.metrics.incr_labeled("negotiation", "outcome", "error");
                return self
                    .finalize_failure(attempt, None, 0.0, &err.to_string(), false)
                    .await;
            }
        };
        let (acquisition, offer) = acquisition;

        // Cost accounting happens before execution so the cap bounds spend.
        let estimate = match self.provider.estimate_cost(&offer, &task).await {
            Ok(cost) => cost,
            Err(err) => {
                warn!(region = %region, error = %err, "cost estimate failed; charging zero");
                0.0
            }
        };
        if ledger.charge(estimate) {
            let _ = cancel_tx.send(true);
            acquire::release(&self.provider, &acquisition).await;
            return self
                .finalize_failure(
                    attempt,
                    Some(offer.provider_id.clone()),
                    estimate,
                    "max_cost exceeded; remaining regions canceled",
                    false,
                )
                .await;
        }

        if *cancel_rx.borrow() {
            acquire::release(&self.provider, &acquisition).await;
            return self
                .finalize_failure(
                    attempt,
                    Some(offer.provider_id.clone()),
                    estimate,
                    "canceled by cost cap",
                    false,
                )
                .await;
        }

        attempt.provider_id = Some(offer.provider_id.clone());
        if let Err(err) = attempt.transition(ExecutionStatus::Running, self.clock.now()) {
            warn!(error = %err, "attempt transition failed");
        }
        if let Err(err) = self.store.update_execution(&attempt).await {
            warn!(error = %err, "attempt update failed");
        }

        let started = self.clock.now();
        let executed = self
            .provider
            .execute(&acquisition, &task, provider_timeout)
            .await;
        acquire::release(&self.provider, &acquisition).await;
        let duration_ms = (self.clock.now() - started).num_milliseconds().max(0) as u64;
        self.metrics.observe_ms("region_execute_duration", duration_ms);

        match executed {
            Ok(output) => {
                self.finalize_success(
                    attempt,
                    offer.provider_id,
                    output,
                    task,
                    provider_timeout,
                    duration_ms,
                    estimate,
                )
                .await
            }
            Err(err) => {
                let refusal = err.is_content_refusal();
                self.finalize_failure(
                    attempt,
                    Some(offer.provider_id),
                    estimate,
                    &err.to_string(),
                    refusal,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_success(
        &self,
        mut attempt: ExecutionAttempt,
        provider_id: String,
        output: beacon_provider::TaskOutput,
        task: Arc<TaskSpec>,
        provider_timeout: Duration,
        duration_ms: u64,
        estimated_cost: f64,
    ) -> RegionOutcome {
        let now = self.clock.now();
        let receipt = ReceiptBuilder::new(
            attempt.id.clone(),
            attempt.job_id.clone(),
            attempt.region.clone(),
            provider_id.clone(),
        )
        .duration_ms(duration_ms)
        .exit_code(output.exit_code)
        .output_data(output.data.clone())
        .output_metadata("stdout_bytes", serde_json::json!(output.stdout.len()))
        .output_metadata("stderr_bytes", serde_json::json!(output.stderr.len()))
        .benchmark_hash(task.input_hash.clone())
        .provider_info("provider_id", serde_json::json!(provider_id))
        .execution_env(ExecutionEnv {
            image: task.image.clone(),
            timeout_secs: provider_timeout.as_secs(),
            network: None,
        })
        .build(self.signer.as_ref(), now);

        let (receipt_id, receipt_hash, receipt_value) = match receipt {
            Ok(receipt) => {
                let hash = beacon_receipt::receipt_hash(&receipt).ok();
                let value = serde_json::to_value(&receipt).ok();
                (Some(receipt.id), hash, value)
            }
            Err(err) => {
                warn!(error = %err, "receipt build failed");
                (None, None, None)
            }
        };

        attempt.output_data = Some(output.data.clone());
        attempt.receipt_data = receipt_value;
        if let Err(err) = attempt.transition(ExecutionStatus::Completed, now) {
            warn!(error = %err, "attempt transition failed");
        }
        if let Err(err) = self.store.update_execution(&attempt).await {
            warn!(error = %err, "attempt update failed");
        }

        let output_hash = Some(beacon_receipt::hash_value(&output.data));
        self.append_translog(&attempt, output_hash, receipt_hash).await;
        self.metrics.incr("regions_completed");

        RegionOutcome {
            region: attempt.region.clone(),
            execution_id: attempt.id,
            status: ExecutionStatus::Completed,
            provider_id: Some(provider_id),
            receipt_id,
            estimated_cost,
            error: None,
        }
    }

    async fn finalize_failure(
        &self,
        mut attempt: ExecutionAttempt,
        provider_id: Option<String>,
        estimated_cost: f64,
        error: &str,
        refusal: bool,
    ) -> RegionOutcome {
        let now = self.clock.now();
        attempt.provider_id = provider_id.clone();
        attempt.is_content_refusal = refusal;
        if !attempt.status.is_terminal() {
            if let Err(err) = attempt.transition(ExecutionStatus::Failed, now) {
                warn!(error = %err, "attempt transition failed");
            }
        }
        if let Err(err) = self.store.update_execution(&attempt).await {
            warn!(error = %err, "attempt update failed");
        }
        self.append_translog(&attempt, None, None).await;
        self.metrics.incr("regions_failed");

        RegionOutcome {
            region: attempt.region.clone(),
            execution_id: attempt.id,
            status: ExecutionStatus::Failed,
            provider_id,
            receipt_id: None,
            estimated_cost,
            error: Some(error.to_string()),
        }
    }

    async fn append_translog(
        &self,
        attempt: &ExecutionAttempt,
        output_hash: Option<String>,
        receipt_hash: Option<String>,
    ) {
        let draft = EntryDraft {
            execution_id: attempt.id.clone(),
            job_id: attempt.job_id.clone(),
            region: attempt.region.clone(),
            provider_id: attempt.provider_id.clone(),
            status: attempt.status,
            output_hash,
            receipt_hash,
            ipfs_cid: None,
            timestamp: self.clock.now(),
        };
        if let Err(err) = self.translog.append(draft).await {
            warn!(error = %err, "transparency append sink failed");
        }
    }

    /// Accept or reject a content-refusal retry intent for one question of
    /// one execution attempt.
    ///
    /// Concurrent identical intents are deduplicated through a short-TTL KV
    /// key; `completed` and `running` attempts short-circuit.
    pub async fn retry_question(
        &self,
        execution_id: &str,
        region: &str,
        question_index: usize,
    ) -> Result<RetryDecision, ExecutorError> {
        let Some(mut attempt) = self.store.execution(execution_id).await? else {
            return Err(ExecutorError::Store(StoreError::NotFound(format!(
                "execution {execution_id}"
            ))));
        };

        if matches!(
            attempt.status,
            ExecutionStatus::Completed | ExecutionStatus::Running
        ) {
            return Ok(RetryDecision::ShortCircuited);
        }

        let dedup_key = format!("retry:{execution_id}:{region}:{question_index}");
        match self
            .kv
            .set_nx_ttl(&dedup_key, "1", self.config.retry_dedup_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(RetryDecision::Duplicate),
            Err(err) => {
                // Dedup is best-effort; losing it admits a duplicate retry,
                // which mark_retrying bounds via the budget.
                warn!(error = %err, "retry dedup key unavailable");
            }
        }

        match attempt.mark_retrying(question_index, self.clock.now()) {
            Ok(()) => {
                self.store.update_execution(&attempt).await?;
                self.metrics.incr("refusal_retries_accepted");
                Ok(RetryDecision::Accepted)
            }
            Err(_) => Ok(RetryDecision::NotEligible),
        }
    }
}
