// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Signed JobSpec admission pipeline."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Ordered admission stages, each failing fast with a stable taxonomy code:
//!
//! 1. parse and structural validation
//! 2. question-set requirement for bias-detection benchmarks
//! 3. id assignment
//! 4. trust evaluation
//! 5. signature-failure rate limiting
//! 6. timestamp skew/age validation
//! 7. nonce replay protection
//! 8. signature verification (typed form, then portal-compat fallback over
//!    the raw body)
//! 9. idempotent transactional persistence (job + outbox + idempotency key)
//!
//! The pipeline produces a single structured [`AdmissionError`] on rejection.

use beacon_canonical::{PORTAL_COMPAT_STRIP, canonicalize, canonicalize_jobspec_v1};
use beacon_core::{
    AdmissionError, Clock, ErrorCode, JobSpec, TimestampReason, TrustStatus,
};
use beacon_kv::{FailureCounter, Kv, KvError, ReplayGuard, ReplayOutcome};
use beacon_store::{JobStore, StoreError};
use beacon_telemetry::Metrics;
use beacon_trust::{TrustRegistry, VerifyError};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Admission policy knobs, derived from runner configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Reject submissions whose key is not trusted.
    pub trust_enforce: bool,
    /// Dev bypass: skip signature verification (with a warning).
    pub sig_bypass: bool,
    /// Enforce nonce replay protection.
    pub replay_protection: bool,
    /// Permitted future clock skew.
    pub max_skew: Duration,
    /// Maximum accepted timestamp age; also the nonce TTL.
    pub max_age: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            trust_enforce: false,
            sig_bypass: false,
            replay_protection: true,
            max_skew: Duration::from_secs(30),
            max_age: Duration::from_secs(300),
        }
    }
}

/// Successful admission: the job is persisted and its outbox row appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionTicket {
    /// The persisted job id.
    pub job_id: String,
    /// `true` when a prior submission with the same idempotency key already
    /// created the job and nothing was written.
    pub idempotent_replay: bool,
}

/// The admission pipeline.
pub struct AdmissionPipeline {
    registry: Arc<TrustRegistry>,
    store: Arc<dyn JobStore>,
    replay: ReplayGuard,
    failures: FailureCounter,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    /// Behind a lock so the admin surface can flip flags at runtime.
    config: RwLock<AdmissionConfig>,
    queue_topic: String,
}

impl AdmissionPipeline {
    /// Wire the pipeline to its collaborators.
    pub fn new(
        registry: Arc<TrustRegistry>,
        store: Arc<dyn JobStore>,
        kv: Arc<dyn Kv>,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
        config: AdmissionConfig,
        queue_topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            replay: ReplayGuard::new(kv.clone(), config.max_age),
            failures: FailureCounter::new(kv),
            metrics,
            clock,
            config: RwLock::new(config),
            queue_topic: queue_topic.into(),
        }
    }

    /// Current policy flags.
    pub fn flags(&self) -> AdmissionConfig {
        self.config.read().expect("admission lock poisoned").clone()
    }

    /// Mutate policy flags at runtime (admin surface).
    pub fn set_flags(&self, mutate: impl FnOnce(&mut AdmissionConfig)) {
        let mut config = self.config.write().expect("admission lock poisoned");
        mutate(&mut config);
        info!(
            trust_enforce = config.trust_enforce,
            sig_bypass = config.sig_bypass,
            replay_protection = config.replay_protection,
            "admission flags updated"
        );
    }

    /// Run the full pipeline over a raw request body.
    ///
    /// `client_ip` scopes the failure counter; `idem_key` is the value of
    /// the `Idempotency-Key` header when present.
    pub async fn submit(
        &self,
        raw_body: &[u8],
        client_ip: &str,
        idem_key: Option<&str>,
    ) -> Result<AdmissionTicket, AdmissionError> {
        let result = self.run_stages(raw_body, client_ip, idem_key).await;
        match &result {
            Ok(ticket) => {
                self.metrics.incr("admission_accepted");
                info!(job_id = %ticket.job_id, idempotent = ticket.idempotent_replay, "jobspec admitted");
            }
            Err(err) => {
                self.metrics
                    .incr_labeled("admission_rejected", "code", &err.code.code());
                debug!(code = %err.code, "jobspec rejected");
            }
        }
        result
    }

    async fn run_stages(
        &self,
        raw_body: &[u8],
        client_ip: &str,
        idem_key: Option<&str>,
    ) -> Result<AdmissionTicket, AdmissionError> {
        let config = self.flags();
        let now = self.clock.now();

        // Stage 1: parse. The raw tree is kept for the compat fallback.
        let raw_value: serde_json::Value = serde_json::from_slice(raw_body)
            .map_err(|e| AdmissionError::new(ErrorCode::InvalidJson, format!("body is not valid JSON: {e}")))?;
        let mut spec: JobSpec = serde_json::from_value(raw_value.clone())
            .map_err(|e| AdmissionError::new(ErrorCode::InvalidJson, format!("body is not a JobSpec: {e}")))?;
        validate_structure(&spec, &config)?;

        // Stage 2: interrogative benchmarks need their questions.
        if spec.requires_questions() && spec.questions.is_empty() {
            return Err(AdmissionError::new(
                ErrorCode::MissingField("questions".into()),
                "bias-detection benchmarks require a non-empty questions array",
            ));
        }

        // Stage 3: id assignment.
        let assigned_id = match &spec.id {
            Some(id) => id.clone(),
            None => spec.derived_id(now),
        };

        // Stage 4: trust.
        let kid = match &spec.public_key {
            Some(pk) => {
                let (status, reason) = self.registry.evaluate_at(pk, now);
                if status != TrustStatus::Trusted {
                    if config.trust_enforce {
                        return Err(AdmissionError::new(
                            ErrorCode::TrustViolation(status),
                            reason,
                        ));
                    }
                    debug!(status = %status, "non-trusted key accepted (trust_enforce off)");
                }
                self.registry.kid_for(pk)
            }
            None => {
                if config.trust_enforce {
                    return Err(AdmissionError::missing_field("public_key"));
                }
                "anonymous".to_string()
            }
        };

        // Stage 5: per-identity failure rate.
        match self.failures.is_limited(client_ip, &kid).await {
            Ok(true) => {
                return Err(AdmissionError::new(
                    ErrorCode::RateLimitExceeded,
                    "too many signature failures from this identity; retry later",
                ));
            }
            Ok(false) => {}
            Err(err) => {
                // Fail open: losing the counter must not block admission.
                warn!(error = %err, "failure counter unavailable; skipping rate limit check");
            }
        }

        // Stage 6: timestamp.
        if config.trust_enforce {
            let ts = spec
                .metadata
                .timestamp
                .as_deref()
                .ok_or_else(|| AdmissionError::missing_field("metadata.timestamp"))?;
            if spec.metadata.nonce.is_none() {
                return Err(AdmissionError::missing_field("metadata.nonce"));
            }
            validate_timestamp(ts, now, &config)?;
        }

        // Stage 7: replay protection.
        if config.replay_protection {
            if let Some(nonce) = spec.metadata.nonce.clone() {
                let ts = spec.metadata.timestamp.clone().unwrap_or_default();
                match self.replay.check_and_reserve(&kid, &nonce, &ts).await {
                    Ok(ReplayOutcome::Fresh) => {}
                    Ok(ReplayOutcome::Replayed) => {
                        return Err(AdmissionError::new(
                            ErrorCode::ReplayDetected,
                            format!("nonce '{nonce}' was already used by this key"),
                        ));
                    }
                    Err(KvError::Unavailable(detail)) if !config.trust_enforce => {
                        // Soft-trust deployments keep admitting without
                        // replay protection during a KV outage.
                        warn!(detail, "replay store unavailable; admitting without replay protection");
                    }
                    Err(err) => {
                        warn!(error = %err, "replay store unavailable under trust enforcement");
                        return Err(AdmissionError::new(
                            ErrorCode::ProtectionUnavailable("replay".into()),
                            "replay protection is temporarily unavailable",
                        ));
                    }
                }
            }
        }

        // Stage 8: signature.
        self.verify_signature(&spec, &raw_value, client_ip, &kid, &config)
            .await?;

        // Stage 9: canonical persistence form, handed to the store.
        spec.id = Some(assigned_id.clone());
        let spec_value = serde_json::to_value(&spec).map_err(|e| {
            AdmissionError::new(ErrorCode::CanonicalizationError, e.to_string())
        })?;
        let canon_json = String::from_utf8(canonicalize(&spec_value, &[]))
            .map_err(|e| AdmissionError::new(ErrorCode::CanonicalizationError, e.to_string()))?;
        let payload = serde_json::json!({ "job_id": assigned_id }).to_string();

        let outcome = self
            .store
            .idempotent_create(idem_key, &assigned_id, &canon_json, &self.queue_topic, &payload)
            .await
            .map_err(|err| match err {
                StoreError::Unavailable(_) => AdmissionError::new(
                    ErrorCode::StoreUnavailable,
                    "persistence is temporarily unavailable",
                ),
                other => AdmissionError::new(ErrorCode::StoreUnavailable, other.to_string()),
            })?;

        Ok(AdmissionTicket {
            job_id: outcome.job_id,
            idempotent_replay: outcome.idempotent_replay,
        })
    }

    async fn verify_signature(
        &self,
        spec: &JobSpec,
        raw_value: &serde_json::Value,
        client_ip: &str,
        kid: &str,
        config: &AdmissionConfig,
    ) -> Result<(), AdmissionError> {
        if config.sig_bypass {
            warn!("sig_bypass enabled; accepting jobspec without signature verification");
            return Ok(());
        }

        let (signature, public_key) = match (&spec.signature, &spec.public_key) {
            (Some(s), Some(p)) => (s, p),
            (None, None) if !config.trust_enforce => return Ok(()),
            (None, _) => return Err(AdmissionError::missing_field("signature")),
            (_, None) => return Err(AdmissionError::missing_field("public_key")),
        };

        // Primary path: canonical form of the typed spec as submitted.
        let canon = canonicalize_jobspec_v1(spec).map_err(|e| {
            AdmissionError::new(ErrorCode::CanonicalizationError, e.to_string())
        })?;
        match beacon_trust::verify(&canon, signature, public_key) {
            Ok(()) => return Ok(()),
            Err(VerifyError::InvalidPublicKeyEncoding) => {
                return Err(AdmissionError::new(
                    ErrorCode::InvalidEncodingPublicKey,
                    "public_key is not a valid base64 Ed25519 key",
                ));
            }
            Err(VerifyError::SignatureMismatch) => {}
        }

        // Portal-compat fallback: the raw body with stripped fields, which
        // additionally ignores a server-assigned id.
        let fallback = canonicalize(raw_value, PORTAL_COMPAT_STRIP);
        if beacon_trust::verify(&fallback, signature, public_key).is_ok() {
            debug!("signature verified on the portal-compat fallback path");
            return Ok(());
        }

        if let Err(err) = self.failures.record_failure(client_ip, kid).await {
            warn!(error = %err, "failure counter unavailable; mismatch not recorded");
        }
        Err(AdmissionError::new(
            ErrorCode::SignatureMismatch,
            "signature does not match the canonical jobspec",
        ))
    }
}

fn validate_structure(spec: &JobSpec, config: &AdmissionConfig) -> Result<(), AdmissionError> {
    if spec.version.is_empty() {
        return Err(AdmissionError::missing_field("version"));
    }
    if spec.benchmark.name.is_empty() {
        return Err(AdmissionError::missing_field("benchmark.name"));
    }
    if spec.benchmark.container.image.is_empty() {
        return Err(AdmissionError::missing_field("benchmark.container.image"));
    }
    if spec.constraints.regions.is_empty() {
        return Err(AdmissionError::missing_field("constraints.regions"));
    }
    if spec.constraints.min_regions as usize > spec.constraints.regions.len() {
        return Err(AdmissionError::invalid_field(
            "constraints.min_regions",
            "exceeds the number of requested regions",
        ));
    }
    if !(0.0..=1.0).contains(&spec.constraints.min_success_rate) {
        return Err(AdmissionError::invalid_field(
            "constraints.min_success_rate",
            "must be within [0, 1]",
        ));
    }
    if config.trust_enforce && spec.signature.is_none() {
        return Err(AdmissionError::missing_field("signature"));
    }
    Ok(())
}

fn validate_timestamp(
    raw: &str,
    now: DateTime<Utc>,
    config: &AdmissionConfig,
) -> Result<(), AdmissionError> {
    let ts = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| {
            AdmissionError::timestamp(
                TimestampReason::FormatInvalid,
                format!("'{raw}' is not an RFC3339 timestamp"),
            )
        })?
        .with_timezone(&Utc);

    let max_age = chrono::Duration::from_std(config.max_age)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let max_skew = chrono::Duration::from_std(config.max_skew)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));

    // Boundary instants are accepted on both sides.
    if now - ts > max_age {
        return Err(AdmissionError::timestamp(
            TimestampReason::TooOld,
            "timestamp is older than the accepted window",
        ));
    }
    if ts - now > max_skew {
        return Err(AdmissionError::timestamp(
            TimestampReason::TooNew,
            "timestamp is further in the future than the permitted skew",
        ));
    }
    Ok(())
}
