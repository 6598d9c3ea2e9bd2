// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! beacon-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Beacon runner.

/// Virtual clock abstraction shared by the queue, breaker, and trust registry.
pub mod clock;
/// Admission and runner error taxonomy with stable wire codes.
pub mod error;
/// Execution attempts and their state machine.
pub mod execution;
/// Receipts and transparency-log entries.
pub mod receipt;
/// Trust statuses and trusted-key records.
pub mod trust;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AdmissionError, ErrorCode, TimestampReason};
pub use execution::{ExecutionAttempt, ExecutionStatus, RetryRecord, TransitionError};
pub use receipt::{
    ExecutionDetails, ExecutionEnv, Provenance, Receipt, ReceiptOutput, TransparencyEntry,
};
pub use trust::{KeyStatus, TrustStatus, TrustedKey};

/// JobSpec schema version accepted by this runner.
pub const JOBSPEC_VERSION: &str = "v1";

/// Default minimum fraction of regions that must succeed for a multi-region
/// job to be reported as completed.
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.67;

/// A signed job specification submitted for execution.
///
/// Immutable once admitted. The signature covers the canonical form of the
/// spec with `signature` and `public_key` excluded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    /// Unique job identifier. Assigned by admission when absent
    /// (`<benchmark>-<unix>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Spec schema version (currently `"v1"`).
    pub version: String,

    /// What to run and how to score it.
    pub benchmark: Benchmark,

    /// Where and under which limits to run it.
    pub constraints: Constraints,

    /// Question set for interrogative benchmarks. Required non-empty for
    /// bias-detection v1.
    #[serde(default)]
    pub questions: Vec<String>,

    /// Submission metadata: timestamp, nonce, and free-form extras.
    #[serde(default)]
    pub metadata: JobMetadata,

    /// Base64-standard Ed25519 signature over the canonical spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Base64-standard Ed25519 public key of the submitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Set by the store on first persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    /// Derive the admission-assigned id for a spec without one.
    pub fn derived_id(&self, now: DateTime<Utc>) -> String {
        format!("{}-{}", self.benchmark.name, now.timestamp())
    }

    /// Whether this spec is a bias-detection v1 benchmark, which requires a
    /// non-empty question set.
    pub fn requires_questions(&self) -> bool {
        let name = self.benchmark.name.as_str();
        name == "bias-detection" || (name.starts_with("bias") && self.version == "v1")
    }
}

/// Benchmark definition: container workload plus input and scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Benchmark {
    /// Benchmark name, e.g. `"bias-detection"`.
    pub name: String,

    /// Container workload to execute on each provider.
    pub container: ContainerSpec,

    /// Input payload and its content hash.
    pub input: InputSpec,

    /// Scoring directives, passed through to downstream consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<serde_json::Value>,
}

/// Container image, command, and resource requests for a benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    /// Image reference without tag.
    pub image: String,

    /// Image tag.
    pub tag: String,

    /// Command and arguments.
    #[serde(default)]
    pub command: Vec<String>,

    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// CPU / memory requests.
    pub resources: ResourceSpec,
}

/// Requested compute resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// CPU cores.
    pub cpu: f64,
    /// Memory, e.g. `"512mb"`.
    pub mem: String,
}

/// Benchmark input payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    /// Input kind, e.g. `"inline"` or `"ipfs"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Opaque input data. Kept byte-preserving through persistence so
    /// downstream hashing stays stable.
    pub data: serde_json::Value,

    /// Content hash of the input, carried into receipt provenance.
    pub hash: String,
}

/// Execution constraints: target regions, tolerances, timeouts, and cost cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    /// Regions to fan out to, e.g. `["US", "EU", "ASIA"]`.
    pub regions: Vec<String>,

    /// Minimum number of regions that must succeed.
    #[serde(default = "default_min_regions")]
    pub min_regions: u32,

    /// Minimum success fraction; the executor applies
    /// [`DEFAULT_MIN_SUCCESS_RATE`] as a floor.
    #[serde(default)]
    pub min_success_rate: f64,

    /// Overall job timeout in seconds. Expiry cancels all regions.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,

    /// Per-provider execution timeout in seconds.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout: u64,

    /// Running-total cost cap; exceeding it cancels remaining regions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,

    /// Provider whitelist. Empty means any provider.
    #[serde(default)]
    pub providers: Vec<String>,
}

fn default_min_regions() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_provider_timeout_secs() -> u64 {
    120
}

/// Submission metadata attached to a [`JobSpec`].
///
/// `timestamp` and `nonce` are mandatory when trust enforcement is on; the
/// remaining fields are preserved opaquely.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMetadata {
    /// RFC3339 submission timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Single-use nonce for replay protection, scoped to the signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Free-form extra metadata, preserved byte-for-byte.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec(name: &str) -> JobSpec {
        JobSpec {
            id: None,
            version: "v1".into(),
            benchmark: Benchmark {
                name: name.into(),
                container: ContainerSpec {
                    image: "beacon/bench".into(),
                    tag: "latest".into(),
                    command: vec!["run".into()],
                    env: BTreeMap::new(),
                    resources: ResourceSpec {
                        cpu: 1.0,
                        mem: "512mb".into(),
                    },
                },
                input: InputSpec {
                    kind: "inline".into(),
                    data: serde_json::json!({"prompt": "hello"}),
                    hash: "abc123".into(),
                },
                scoring: None,
            },
            constraints: Constraints {
                regions: vec!["US".into()],
                min_regions: 1,
                min_success_rate: 0.0,
                timeout: 600,
                provider_timeout: 120,
                max_cost: None,
                providers: vec![],
            },
            questions: vec![],
            metadata: JobMetadata::default(),
            signature: None,
            public_key: None,
            created_at: None,
        }
    }

    #[test]
    fn derived_id_uses_benchmark_and_unix_time() {
        let spec = minimal_spec("llm-bench");
        let now = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(spec.derived_id(now), format!("llm-bench-{}", now.timestamp()));
    }

    #[test]
    fn bias_detection_requires_questions() {
        assert!(minimal_spec("bias-detection").requires_questions());
        assert!(minimal_spec("bias-probe").requires_questions());
        assert!(!minimal_spec("llm-bench").requires_questions());
    }

    #[test]
    fn spec_serde_roundtrip_preserves_extra_metadata() {
        let mut spec = minimal_spec("llm-bench");
        spec.metadata
            .extra
            .insert("submitter".into(), serde_json::json!("portal"));
        let json = serde_json::to_string(&spec).unwrap();
        let back: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
        assert_eq!(back.metadata.extra["submitter"], "portal");
    }

    #[test]
    fn constraints_defaults_apply() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "version": "v1",
            "benchmark": {
                "name": "llm-bench",
                "container": {
                    "image": "beacon/bench",
                    "tag": "latest",
                    "resources": {"cpu": 1.0, "mem": "512mb"}
                },
                "input": {"type": "inline", "data": {}, "hash": "h"}
            },
            "constraints": {"regions": ["US", "EU"]}
        }))
        .unwrap();
        assert_eq!(spec.constraints.min_regions, 1);
        assert_eq!(spec.constraints.timeout, 600);
        assert_eq!(spec.constraints.provider_timeout, 120);
        assert!(spec.constraints.max_cost.is_none());
    }
}
