// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receipts and transparency-log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A signed execution receipt produced for each successful region attempt.
///
/// The signature covers the canonical form with `signature` and `public_key`
/// excluded, mirroring the JobSpec signing convention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    /// Receipt identifier: `receipt_<exec_id>_<region>`.
    pub id: String,

    /// Owning job.
    pub job_id: String,

    /// Execution summary: region, provider, timing, exit status.
    pub execution_details: ExecutionDetails,

    /// Output payload, its hash, and output metadata.
    pub output: ReceiptOutput,

    /// Provenance chain back to the benchmark input and execution env.
    pub provenance: Provenance,

    /// When the receipt was built.
    pub created_at: DateTime<Utc>,

    /// Base64-standard Ed25519 signature, when a signing key is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Base64-standard public key matching `signature`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Execution summary embedded in a receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionDetails {
    /// Execution attempt id.
    pub execution_id: String,
    /// Region the attempt ran in.
    pub region: String,
    /// Provider that produced the output.
    pub provider_id: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Container exit code, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Output section of a receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptOutput {
    /// Raw output payload.
    pub data: serde_json::Value,
    /// Hex SHA-256 over the canonical form of `data`.
    pub hash: String,
    /// Free-form output metadata (stdout/stderr sizes, truncation flags).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Provenance chain embedded in a receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    /// Content hash of the benchmark input (`benchmark.input.hash`).
    pub benchmark_hash: String,
    /// Provider metadata captured at execution time.
    pub provider_info: BTreeMap<String, serde_json::Value>,
    /// Execution environment: container image, timeout, network.
    pub execution_env: ExecutionEnv,
}

/// Execution environment snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEnv {
    /// Fully qualified container image reference.
    pub image: String,
    /// Provider timeout in seconds that governed the run.
    pub timeout_secs: u64,
    /// Network identifier the run was attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// One entry of the append-only transparency log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransparencyEntry {
    /// Position in the log. Strictly monotonic, gap-free.
    pub log_index: u64,
    /// Execution attempt id.
    pub execution_id: String,
    /// Owning job.
    pub job_id: String,
    /// Region of the attempt.
    pub region: String,
    /// Provider id, when one was acquired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Terminal status of the attempt.
    pub status: crate::ExecutionStatus,
    /// Hex SHA-256 of the canonical output, when output exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    /// Hex SHA-256 of the canonical receipt, when one was built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_hash: Option<String>,
    /// Content address of the bundled artifacts, when bundling ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipfs_cid: Option<String>,
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
}
