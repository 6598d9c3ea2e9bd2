// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Receipt building, canonical hashing, and Ed25519 signing."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Builds one receipt per successful region attempt, hashes its output over
//! the canonical form, and signs it with the process signing key when one is
//! configured. Unsigned receipts are emitted (with a warning) when no key is
//! present; the absent `signature` field lets verifiers tell the difference.

use beacon_canonical::{JOBSPEC_SIGNING_STRIP, canonicalize};
use beacon_core::{
    ExecutionDetails, ExecutionEnv, Provenance, Receipt, ReceiptOutput,
};
use beacon_trust::ReceiptSigner;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

/// Errors from receipt construction.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    /// The receipt could not be converted to a JSON tree for hashing.
    #[error("receipt canonicalization failed: {0}")]
    Canonical(#[from] serde_json::Error),
}

/// Hex SHA-256 over the canonical form of a JSON value.
pub fn hash_value(value: &serde_json::Value) -> String {
    let canon = canonicalize(value, &[]);
    let mut hasher = Sha256::new();
    hasher.update(&canon);
    hex::encode(hasher.finalize())
}

/// Canonical bytes of a receipt with `signature` and `public_key` excluded.
pub fn canonical_bytes(receipt: &Receipt) -> Result<Vec<u8>, ReceiptError> {
    let value = serde_json::to_value(receipt)?;
    Ok(canonicalize(&value, JOBSPEC_SIGNING_STRIP))
}

/// Hex SHA-256 of the canonical receipt form. Stored in the transparency
/// log as the receipt fingerprint.
pub fn receipt_hash(receipt: &Receipt) -> Result<String, ReceiptError> {
    let bytes = canonical_bytes(receipt)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a receipt's signature against its embedded public key.
///
/// Unsigned receipts verify trivially.
pub fn verify_receipt(receipt: &Receipt) -> bool {
    match (&receipt.signature, &receipt.public_key) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(sig), Some(pk)) => match canonical_bytes(receipt) {
            Ok(bytes) => beacon_trust::verify(&bytes, sig, pk).is_ok(),
            Err(_) => false,
        },
    }
}

/// Fluent builder for a region attempt's receipt.
pub struct ReceiptBuilder {
    execution_id: String,
    job_id: String,
    region: String,
    provider_id: String,
    duration_ms: u64,
    exit_code: Option<i32>,
    output_data: serde_json::Value,
    output_metadata: BTreeMap<String, serde_json::Value>,
    benchmark_hash: String,
    provider_info: BTreeMap<String, serde_json::Value>,
    execution_env: ExecutionEnv,
}

impl ReceiptBuilder {
    /// Start a receipt for one execution attempt in one region.
    pub fn new(
        execution_id: impl Into<String>,
        job_id: impl Into<String>,
        region: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            job_id: job_id.into(),
            region: region.into(),
            provider_id: provider_id.into(),
            duration_ms: 0,
            exit_code: None,
            output_data: serde_json::Value::Null,
            output_metadata: BTreeMap::new(),
            benchmark_hash: String::new(),
            provider_info: BTreeMap::new(),
            execution_env: ExecutionEnv {
                image: String::new(),
                timeout_secs: 0,
                network: None,
            },
        }
    }

    /// Wall-clock duration of the run.
    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    /// Container exit code.
    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Output payload; its canonical hash becomes `output.hash`.
    pub fn output_data(mut self, data: serde_json::Value) -> Self {
        self.output_data = data;
        self
    }

    /// Attach one output metadata entry.
    pub fn output_metadata(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.output_metadata.insert(key.into(), value);
        self
    }

    /// The benchmark input hash carried into provenance.
    pub fn benchmark_hash(mut self, hash: impl Into<String>) -> Self {
        self.benchmark_hash = hash.into();
        self
    }

    /// Attach one provider info entry.
    pub fn provider_info(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.provider_info.insert(key.into(), value);
        self
    }

    /// The execution environment snapshot.
    pub fn execution_env(mut self, env: ExecutionEnv) -> Self {
        self.execution_env = env;
        self
    }

    /// Build the receipt, optionally signing it.
    ///
    /// With `signer = None` the receipt is emitted unsigned and a warning is
    /// logged.
    pub fn build(
        self,
        signer: Option<&ReceiptSigner>,
        now: DateTime<Utc>,
    ) -> Result<Receipt, ReceiptError> {
        let mut receipt = Receipt {
            id: format!("receipt_{}_{}", self.execution_id, self.region),
            job_id: self.job_id,
            execution_details: ExecutionDetails {
                execution_id: self.execution_id,
                region: self.region,
                provider_id: self.provider_id,
                duration_ms: self.duration_ms,
                exit_code: self.exit_code,
            },
            output: ReceiptOutput {
                hash: hash_value(&self.output_data),
                data: self.output_data,
                metadata: self.output_metadata,
            },
            provenance: Provenance {
                benchmark_hash: self.benchmark_hash,
                provider_info: self.provider_info,
                execution_env: self.execution_env,
            },
            created_at: now,
            signature: None,
            public_key: None,
        };

        match signer {
            Some(signer) => {
                let bytes = canonical_bytes(&receipt)?;
                receipt.signature = Some(signer.sign_b64(&bytes));
                receipt.public_key = Some(signer.public_key_b64());
            }
            None => {
                warn!(receipt_id = %receipt.id, "no signing key configured; emitting unsigned receipt");
            }
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde_json::json;

    fn signer() -> ReceiptSigner {
        ReceiptSigner::from_b64(&B64.encode([9u8; 32])).unwrap()
    }

    fn build(signed: bool) -> Receipt {
        let builder = ReceiptBuilder::new("exec-1", "job-1", "US", "provider-1")
            .duration_ms(1500)
            .exit_code(0)
            .output_data(json!({"answer": 42}))
            .benchmark_hash("input-hash")
            .provider_info("node", json!("node-7"))
            .execution_env(ExecutionEnv {
                image: "beacon/bench:latest".into(),
                timeout_secs: 120,
                network: Some("public".into()),
            });
        let signer = signer();
        builder
            .build(signed.then_some(&signer), Utc::now())
            .unwrap()
    }

    #[test]
    fn id_embeds_execution_and_region() {
        let r = build(false);
        assert_eq!(r.id, "receipt_exec-1_US");
    }

    #[test]
    fn output_hash_covers_canonical_output() {
        let r = build(false);
        assert_eq!(r.output.hash, hash_value(&json!({"answer": 42})));
        // Key order in the source payload does not change the hash.
        assert_eq!(
            hash_value(&json!({"a": 1, "b": 2})),
            hash_value(&serde_json::from_str::<serde_json::Value>(r#"{"b":2,"a":1}"#).unwrap())
        );
    }

    #[test]
    fn signed_receipt_verifies_and_detects_tamper() {
        let mut r = build(true);
        assert!(r.signature.is_some());
        assert!(verify_receipt(&r));

        r.output.hash = "0".repeat(64);
        assert!(!verify_receipt(&r));
    }

    #[test]
    fn unsigned_receipt_verifies_trivially() {
        let r = build(false);
        assert!(r.signature.is_none());
        assert!(verify_receipt(&r));
    }

    #[test]
    fn receipt_hash_is_signature_independent() {
        // The canonical form excludes signature fields, so the fingerprint
        // matches between the signed and unsigned builds of the same data.
        let now = Utc::now();
        let s = signer();
        let a = ReceiptBuilder::new("e", "j", "US", "p")
            .output_data(json!({"x": 1}))
            .build(Some(&s), now)
            .unwrap();
        let b = ReceiptBuilder::new("e", "j", "US", "p")
            .output_data(json!({"x": 1}))
            .build(None, now)
            .unwrap();
        assert_eq!(receipt_hash(&a).unwrap(), receipt_hash(&b).unwrap());
    }
}
