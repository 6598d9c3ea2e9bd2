// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the Beacon runner.
//!
//! Every rejection carries a stable wire code surfaced verbatim to external
//! contracts. Parameterised codes render as `category:detail`, e.g.
//! `missing_field:signature` or `trust_violation:revoked`.

use crate::trust::TrustStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Stable taxonomy codes emitted by admission and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required field is absent (`missing_field:<field>`).
    MissingField(String),
    /// A field is present but invalid (`invalid_field:<field>`).
    InvalidField(String),
    /// The public key could not be base64-decoded or has the wrong length.
    InvalidEncodingPublicKey,
    /// Canonical serialization of the payload failed.
    CanonicalizationError,
    /// Ed25519 verification failed over the canonical bytes.
    SignatureMismatch,
    /// The signing key is not trusted (`trust_violation:<status>`).
    TrustViolation(TrustStatus),
    /// The submission timestamp is outside the accepted window or malformed.
    TimestampInvalid(TimestampReason),
    /// The `(kid, nonce)` pair was already seen within the replay window.
    ReplayDetected,
    /// A protection backend is unavailable (`protection_unavailable:<what>`).
    ProtectionUnavailable(String),
    /// Too many signature failures from this `(ip, kid)` in the window.
    RateLimitExceeded,
    /// The request body could not be read.
    InvalidBody,
    /// The request body is not valid JSON.
    InvalidJson,
    /// The durable store is unavailable.
    StoreUnavailable,
}

/// Why a timestamp was rejected. Surfaced under `details.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampReason {
    /// Older than the maximum accepted age.
    TooOld,
    /// Further in the future than the permitted skew.
    TooNew,
    /// Not parseable as RFC3339.
    FormatInvalid,
}

impl TimestampReason {
    /// Wire string for the `details.reason` field.
    pub fn as_str(self) -> &'static str {
        match self {
            TimestampReason::TooOld => "too_old",
            TimestampReason::TooNew => "too_new",
            TimestampReason::FormatInvalid => "format_invalid",
        }
    }
}

impl ErrorCode {
    /// Render the stable wire code.
    pub fn code(&self) -> String {
        match self {
            ErrorCode::MissingField(f) => format!("missing_field:{f}"),
            ErrorCode::InvalidField(f) => format!("invalid_field:{f}"),
            ErrorCode::InvalidEncodingPublicKey => "invalid_encoding:public_key".into(),
            ErrorCode::CanonicalizationError => "canonicalization_error".into(),
            ErrorCode::SignatureMismatch => "signature_mismatch".into(),
            ErrorCode::TrustViolation(status) => format!("trust_violation:{}", status.as_str()),
            ErrorCode::TimestampInvalid(_) => "timestamp_invalid".into(),
            ErrorCode::ReplayDetected => "replay_detected".into(),
            ErrorCode::ProtectionUnavailable(what) => format!("protection_unavailable:{what}"),
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded".into(),
            ErrorCode::InvalidBody => "invalid_body".into(),
            ErrorCode::InvalidJson => "invalid_json".into(),
            ErrorCode::StoreUnavailable => "store_unavailable".into(),
        }
    }

    /// HTTP status the REST collaborator maps this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::ProtectionUnavailable(_) | ErrorCode::StoreUnavailable => 503,
            _ => 400,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

// ---------------------------------------------------------------------------
// AdmissionError
// ---------------------------------------------------------------------------

/// The single structured error produced by the admission pipeline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({})", code.code())]
pub struct AdmissionError {
    /// Stable taxonomy code.
    pub code: ErrorCode,
    /// Human-readable message. Never parsed by callers.
    pub message: String,
    /// Optional structured detail, e.g. `{"reason": "too_old"}`.
    pub details: Option<serde_json::Value>,
}

impl AdmissionError {
    /// Construct an error with no details payload.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Construct an error carrying a structured details payload.
    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    /// Shorthand for `missing_field:<field>`.
    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField(field.to_string()),
            format!("required field '{field}' is missing"),
        )
    }

    /// Shorthand for `invalid_field:<field>`.
    pub fn invalid_field(field: &str, why: &str) -> Self {
        Self::new(
            ErrorCode::InvalidField(field.to_string()),
            format!("field '{field}' is invalid: {why}"),
        )
    }

    /// Shorthand for a timestamp rejection carrying `details.reason`.
    pub fn timestamp(reason: TimestampReason, message: impl Into<String>) -> Self {
        Self::with_details(
            ErrorCode::TimestampInvalid(reason),
            message,
            serde_json::json!({ "reason": reason.as_str() }),
        )
    }
}
