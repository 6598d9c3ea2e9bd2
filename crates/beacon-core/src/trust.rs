// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trust statuses and trusted-key records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of evaluating a public key against the trusted-key registry at a
/// given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustStatus {
    /// The key is registered, active, and within its validity window.
    Trusted,
    /// The key is not in the registry.
    Unknown,
    /// The key is registered but marked revoked.
    Revoked,
    /// The key's `not_before` is in the future.
    NotYetValid,
    /// The key's `not_after` has passed.
    Expired,
}

impl TrustStatus {
    /// Wire string used in `trust_violation:<status>` codes.
    pub fn as_str(self) -> &'static str {
        match self {
            TrustStatus::Trusted => "trusted",
            TrustStatus::Unknown => "unknown",
            TrustStatus::Revoked => "revoked",
            TrustStatus::NotYetValid => "not_yet_valid",
            TrustStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry lifecycle state of a trusted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// The key may sign job specs.
    Active,
    /// The key has been revoked; submissions are rejected.
    Revoked,
}

/// A single entry in the trusted-keys file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedKey {
    /// Key identifier, used to scope nonces and failure counters.
    pub kid: String,

    /// Base64-standard Ed25519 public key.
    pub public_key: String,

    /// Lifecycle state.
    pub status: KeyStatus,

    /// Optional start of the validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Optional end of the validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl TrustedKey {
    /// Evaluate this key at `now`, yielding the non-`Unknown` statuses.
    pub fn evaluate(&self, now: DateTime<Utc>) -> TrustStatus {
        if self.status == KeyStatus::Revoked {
            return TrustStatus::Revoked;
        }
        if let Some(nb) = self.not_before {
            if now < nb {
                return TrustStatus::NotYetValid;
            }
        }
        if let Some(na) = self.not_after {
            if now > na {
                return TrustStatus::Expired;
            }
        }
        TrustStatus::Trusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(status: KeyStatus) -> TrustedKey {
        TrustedKey {
            kid: "k1".into(),
            public_key: "cGs=".into(),
            status,
            not_before: None,
            not_after: None,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn active_key_without_window_is_trusted() {
        assert_eq!(
            key(KeyStatus::Active).evaluate(at("2025-06-01T00:00:00Z")),
            TrustStatus::Trusted
        );
    }

    #[test]
    fn revoked_wins_over_validity_window() {
        let mut k = key(KeyStatus::Revoked);
        k.not_before = Some(at("2030-01-01T00:00:00Z"));
        assert_eq!(k.evaluate(at("2025-06-01T00:00:00Z")), TrustStatus::Revoked);
    }

    #[test]
    fn window_edges() {
        let mut k = key(KeyStatus::Active);
        k.not_before = Some(at("2025-01-01T00:00:00Z"));
        k.not_after = Some(at("2025-12-31T00:00:00Z"));

        assert_eq!(
            k.evaluate(at("2024-12-31T23:59:59Z")),
            TrustStatus::NotYetValid
        );
        // Boundary instants are inside the window.
        assert_eq!(k.evaluate(at("2025-01-01T00:00:00Z")), TrustStatus::Trusted);
        assert_eq!(k.evaluate(at("2025-12-31T00:00:00Z")), TrustStatus::Trusted);
        assert_eq!(k.evaluate(at("2025-12-31T00:00:01Z")), TrustStatus::Expired);
    }

    #[test]
    fn status_wire_strings() {
        assert_eq!(TrustStatus::NotYetValid.as_str(), "not_yet_valid");
        assert_eq!(
            serde_json::to_string(&TrustStatus::Revoked).unwrap(),
            "\"revoked\""
        );
    }
}
