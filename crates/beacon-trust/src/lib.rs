// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Ed25519 verification and the trusted-key registry."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Signature verification over canonical bytes plus the process-wide
//! trusted-key registry.
//!
//! Verification and trust evaluation are separate judgements: a signature can
//! be cryptographically valid under a key the registry has revoked.

mod registry;

pub use registry::{RegistrySnapshot, TrustRegistry, spawn_reloader};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;

/// Why verification failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// The public key is not valid base64 or not 32 bytes.
    #[error("public key is not a valid base64 Ed25519 key")]
    InvalidPublicKeyEncoding,
    /// The signature failed to decode or did not verify.
    #[error("signature does not match canonical bytes")]
    SignatureMismatch,
}

/// Verify an Ed25519 signature over canonical bytes.
///
/// Key and signature are base64-standard. A malformed key reports
/// [`VerifyError::InvalidPublicKeyEncoding`]; everything else that goes wrong
/// is a [`VerifyError::SignatureMismatch`].
pub fn verify(canon_bytes: &[u8], sig_b64: &str, pub_b64: &str) -> Result<(), VerifyError> {
    let key_bytes: [u8; 32] = B64
        .decode(pub_b64)
        .map_err(|_| VerifyError::InvalidPublicKeyEncoding)?
        .try_into()
        .map_err(|_| VerifyError::InvalidPublicKeyEncoding)?;
    let key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| VerifyError::InvalidPublicKeyEncoding)?;

    let sig_bytes: [u8; 64] = B64
        .decode(sig_b64)
        .map_err(|_| VerifyError::SignatureMismatch)?
        .try_into()
        .map_err(|_| VerifyError::SignatureMismatch)?;
    let sig = Signature::from_bytes(&sig_bytes);

    key.verify(canon_bytes, &sig)
        .map_err(|_| VerifyError::SignatureMismatch)
}

/// A process signing identity for receipts.
#[derive(Clone)]
pub struct ReceiptSigner {
    key: SigningKey,
}

impl std::fmt::Debug for ReceiptSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptSigner")
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

/// Errors loading a signing key.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The private key is not valid base64 or not 32 bytes.
    #[error("private key is not a valid base64 Ed25519 seed")]
    InvalidPrivateKey,
}

impl ReceiptSigner {
    /// Load a signer from a base64-standard 32-byte seed.
    pub fn from_b64(seed_b64: &str) -> Result<Self, KeyError> {
        let seed: [u8; 32] = B64
            .decode(seed_b64)
            .map_err(|_| KeyError::InvalidPrivateKey)?
            .try_into()
            .map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Sign bytes, returning a base64-standard signature.
    pub fn sign_b64(&self, bytes: &[u8]) -> String {
        B64.encode(self.key.sign(bytes).to_bytes())
    }

    /// The base64-standard public key matching this signer.
    pub fn public_key_b64(&self) -> String {
        B64.encode(self.key.verifying_key().to_bytes())
    }
}

/// Derive a key id for an unregistered public key: the first 16 hex chars of
/// its SHA-256. Registered keys use their registry `kid` instead.
pub fn fingerprint_kid(pub_b64: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(pub_b64.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (SigningKey, String) {
        let key = SigningKey::generate(&mut OsRng);
        let pub_b64 = B64.encode(key.verifying_key().to_bytes());
        (key, pub_b64)
    }

    #[test]
    fn verify_accepts_valid_signature() {
        let (key, pub_b64) = keypair();
        let msg = b"canonical-bytes";
        let sig_b64 = B64.encode(key.sign(msg).to_bytes());
        assert!(verify(msg, &sig_b64, &pub_b64).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let (key, pub_b64) = keypair();
        let sig_b64 = B64.encode(key.sign(b"original").to_bytes());
        assert_eq!(
            verify(b"tampered", &sig_b64, &pub_b64),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn verify_rejects_bad_key_encoding() {
        assert_eq!(
            verify(b"m", "c2ln", "not!!base64"),
            Err(VerifyError::InvalidPublicKeyEncoding)
        );
        // Valid base64, wrong length.
        assert_eq!(
            verify(b"m", "c2ln", "c2hvcnQ="),
            Err(VerifyError::InvalidPublicKeyEncoding)
        );
    }

    #[test]
    fn verify_rejects_bad_signature_encoding() {
        let (_, pub_b64) = keypair();
        assert_eq!(
            verify(b"m", "bm90LWEtc2ln", &pub_b64),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn signer_roundtrip() {
        let seed = [7u8; 32];
        let signer = ReceiptSigner::from_b64(&B64.encode(seed)).unwrap();
        let sig = signer.sign_b64(b"receipt");
        assert!(verify(b"receipt", &sig, &signer.public_key_b64()).is_ok());
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint_kid("AAAA");
        assert_eq!(a, fingerprint_kid("AAAA"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, fingerprint_kid("BBBB"));
    }
}
