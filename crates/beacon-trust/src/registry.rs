// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trusted-key registry with atomic snapshot swap and file hot reload.
//!
//! Readers take one brief lock to clone the current `Arc` snapshot; all file
//! I/O happens outside the lock. A background task rereads the file on an
//! interval and swaps the snapshot; a parse failure keeps the previous
//! snapshot in place.

use beacon_core::{Clock, TrustStatus, TrustedKey};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// An immutable view of the trusted-keys file at one load.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    keys: Vec<TrustedKey>,
    /// When this snapshot was loaded.
    pub loaded_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    fn find(&self, pub_b64: &str) -> Option<&TrustedKey> {
        self.keys.iter().find(|k| k.public_key == pub_b64)
    }

    /// Number of keys in the snapshot.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the snapshot holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Errors loading the trusted-keys file.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The file could not be read.
    #[error("cannot read trusted keys file {path}: {source}")]
    Io {
        /// File path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a JSON array of key records.
    #[error("cannot parse trusted keys file {path}: {source}")]
    Parse {
        /// File path that failed.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Process-wide trusted-key registry.
pub struct TrustRegistry {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TrustRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRegistry")
            .field("path", &self.path)
            .field("keys", &self.snapshot().len())
            .finish()
    }
}

impl TrustRegistry {
    /// Registry with no backing file. Every key evaluates `Unknown`.
    pub fn empty(clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            clock,
        }
    }

    /// Load the registry from a trusted-keys file.
    pub fn from_file(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, RegistryError> {
        let registry = Self {
            path: Some(path.as_ref().to_path_buf()),
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            clock,
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Registry seeded directly with keys; used by tests and the mock wiring.
    pub fn with_keys(keys: Vec<TrustedKey>, clock: Arc<dyn Clock>) -> Self {
        let registry = Self::empty(clock);
        registry.swap(keys);
        registry
    }

    /// Reread the backing file and atomically swap the snapshot.
    ///
    /// On failure the current snapshot stays in place and the error is
    /// returned for the caller to log.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let keys: Vec<TrustedKey> =
            serde_json::from_str(&raw).map_err(|source| RegistryError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        debug!(count = keys.len(), path = %path.display(), "trusted keys reloaded");
        self.swap(keys);
        Ok(())
    }

    fn swap(&self, keys: Vec<TrustedKey>) {
        let snapshot = Arc::new(RegistrySnapshot {
            keys,
            loaded_at: Some(self.clock.now()),
        });
        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        *guard = snapshot;
    }

    /// Clone the current snapshot. Lock-held time is one `Arc` clone.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    /// Evaluate a public key right now, returning the status and a
    /// human-readable reason.
    pub fn evaluate(&self, pub_b64: &str) -> (TrustStatus, String) {
        self.evaluate_at(pub_b64, self.clock.now())
    }

    /// Evaluate a public key at an explicit instant.
    pub fn evaluate_at(&self, pub_b64: &str, now: DateTime<Utc>) -> (TrustStatus, String) {
        let snapshot = self.snapshot();
        match snapshot.find(pub_b64) {
            None => (
                TrustStatus::Unknown,
                "public key is not in the trusted-key registry".into(),
            ),
            Some(key) => {
                let status = key.evaluate(now);
                let reason = match status {
                    TrustStatus::Trusted => format!("key '{}' is trusted", key.kid),
                    TrustStatus::Revoked => format!("key '{}' is revoked", key.kid),
                    TrustStatus::NotYetValid => {
                        format!("key '{}' is not yet within its validity window", key.kid)
                    }
                    TrustStatus::Expired => {
                        format!("key '{}' is past its validity window", key.kid)
                    }
                    TrustStatus::Unknown => unreachable!("registered keys are never unknown"),
                };
                (status, reason)
            }
        }
    }

    /// Key id used to scope nonces and failure counters: the registry `kid`
    /// when the key is registered, otherwise a stable fingerprint.
    pub fn kid_for(&self, pub_b64: &str) -> String {
        self.snapshot()
            .find(pub_b64)
            .map(|k| k.kid.clone())
            .unwrap_or_else(|| crate::fingerprint_kid(pub_b64))
    }
}

/// Spawn the background reloader loop.
///
/// Rereads the file every `interval` until `shutdown` flips to `true`.
/// Reload failures are logged and do not disturb the active snapshot.
pub fn spawn_reloader(
    registry: Arc<TrustRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = registry.reload() {
                        warn!(error = %err, "trusted keys reload failed; keeping previous snapshot");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("trusted keys reloader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{KeyStatus, ManualClock, SystemClock};
    use std::io::Write as _;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    fn active_key(kid: &str, pub_b64: &str) -> TrustedKey {
        TrustedKey {
            kid: kid.into(),
            public_key: pub_b64.into(),
            status: KeyStatus::Active,
            not_before: None,
            not_after: None,
        }
    }

    #[test]
    fn unknown_key_reports_unknown() {
        let reg = TrustRegistry::empty(clock());
        let (status, reason) = reg.evaluate("bm8ta2V5");
        assert_eq!(status, TrustStatus::Unknown);
        assert!(reason.contains("not in the trusted-key registry"));
    }

    #[test]
    fn registered_key_evaluates_by_window() {
        let start = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let manual = ManualClock::at(start);
        let mut key = active_key("k1", "cGsx");
        key.not_after = Some(start + chrono::Duration::days(1));
        let reg = TrustRegistry::with_keys(vec![key], Arc::new(manual.clone()));

        assert_eq!(reg.evaluate("cGsx").0, TrustStatus::Trusted);
        manual.advance(chrono::Duration::days(2));
        assert_eq!(reg.evaluate("cGsx").0, TrustStatus::Expired);
    }

    #[test]
    fn kid_for_prefers_registry_kid() {
        let reg = TrustRegistry::with_keys(vec![active_key("portal-1", "cGsx")], clock());
        assert_eq!(reg.kid_for("cGsx"), "portal-1");
        let fp = reg.kid_for("dW5rbm93bg==");
        assert_eq!(fp.len(), 16);
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"kid": "k1", "public_key": "cGsx", "status": "active"}}]"#
        )
        .unwrap();
        let reg = TrustRegistry::from_file(file.path(), clock()).unwrap();
        assert_eq!(reg.evaluate("cGsx").0, TrustStatus::Trusted);

        // Revoke the key on disk and reload.
        let mut file = std::fs::File::create(file.path()).unwrap();
        writeln!(
            file,
            r#"[{{"kid": "k1", "public_key": "cGsx", "status": "revoked"}}]"#
        )
        .unwrap();
        reg.reload().unwrap();
        assert_eq!(reg.evaluate("cGsx").0, TrustStatus::Revoked);
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"kid": "k1", "public_key": "cGsx", "status": "active"}}]"#
        )
        .unwrap();
        let reg = TrustRegistry::from_file(file.path(), clock()).unwrap();

        std::fs::write(file.path(), "not json").unwrap();
        assert!(reg.reload().is_err());
        assert_eq!(reg.evaluate("cGsx").0, TrustStatus::Trusted);
    }

    #[tokio::test]
    async fn reloader_loop_stops_on_shutdown() {
        let reg = Arc::new(TrustRegistry::empty(clock()));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_reloader(reg, Duration::from_millis(10), rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
