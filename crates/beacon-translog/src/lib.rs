// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Append-only transparency log with Merkle root and inclusion proofs."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! In-memory, mutex-serialized transparency log.
//!
//! Every appended [`TransparencyEntry`] gets the next `log_index` (strictly
//! monotonic, gap-free). Leaves are SHA-256 over the canonical entry form;
//! the Merkle tree promotes an odd node to the next level unhashed, so a
//! single-entry log has `root == leaf`. Entries are also forwarded to an
//! external [`TransparencySink`].

use async_trait::async_trait;
use beacon_canonical::canonicalize;
use beacon_core::TransparencyEntry;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

type LeafHash = [u8; 32];

/// External persistence for appended entries.
#[async_trait]
pub trait TransparencySink: Send + Sync {
    /// Persist one appended entry.
    async fn persist(&self, entry: &TransparencyEntry) -> Result<(), SinkError>;
}

/// Errors from a transparency sink.
#[derive(Debug, thiserror::Error)]
#[error("transparency sink failed: {0}")]
pub struct SinkError(pub String);

/// A sink that drops entries. Default when no external log store is wired.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl TransparencySink for NullSink {
    async fn persist(&self, _entry: &TransparencyEntry) -> Result<(), SinkError> {
        Ok(())
    }
}

/// A sink that records entries in memory. Test helper.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<TransparencyEntry>>,
}

#[async_trait]
impl TransparencySink for RecordingSink {
    async fn persist(&self, entry: &TransparencyEntry) -> Result<(), SinkError> {
        self.entries
            .lock()
            .expect("sink lock poisoned")
            .push(entry.clone());
        Ok(())
    }
}

impl RecordingSink {
    /// Entries persisted so far.
    pub fn entries(&self) -> Vec<TransparencyEntry> {
        self.entries.lock().expect("sink lock poisoned").clone()
    }
}

/// Which side a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingSide {
    /// Sibling is hashed to the left of the running value.
    Left,
    /// Sibling is hashed to the right of the running value.
    Right,
}

/// An inclusion proof for one log entry.
#[derive(Debug, Clone, Serialize)]
pub struct InclusionProof {
    /// Index of the proven leaf.
    pub leaf_index: u64,
    /// Sibling hashes from leaf level upward.
    pub siblings: Vec<(String, SiblingSide)>,
}

/// Draft of an entry before the log assigns its index.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    /// Execution attempt id.
    pub execution_id: String,
    /// Owning job.
    pub job_id: String,
    /// Region of the attempt.
    pub region: String,
    /// Provider id, when one was acquired.
    pub provider_id: Option<String>,
    /// Terminal status of the attempt.
    pub status: beacon_core::ExecutionStatus,
    /// Hex SHA-256 of the canonical output.
    pub output_hash: Option<String>,
    /// Hex SHA-256 of the canonical receipt.
    pub receipt_hash: Option<String>,
    /// Content address of bundled artifacts.
    pub ipfs_cid: Option<String>,
    /// Entry timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<TransparencyEntry>,
    leaves: Vec<LeafHash>,
}

/// The transparency log.
pub struct TransparencyLog {
    inner: Mutex<Inner>,
    sink: Arc<dyn TransparencySink>,
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl TransparencyLog {
    /// Log forwarding appends to the given sink.
    pub fn new(sink: Arc<dyn TransparencySink>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sink,
        }
    }

    /// Append an entry, assigning the next index. Sink failures are
    /// returned after the entry is committed locally; the log itself never
    /// loses the append.
    pub async fn append(&self, draft: EntryDraft) -> Result<TransparencyEntry, SinkError> {
        let entry = {
            let mut inner = self.inner.lock().expect("translog lock poisoned");
            let entry = TransparencyEntry {
                log_index: inner.entries.len() as u64,
                execution_id: draft.execution_id,
                job_id: draft.job_id,
                region: draft.region,
                provider_id: draft.provider_id,
                status: draft.status,
                output_hash: draft.output_hash,
                receipt_hash: draft.receipt_hash,
                ipfs_cid: draft.ipfs_cid,
                timestamp: draft.timestamp,
            };
            inner.leaves.push(leaf_hash(&entry));
            inner.entries.push(entry.clone());
            entry
        };
        self.sink.persist(&entry).await?;
        Ok(entry)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("translog lock poisoned").entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, in index order.
    pub fn entries(&self) -> Vec<TransparencyEntry> {
        self.inner
            .lock()
            .expect("translog lock poisoned")
            .entries
            .clone()
    }

    /// Hex Merkle root over the current entries, `None` while empty.
    pub fn root(&self) -> Option<String> {
        let inner = self.inner.lock().expect("translog lock poisoned");
        merkle_root(&inner.leaves).map(hex::encode)
    }

    /// Inclusion proof for the entry at `index`.
    pub fn proof(&self, index: u64) -> Option<InclusionProof> {
        let inner = self.inner.lock().expect("translog lock poisoned");
        let leaves = &inner.leaves;
        if index as usize >= leaves.len() {
            return None;
        }

        let mut siblings = Vec::new();
        let mut level: Vec<LeafHash> = leaves.clone();
        let mut pos = index as usize;
        while level.len() > 1 {
            let sibling = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
            if sibling < level.len() {
                let side = if sibling < pos {
                    SiblingSide::Left
                } else {
                    SiblingSide::Right
                };
                siblings.push((hex::encode(level[sibling]), side));
            }
            level = next_level(&level);
            pos /= 2;
        }

        Some(InclusionProof {
            leaf_index: index,
            siblings,
        })
    }

    /// Recompute a root from a leaf hash and a proof; `true` when it matches
    /// the supplied root.
    pub fn verify_proof(leaf_hex: &str, proof: &InclusionProof, root_hex: &str) -> bool {
        let Ok(mut running) = hex::decode(leaf_hex) else {
            return false;
        };
        for (sibling_hex, side) in &proof.siblings {
            let Ok(sibling) = hex::decode(sibling_hex) else {
                return false;
            };
            let mut hasher = Sha256::new();
            match side {
                SiblingSide::Left => {
                    hasher.update(&sibling);
                    hasher.update(&running);
                }
                SiblingSide::Right => {
                    hasher.update(&running);
                    hasher.update(&sibling);
                }
            }
            running = hasher.finalize().to_vec();
        }
        hex::encode(running) == root_hex
    }

    /// Leaf hash for the entry at `index`, usable with
    /// [`verify_proof`](Self::verify_proof).
    pub fn leaf(&self, index: u64) -> Option<String> {
        let inner = self.inner.lock().expect("translog lock poisoned");
        inner.leaves.get(index as usize).map(hex::encode)
    }
}

/// SHA-256 over the canonical entry form.
fn leaf_hash(entry: &TransparencyEntry) -> LeafHash {
    let value = serde_json::to_value(entry).expect("entry serializes");
    let canon = canonicalize(&value, &[]);
    let mut hasher = Sha256::new();
    hasher.update(&canon);
    hasher.finalize().into()
}

fn next_level(level: &[LeafHash]) -> Vec<LeafHash> {
    let mut out = Vec::with_capacity(level.len().div_ceil(2));
    for pair in level.chunks(2) {
        match pair {
            [left, right] => {
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                out.push(hasher.finalize().into());
            }
            // Odd node is promoted unchanged.
            [single] => out.push(*single),
            _ => unreachable!("chunks(2) yields 1..=2 items"),
        }
    }
    out
}

fn merkle_root(leaves: &[LeafHash]) -> Option<LeafHash> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    Some(level[0])
}
