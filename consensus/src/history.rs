//! Append-only record of finalized blocks

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::types::BlockId;
use ledger_core::{LedgerSnapshot, PublicKey, ValidatorMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One finalized block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Revision that reached finality
    pub revision: u32,

    /// Finality digest the majority signed
    pub digest: String,

    /// Validators banned in the deciding round
    pub banned: BTreeSet<PublicKey>,

    /// Signers of the winning digest
    pub valid_validators: BTreeSet<PublicKey>,

    /// Merged message that was applied
    pub message: ValidatorMessage,

    /// Resulting snapshot
    pub snapshot: LedgerSnapshot,

    /// Local finalization time
    pub finalized_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Id of the resulting snapshot
    pub fn block_id(&self) -> BlockId {
        self.snapshot.id
    }
}

/// Origin snapshot plus every transition applied after it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerHistory {
    origin: LedgerSnapshot,
    entries: BTreeMap<BlockId, HistoryEntry>,
}

impl LedgerHistory {
    /// Start a history at `origin`
    pub fn new(origin: LedgerSnapshot) -> Self {
        Self {
            origin,
            entries: BTreeMap::new(),
        }
    }

    /// Oldest snapshot still known
    pub fn origin(&self) -> &LedgerSnapshot {
        &self.origin
    }

    /// Newest snapshot
    pub fn latest(&self) -> &LedgerSnapshot {
        self.entries
            .values()
            .next_back()
            .map(|e| &e.snapshot)
            .unwrap_or(&self.origin)
    }

    /// Number of recorded transitions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No transitions recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a transition; it must extend the newest snapshot
    pub fn append(&mut self, entry: HistoryEntry) -> Result<()> {
        let latest = self.latest();
        if entry.snapshot.id != latest.id + 1 || entry.snapshot.hash_previous_block != latest.hash {
            return Err(Error::Validation(format!(
                "history entry {} does not extend block {}",
                entry.snapshot.id, latest.id
            )));
        }
        self.entries.insert(entry.block_id(), entry);
        Ok(())
    }

    /// Entries with `start <= block_id <= end`
    pub fn interval(&self, start: BlockId, end: BlockId) -> Vec<&HistoryEntry> {
        if start > end {
            return Vec::new();
        }
        self.entries.range(start..=end).map(|(_, e)| e).collect()
    }

    /// Forget everything before `start`; the snapshot at `start - 1` becomes the origin
    pub fn prune_to(&mut self, start: BlockId) {
        if start <= self.origin.id + 1 {
            return;
        }
        let kept = self.entries.split_off(&start);
        if let Some(new_origin) = self.entries.remove(&(start - 1)) {
            self.origin = new_origin.snapshot;
        }
        self.entries = kept;
    }

    /// Keep at most `blocks` transitions
    pub fn retain_last(&mut self, blocks: u64) {
        let latest = self.latest().id;
        if latest > self.origin.id + blocks {
            self.prune_to(latest - blocks + 1);
        }
    }

    /// Every entry chains to its predecessor by hash
    pub fn verify_chain(&self) -> bool {
        let mut previous = &self.origin;
        for entry in self.entries.values() {
            if entry.snapshot.id != previous.id + 1 || entry.snapshot.hash_previous_block != previous.hash {
                return false;
            }
            previous = &entry.snapshot;
        }
        true
    }
}
