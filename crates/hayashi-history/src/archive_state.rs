//! History archive state: the durable record of the bucket list.
//!
//! The archive state is a JSON document naming, for every level, the
//! curr and snap bucket hashes plus the state of the level's outgoing
//! merge: either `{"state":"clear"}`, an input recipe
//! `{"state":"input","old":..,"new":..,"shadows":[..]}`, or a finished
//! output `{"state":"output","hash":..}`.
//!
//! The round-trip contract: a state captured before shutdown and
//! assumed after restart yields a bucket list whose next `add_batch`
//! produces a hash bit-identical to an uninterrupted run. Merges
//! recorded in input form are restarted from scratch on assumption,
//! which is sound because merging is deterministic.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use hayashi_bucket::{BucketLevelSnapshot, BucketManager, FutureBucketSnapshot};
use hayashi_common::Hash256;

use crate::error::HistoryError;

/// Current archive-state format version.
pub const HISTORY_ARCHIVE_STATE_VERSION: u32 = 1;

/// The durable description of a bucket list at one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArchiveState {
    pub version: u32,

    /// Identifier of the writing node software, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// The last closed ledger this state describes.
    pub current_ledger: u32,

    /// Per-level bucket hashes and merge states, level 0 first.
    pub current_buckets: Vec<BucketLevelSnapshot>,
}

impl HistoryArchiveState {
    /// Capture the manager's current bucket list.
    pub fn capture(manager: &BucketManager) -> Self {
        Self {
            version: HISTORY_ARCHIVE_STATE_VERSION,
            server: None,
            current_ledger: manager.bucket_list().ledger_seq(),
            current_buckets: manager.capture_levels(),
        }
    }

    /// Rebuild the manager's bucket list from this state, restarting
    /// merges persisted in input form.
    pub fn assume(
        &self,
        manager: &mut BucketManager,
        max_protocol: u32,
    ) -> Result<(), HistoryError> {
        manager.assume_state(&self.current_buckets, self.current_ledger, max_protocol)?;
        info!(
            ledger = self.current_ledger,
            "assumed archive state"
        );
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, HistoryError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, HistoryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// True when no level records a merge that would need restarting.
    pub fn futures_all_resolved(&self) -> bool {
        self.current_buckets
            .iter()
            .all(|level| !matches!(level.next, FutureBucketSnapshot::Input { .. }))
    }

    /// Every non-zero bucket hash the state references: curr and snap
    /// slots, merge inputs, and merge outputs. A node restarting from
    /// this state needs exactly these files on disk.
    pub fn referenced_bucket_hashes(&self) -> BTreeSet<Hash256> {
        let mut hashes = BTreeSet::new();
        let mut note = |h: &Hash256| {
            if !h.is_zero() {
                hashes.insert(*h);
            }
        };
        for level in &self.current_buckets {
            note(&level.curr);
            note(&level.snap);
            match &level.next {
                FutureBucketSnapshot::Clear => {}
                FutureBucketSnapshot::Input { old, new, shadows } => {
                    note(old);
                    note(new);
                    shadows.iter().for_each(&mut note);
                }
                FutureBucketSnapshot::Output { hash } => note(hash),
            }
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> HistoryArchiveState {
        let h = |n: u8| Hash256::hash(&[n]);
        let mut levels: Vec<BucketLevelSnapshot> = (0..11)
            .map(|_| BucketLevelSnapshot {
                curr: Hash256::ZERO,
                snap: Hash256::ZERO,
                next: FutureBucketSnapshot::Clear,
            })
            .collect();
        levels[0].curr = h(1);
        levels[1] = BucketLevelSnapshot {
            curr: h(2),
            snap: h(3),
            next: FutureBucketSnapshot::Input {
                old: h(4),
                new: h(3),
                shadows: vec![h(1)],
            },
        };
        levels[2].next = FutureBucketSnapshot::Output { hash: h(5) };
        HistoryArchiveState {
            version: HISTORY_ARCHIVE_STATE_VERSION,
            server: Some("hayashi test".into()),
            current_ledger: 123,
            current_buckets: levels,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let state = sample_state();
        let json = state.to_json().unwrap();
        let back = HistoryArchiveState::from_json(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_json_shape() {
        let state = sample_state();
        let value: serde_json::Value =
            serde_json::from_str(&state.to_json().unwrap()).unwrap();
        assert_eq!(value["currentLedger"], 123);
        assert_eq!(value["currentBuckets"][0]["next"]["state"], "clear");
        assert_eq!(value["currentBuckets"][1]["next"]["state"], "input");
        assert_eq!(
            value["currentBuckets"][1]["next"]["shadows"][0],
            Hash256::hash(&[1]).to_hex()
        );
        assert_eq!(value["currentBuckets"][2]["next"]["state"], "output");
        // Hashes serialize as 64-digit hex strings.
        assert_eq!(
            value["currentBuckets"][0]["curr"].as_str().unwrap().len(),
            64
        );
    }

    #[test]
    fn test_futures_all_resolved() {
        let mut state = sample_state();
        assert!(!state.futures_all_resolved());
        state.current_buckets[1].next = FutureBucketSnapshot::Clear;
        assert!(state.futures_all_resolved());
    }

    #[test]
    fn test_referenced_hashes() {
        let state = sample_state();
        let refs = state.referenced_bucket_hashes();
        for n in 1..=5u8 {
            assert!(refs.contains(&Hash256::hash(&[n])));
        }
        assert!(!refs.contains(&Hash256::ZERO));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.json");
        let state = sample_state();
        state.save(&path).unwrap();
        assert_eq!(HistoryArchiveState::load(&path).unwrap(), state);
    }
}
