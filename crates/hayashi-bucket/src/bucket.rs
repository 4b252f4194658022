//! Individual buckets: immutable, sorted, content-addressed files.
//!
//! A bucket is identified by the SHA-256 of its framed record stream.
//! Two buckets with equal hashes have byte-identical contents, and the
//! empty bucket has the well-known all-zero hash (and no file at all).
//! Buckets never change after creation; all mutation in the storage
//! engine happens by writing new buckets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stellar_xdr::curr::{LedgerEntry, LedgerKey, Limits, WriteXdr};
use tracing::debug;

use hayashi_common::Hash256;

use crate::counters::MergeCounters;
use crate::entry::{compare_entries, BucketEntry};
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::BucketStore;
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

/// An immutable bucket file.
///
/// The in-memory object is just the identity (hash), the backing file
/// path and a record count; entry access goes through
/// [`Bucket::open_input_iterator`]. The bucket list is not a read index,
/// so there is deliberately no point-lookup structure here.
pub struct Bucket {
    hash: Hash256,
    path: Option<PathBuf>,
    entry_count: usize,
}

impl Bucket {
    /// The empty bucket: zero hash, no file.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            hash: Hash256::ZERO,
            path: None,
            entry_count: 0,
        })
    }

    pub(crate) fn new(hash: Hash256, path: PathBuf, entry_count: usize) -> Self {
        Self {
            hash,
            path: Some(path),
            entry_count,
        }
    }

    /// Open an existing bucket file, verifying its contents against the
    /// expected hash. Fails with [`BucketError::BucketCorrupt`] when the
    /// stream does not hash to `expected`.
    pub(crate) fn open(path: &Path, expected: Hash256) -> Result<Self> {
        let iter = BucketInputIterator::from_path(path)?;
        let (hash, entry_count) = iter.drain_and_hash()?;
        if hash != expected {
            return Err(BucketError::BucketCorrupt(format!(
                "{} hashes to {hash}, expected {expected}",
                path.display()
            )));
        }
        Ok(Self::new(expected, path.to_path_buf(), entry_count))
    }

    /// Serialize a fresh per-ledger batch into a new bucket.
    ///
    /// Rejects batches in which any key appears in more than one of the
    /// three lists, or more than once within one list. Below the
    /// INIT/META protocol gate, init entries are stored as LIVE records.
    pub(crate) fn fresh(
        store: &BucketStore,
        protocol: u32,
        init: Vec<LedgerEntry>,
        live: Vec<LedgerEntry>,
        dead: Vec<LedgerKey>,
    ) -> Result<Arc<Bucket>> {
        check_batch_keys(&init, &live, &dead)?;

        let use_init = protocol >= FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY;
        let mut entries: Vec<BucketEntry> =
            Vec::with_capacity(init.len() + live.len() + dead.len());
        for entry in init {
            entries.push(if use_init {
                BucketEntry::Init(entry)
            } else {
                BucketEntry::Live(entry)
            });
        }
        entries.extend(live.into_iter().map(BucketEntry::Live));
        entries.extend(dead.into_iter().map(BucketEntry::Dead));
        entries.sort_by(compare_entries);

        // Batch serialization feeds a throwaway counter set: the merge
        // counters cover merges only, so their totals survive a restart
        // (a resumed node re-runs in-flight merges but never re-runs
        // past ledgers' batch writes).
        let mut mc = MergeCounters::default();
        let tmp = store.temp_path();
        let mut out = BucketOutputIterator::new(&tmp, protocol, true)?;
        for entry in entries {
            out.put(entry, &mut mc)?;
        }
        let (tmp, hash, count) = out.finish(&mut mc)?;

        if count == 0 {
            let _ = std::fs::remove_file(&tmp);
            return Ok(Bucket::empty());
        }
        debug!(hash = %hash, records = count, "fresh bucket");
        store.adopt_temp_file(&tmp, hash, count)
    }

    /// The content hash. Constant-time accessor; computed at creation.
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_zero()
    }

    /// Number of records in the file, including a META record if present.
    pub fn len(&self) -> usize {
        self.entry_count
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Open a streaming iterator over this bucket's entries. Each call
    /// reopens the file, so iteration is restartable.
    pub fn open_input_iterator(&self) -> Result<BucketInputIterator> {
        match &self.path {
            Some(path) => BucketInputIterator::from_path(path),
            None => Ok(BucketInputIterator::empty()),
        }
    }
}

impl PartialEq for Bucket {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Bucket {}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("hash", &self.hash.to_hex())
            .field("entries", &self.entry_count)
            .finish()
    }
}

/// Reject a batch whose key sets overlap or repeat.
fn check_batch_keys(
    init: &[LedgerEntry],
    live: &[LedgerEntry],
    dead: &[LedgerKey],
) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    let mut note = |key: &LedgerKey, list: &str| -> Result<()> {
        let bytes = key
            .to_xdr(Limits::none())
            .map_err(|e| BucketError::Serialization(format!("key encode failed: {e}")))?;
        if !seen.insert(bytes) {
            return Err(BucketError::BatchInvariantViolated(format!(
                "duplicate key in batch ({list} list)"
            )));
        }
        Ok(())
    };
    for entry in init {
        note(&crate::entry::ledger_entry_key(entry), "init")?;
    }
    for entry in live {
        note(&crate::entry::ledger_entry_key(entry), "live")?;
    }
    for key in dead {
        note(key, "dead")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::BucketManager;
    use crate::test_fixtures::{account_entry, account_key};

    const PROTOCOL: u32 = 11;

    fn manager() -> (tempfile::TempDir, BucketManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().join("buckets")).unwrap();
        (dir, manager)
    }

    #[test]
    fn test_empty_bucket() {
        let bucket = Bucket::empty();
        assert!(bucket.is_empty());
        assert_eq!(bucket.hash(), Hash256::ZERO);
        assert_eq!(bucket.len(), 0);
        assert!(bucket.path().is_none());
        assert!(!bucket.open_input_iterator().unwrap().has_next());
    }

    #[test]
    fn test_fresh_sorts_and_interns() {
        let (_dir, manager) = manager();
        let live = vec![account_entry([2u8; 32], 200), account_entry([1u8; 32], 100)];
        let bucket = manager
            .fresh_bucket(PROTOCOL, vec![], live.clone(), vec![])
            .unwrap();
        assert!(!bucket.is_empty());
        assert_eq!(bucket.len(), 3); // META + 2

        let entries = bucket
            .open_input_iterator()
            .unwrap()
            .collect_remaining()
            .unwrap();
        assert_eq!(entries[0].key().unwrap(), account_key([1u8; 32]));
        assert_eq!(entries[1].key().unwrap(), account_key([2u8; 32]));

        // Identical contents intern to the same object.
        let again = manager
            .fresh_bucket(PROTOCOL, vec![], live, vec![])
            .unwrap();
        assert!(Arc::ptr_eq(&bucket, &again));
    }

    #[test]
    fn test_fresh_converts_init_below_gate() {
        let (_dir, manager) = manager();
        let init = vec![account_entry([1u8; 32], 1)];

        let pre = manager
            .fresh_bucket(PROTOCOL - 1, init.clone(), vec![], vec![])
            .unwrap();
        let entries = pre
            .open_input_iterator()
            .unwrap()
            .collect_remaining()
            .unwrap();
        assert!(entries[0].is_live());

        let post = manager.fresh_bucket(PROTOCOL, init, vec![], vec![]).unwrap();
        let entries = post
            .open_input_iterator()
            .unwrap()
            .collect_remaining()
            .unwrap();
        assert!(entries[0].is_init());
    }

    #[test]
    fn test_fresh_rejects_overlapping_batch() {
        let (_dir, manager) = manager();
        let err = manager
            .fresh_bucket(
                PROTOCOL,
                vec![account_entry([1u8; 32], 1)],
                vec![],
                vec![account_key([1u8; 32])],
            )
            .unwrap_err();
        assert!(matches!(err, BucketError::BatchInvariantViolated(_)));

        let err = manager
            .fresh_bucket(
                PROTOCOL,
                vec![],
                vec![account_entry([2u8; 32], 1), account_entry([2u8; 32], 2)],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, BucketError::BatchInvariantViolated(_)));
    }

    #[test]
    fn test_fresh_empty_batch() {
        let (_dir, manager) = manager();
        // Below the gate an empty batch is the empty bucket; at or after
        // it, a META-only bucket with a real hash.
        let pre = manager
            .fresh_bucket(PROTOCOL - 1, vec![], vec![], vec![])
            .unwrap();
        assert!(pre.is_empty());

        let post = manager.fresh_bucket(PROTOCOL, vec![], vec![], vec![]).unwrap();
        assert!(!post.is_empty());
        assert_eq!(post.len(), 1);
    }

    #[test]
    fn test_corrupt_file_detected() {
        let (_dir, manager) = manager();
        let bucket = manager
            .fresh_bucket(PROTOCOL, vec![], vec![account_entry([1u8; 32], 1)], vec![])
            .unwrap();
        let path = bucket.path().unwrap().to_path_buf();
        let hash = bucket.hash();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = Bucket::open(&path, hash).unwrap_err();
        assert!(matches!(err, BucketError::BucketCorrupt(_)));
    }

    #[test]
    fn test_reopen_same_hash() {
        let (_dir, manager) = manager();
        let bucket = manager
            .fresh_bucket(PROTOCOL, vec![], vec![account_entry([3u8; 32], 3)], vec![])
            .unwrap();
        let reopened = Bucket::open(bucket.path().unwrap(), bucket.hash()).unwrap();
        assert_eq!(reopened.hash(), bucket.hash());
        assert_eq!(reopened.len(), bucket.len());
    }
}
