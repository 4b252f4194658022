//! BucketManager: bucket files, interning, garbage collection and the
//! per-ledger bookkeeping around the bucket list.
//!
//! The manager owns a directory of content-addressed bucket files
//! (`bucket-<64 hex digits>.xdr`), an interning cache mapping hashes to
//! shared bucket objects, the merge counters, the background worker
//! pool, and the bucket list itself. Exactly one manager owns a
//! directory at a time; the main loop is the only mutator of the list,
//! while workers only read input files and adopt new output files.
//!
//! # Ownership and garbage collection
//!
//! A live bucket is kept by the interning cache plus any bucket-list
//! slot or FutureBucket referencing it. [`BucketManager::forget_unreferenced_buckets`]
//! drops cache entries whose only remaining handle is the cache itself
//! and which no list slot or merge references, deleting their files.
//! Every file in the directory is therefore reachable from the list,
//! a live merge, or the archive state, or it is about to be deleted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stellar_xdr::curr::{LedgerEntry, LedgerHeader, LedgerKey};
use tracing::{debug, info, warn};

use hayashi_common::Hash256;

use crate::bucket::Bucket;
use crate::bucket_list::{BucketLevel, BucketList, BUCKET_LIST_LEVELS};
use crate::counters::MergeCounters;
use crate::future_bucket::{FutureBucket, FutureBucketSnapshot};
use crate::iterator::BucketInputIterator;
use crate::worker::WorkerPool;
use crate::{BucketError, Result};

/// Skip-list sampling periods, in ledgers.
pub const SKIP_1: u32 = 50;
pub const SKIP_2: u32 = 5000;
pub const SKIP_3: u32 = 50_000;
pub const SKIP_4: u32 = 500_000;

/// Default size of the background worker pool.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// IO operations on the bucket directory retry this many times before
/// surfacing the failure.
const IO_RETRIES: usize = 3;

/// Shared, thread-safe half of the manager: the directory, the
/// interning cache, the counters and the worker pool. Workers hold an
/// `Arc` of this while the single-threaded half (the bucket list) lives
/// on [`BucketManager`] itself.
pub(crate) struct BucketStore {
    bucket_dir: PathBuf,
    shared: Mutex<HashMap<Hash256, Arc<Bucket>>>,
    counters: Mutex<MergeCounters>,
    pool: Mutex<WorkerPool>,
    shutting_down: AtomicBool,
    temp_counter: AtomicU64,
}

impl BucketStore {
    fn new(bucket_dir: PathBuf, worker_threads: usize) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&bucket_dir)?;
        Ok(Arc::new(Self {
            bucket_dir,
            shared: Mutex::new(HashMap::new()),
            counters: Mutex::new(MergeCounters::default()),
            pool: Mutex::new(WorkerPool::new(worker_threads)),
            shutting_down: AtomicBool::new(false),
            temp_counter: AtomicU64::new(0),
        }))
    }

    pub(crate) fn bucket_path(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir.join(format!("bucket-{}.xdr", hash.to_hex()))
    }

    /// A fresh name for merge or batch output in progress. Temp names
    /// embed the pid and a counter so concurrent writers never collide.
    pub(crate) fn temp_path(&self) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.bucket_dir
            .join(format!("tmp-{}-{n}.xdr", std::process::id()))
    }

    /// Move a finished temp file into place under its content hash and
    /// intern it. If an object or file for the hash already exists the
    /// temp file is discarded; content addressing makes the survivor
    /// interchangeable.
    pub(crate) fn adopt_temp_file(
        &self,
        tmp: &Path,
        hash: Hash256,
        entry_count: usize,
    ) -> Result<Arc<Bucket>> {
        {
            let shared = self.shared.lock();
            if let Some(existing) = shared.get(&hash) {
                let _ = std::fs::remove_file(tmp);
                return Ok(Arc::clone(existing));
            }
        }

        let target = self.bucket_path(&hash);
        if target.exists() {
            let _ = std::fs::remove_file(tmp);
        } else {
            rename_with_retry(tmp, &target)?;
        }
        let bucket = Arc::new(Bucket::new(hash, target, entry_count));

        let mut shared = self.shared.lock();
        // A racing adopt may have interned the same content first.
        Ok(Arc::clone(
            shared.entry(hash).or_insert(bucket),
        ))
    }

    /// The shared bucket object for `hash`, reading and verifying the
    /// file if it is not interned yet.
    pub(crate) fn get_bucket_by_hash(&self, hash: Hash256) -> Result<Arc<Bucket>> {
        if hash.is_zero() {
            return Ok(Bucket::empty());
        }
        {
            let shared = self.shared.lock();
            if let Some(bucket) = shared.get(&hash) {
                return Ok(Arc::clone(bucket));
            }
        }
        let path = self.bucket_path(&hash);
        if !path.exists() {
            return Err(BucketError::NotFound(hash.to_hex()));
        }
        let bucket = Arc::new(Bucket::open(&path, hash)?);
        let mut shared = self.shared.lock();
        Ok(Arc::clone(shared.entry(hash).or_insert(bucket)))
    }

    pub(crate) fn read_merge_counters(&self) -> MergeCounters {
        *self.counters.lock()
    }

    pub(crate) fn incr_merge_counters(&self, delta: MergeCounters) {
        *self.counters.lock() += delta;
    }

    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.lock().execute(job);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    fn drain_pool(&self) {
        self.pool.lock().drain();
    }
}

fn rename_with_retry(from: &Path, to: &Path) -> Result<()> {
    let mut last = None;
    for attempt in 0..IO_RETRIES {
        match std::fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(?from, ?to, attempt, error = %e, "bucket rename failed");
                last = Some(e);
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }
    Err(BucketError::Io(last.unwrap_or_else(|| {
        std::io::Error::other("rename failed with no error recorded")
    })))
}

/// Per-level state as persisted in the archive state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLevelSnapshot {
    pub curr: Hash256,
    pub snap: Hash256,
    pub next: FutureBucketSnapshot,
}

/// Process-wide owner of buckets and the bucket list.
///
/// Created at startup, drained at shutdown, and passed explicitly to
/// whatever needs it; tests instantiate one per scenario.
pub struct BucketManager {
    store: Arc<BucketStore>,
    list: BucketList,
}

impl BucketManager {
    /// Create a manager owning `bucket_dir`, creating it if needed.
    pub fn new(bucket_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_worker_threads(bucket_dir, DEFAULT_WORKER_THREADS)
    }

    pub fn with_worker_threads(
        bucket_dir: impl Into<PathBuf>,
        worker_threads: usize,
    ) -> Result<Self> {
        let store = BucketStore::new(bucket_dir.into(), worker_threads)?;
        Ok(Self {
            store,
            list: BucketList::new(),
        })
    }

    pub fn bucket_dir(&self) -> &Path {
        &self.store.bucket_dir
    }

    pub fn bucket_list(&self) -> &BucketList {
        &self.list
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &BucketStore {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn store_arc(&self) -> &Arc<BucketStore> {
        &self.store
    }

    /// Serialize a batch into a fresh bucket. See [`Bucket::fresh`].
    pub fn fresh_bucket(
        &self,
        protocol: u32,
        init: Vec<LedgerEntry>,
        live: Vec<LedgerEntry>,
        dead: Vec<LedgerKey>,
    ) -> Result<Arc<Bucket>> {
        Bucket::fresh(&self.store, protocol, init, live, dead)
    }

    /// The shared bucket for `hash`, read from disk if necessary.
    pub fn get_bucket_by_hash(&self, hash: Hash256) -> Result<Arc<Bucket>> {
        self.store.get_bucket_by_hash(hash)
    }

    /// Hash an externally produced file, move it into the bucket
    /// directory and intern it.
    pub fn adopt_file(&self, path: &Path) -> Result<Arc<Bucket>> {
        let iter = BucketInputIterator::from_path(path)?;
        let (hash, entry_count) = iter.drain_and_hash()?;
        if entry_count == 0 {
            let _ = std::fs::remove_file(path);
            return Ok(Bucket::empty());
        }
        self.store.adopt_temp_file(path, hash, entry_count)
    }

    /// Apply one closed ledger's `(init, live, dead)` batch to the
    /// bucket list. Must be called with strictly increasing ledger
    /// sequence numbers; the ledger-close adapter enforces the gate.
    pub fn add_batch(
        &mut self,
        ledger_seq: u32,
        protocol: u32,
        init: Vec<LedgerEntry>,
        live: Vec<LedgerEntry>,
        dead: Vec<LedgerKey>,
    ) -> Result<()> {
        self.list
            .add_batch(&self.store, ledger_seq, protocol, init, live, dead)
    }

    /// Block until every running merge has published its output.
    pub fn resolve_all_merges(&mut self) -> Result<()> {
        self.list.resolve_all_merges()
    }

    pub fn read_merge_counters(&self) -> MergeCounters {
        self.store.read_merge_counters()
    }

    /// Add `delta` to the counters. Used after a restart to re-seed the
    /// totals recorded before the in-flight merges were restarted, so
    /// their re-run does not count twice.
    pub fn incr_merge_counters(&self, delta: MergeCounters) {
        self.store.incr_merge_counters(delta);
    }

    /// Drop cache entries (and delete files) for buckets nothing else
    /// references.
    pub fn forget_unreferenced_buckets(&self) {
        let mut referenced: HashSet<Hash256> = HashSet::new();
        for level in self.list.levels() {
            referenced.insert(level.curr().hash());
            referenced.insert(level.snap().hash());
            referenced.extend(level.next().referenced_hashes());
        }

        let mut shared = self.store.shared.lock();
        shared.retain(|hash, bucket| {
            if referenced.contains(hash) || Arc::strong_count(bucket) > 1 {
                return true;
            }
            if let Some(path) = bucket.path() {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(hash = %hash, "deleted unreferenced bucket"),
                    Err(e) => warn!(hash = %hash, error = %e, "failed deleting bucket file"),
                }
            }
            false
        });
    }

    /// Record the current bucket-list hash and skip list into a ledger
    /// header being closed.
    pub fn snapshot_ledger(&self, header: &mut LedgerHeader) {
        header.bucket_list_hash = self.list.hash().into();
        calculate_skip_values(header);
    }

    /// Per-level hashes and merge states, for the archive state.
    pub fn capture_levels(&self) -> Vec<BucketLevelSnapshot> {
        self.list
            .levels()
            .iter()
            .map(|level| BucketLevelSnapshot {
                curr: level.curr().hash(),
                snap: level.snap().hash(),
                next: level.next().snapshot(),
            })
            .collect()
    }

    /// Rebuild the bucket list from persisted archive state, restarting
    /// any merges recorded in input-only form. Every referenced bucket
    /// must already be present on disk.
    pub fn assume_state(
        &mut self,
        levels: &[BucketLevelSnapshot],
        current_ledger: u32,
        max_protocol: u32,
    ) -> Result<()> {
        if levels.len() != BUCKET_LIST_LEVELS {
            return Err(BucketError::Serialization(format!(
                "archive state has {} levels, expected {BUCKET_LIST_LEVELS}",
                levels.len()
            )));
        }
        let mut rebuilt = Vec::with_capacity(BUCKET_LIST_LEVELS);
        for (i, level) in levels.iter().enumerate() {
            let curr = self.store.get_bucket_by_hash(level.curr)?;
            let snap = self.store.get_bucket_by_hash(level.snap)?;
            let keep_tombstones = i + 1 < BUCKET_LIST_LEVELS - 1;
            let next = FutureBucket::restore(
                &self.store,
                &level.next,
                max_protocol,
                keep_tombstones,
            )?;
            rebuilt.push(BucketLevel::from_parts(curr, snap, next, i));
        }
        self.list = BucketList::from_parts(rebuilt, current_ledger);
        info!(ledger = current_ledger, "assumed bucket list state");
        Ok(())
    }

    /// Signal workers to abort, drain the pool, and collapse running
    /// merge handles to Clear. The archive state captured before
    /// shutdown restarts them on the next startup.
    pub fn shutdown(&mut self) {
        self.store.begin_shutdown();
        self.store.drain_pool();
        for i in 0..BUCKET_LIST_LEVELS {
            let next = self.list.level_mut(i).next_mut();
            if next.is_merging() {
                next.clear();
            }
        }
        info!("bucket manager shut down");
    }

    #[cfg(test)]
    pub(crate) fn clear_all_futures(&mut self) {
        for i in 0..BUCKET_LIST_LEVELS {
            self.list.level_mut(i).next_mut().clear();
        }
    }
}

/// Update a header's skip list from its own sequence number, previous
/// skip list (carried forward from the last header) and the just-written
/// bucket-list hash.
///
/// `skip_list[0]` refreshes every `SKIP_1` ledgers; each deeper slot
/// shifts in its shallower neighbour's previous value when its own
/// (larger) period elapses. Early ledgers leave slots at the zero hash.
pub fn calculate_skip_values(header: &mut LedgerHeader) {
    if header.ledger_seq % SKIP_1 != 0 {
        return;
    }
    let seq = i64::from(header.ledger_seq);
    let mut v = seq - i64::from(SKIP_1);
    if v > 0 && v % i64::from(SKIP_2) == 0 {
        v = seq - i64::from(SKIP_2) - i64::from(SKIP_1);
        if v > 0 && v % i64::from(SKIP_3) == 0 {
            v = seq - i64::from(SKIP_3) - i64::from(SKIP_2) - i64::from(SKIP_1);
            if v > 0 && v % i64::from(SKIP_4) == 0 {
                header.skip_list[3] = header.skip_list[2].clone();
            }
            header.skip_list[2] = header.skip_list[1].clone();
        }
        header.skip_list[1] = header.skip_list[0].clone();
    }
    header.skip_list[0] = header.bucket_list_hash.clone();
}
