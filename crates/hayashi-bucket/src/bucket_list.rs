//! The eleven-level bucket list.
//!
//! Ledger state lives in a cascade of levels, each holding a `curr` and
//! a `snap` bucket plus a `next` handle to the merge feeding the level
//! below. Shallow levels turn over quickly and hold recent writes; deep
//! levels turn over rarely and hold old state.
//!
//! # Geometry
//!
//! `half(i)` is level *i*'s cycle length in ledgers: `half(0) = 1` and
//! each level's cycle is four times the previous one.
//!
//! | Level | half(i)   | snaps at          | prepares at             |
//! |-------|-----------|-------------------|-------------------------|
//! | 0     | 1         | every ledger      | every ledger            |
//! | 1     | 4         | N % 4 == 0        | N % 4 == 2              |
//! | 2     | 16        | N % 16 == 0       | N % 16 == 8             |
//! | ...   | 4^i       | N % 4^i == 0      | N % 4^i == 4^i/2        |
//! | 10    | n/a       | never (top level) | never                   |
//!
//! At a level's *snap* boundary its pending merge (started at the
//! previous prepare boundary) resolves into the next level's `curr`,
//! and `curr` rotates into `snap`. At its *prepare* boundary a merge of
//! `snap_i` into `curr_{i+1}` is started in the background, shadowed by
//! every bucket above the output that will later spill through it.
//!
//! Each `add_batch` call processes levels deepest-first so that a
//! level's rotation reads its `curr` as of the previous ledger, then
//! installs the fresh batch bucket as `curr_0`, then starts the due
//! merges.
//!
//! # Hash
//!
//! The list hash is the SHA-256 of the 22 concatenated curr/snap hashes
//! from level 0 to level 10, empty slots contributing the zero hash.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{LedgerEntry, LedgerKey, Limits, WriteXdr};

use hayashi_common::Hash256;

use crate::bucket::Bucket;
use crate::entry::BucketEntry;
use crate::future_bucket::FutureBucket;
use crate::manager::BucketStore;
use crate::{BucketError, Result};

/// Number of levels in the bucket list.
pub const BUCKET_LIST_LEVELS: usize = 11;

const TOP_LEVEL: usize = BUCKET_LIST_LEVELS - 1;

/// Level *i*'s cycle length in ledgers: `4^i`.
pub fn level_half(level: usize) -> u32 {
    1u32 << (2 * level as u32)
}

/// Level *i*'s retained window, affecting disk usage only.
pub fn level_size(level: usize) -> u32 {
    level_half(level) * 4
}

/// True when level `level` rotates curr into snap at `ledger`.
pub fn level_should_snap(ledger: u32, level: usize) -> bool {
    level < TOP_LEVEL && ledger % level_half(level) == 0
}

/// True when level `level` starts its outgoing merge at `ledger`.
pub fn level_should_prepare(ledger: u32, level: usize) -> bool {
    let half = level_half(level);
    level < TOP_LEVEL && ledger % half == half / 2
}

/// One level of the cascade: two bucket slots and the merge feeding the
/// level below.
pub struct BucketLevel {
    curr: Arc<Bucket>,
    snap: Arc<Bucket>,
    next: FutureBucket,
    level: usize,
}

impl BucketLevel {
    fn new(level: usize) -> Self {
        Self {
            curr: Bucket::empty(),
            snap: Bucket::empty(),
            next: FutureBucket::default(),
            level,
        }
    }

    pub(crate) fn from_parts(
        curr: Arc<Bucket>,
        snap: Arc<Bucket>,
        next: FutureBucket,
        level: usize,
    ) -> Self {
        Self {
            curr,
            snap,
            next,
            level,
        }
    }

    pub fn curr(&self) -> &Arc<Bucket> {
        &self.curr
    }

    pub fn snap(&self) -> &Arc<Bucket> {
        &self.snap
    }

    pub fn next(&self) -> &FutureBucket {
        &self.next
    }

    pub(crate) fn next_mut(&mut self) -> &mut FutureBucket {
        &mut self.next
    }

    pub fn level_number(&self) -> usize {
        self.level
    }
}

/// The full cascade.
pub struct BucketList {
    levels: Vec<BucketLevel>,
    ledger_seq: u32,
}

impl Default for BucketList {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketList {
    pub fn new() -> Self {
        Self {
            levels: (0..BUCKET_LIST_LEVELS).map(BucketLevel::new).collect(),
            ledger_seq: 0,
        }
    }

    pub(crate) fn from_parts(levels: Vec<BucketLevel>, ledger_seq: u32) -> Self {
        debug_assert_eq!(levels.len(), BUCKET_LIST_LEVELS);
        Self { levels, ledger_seq }
    }

    /// The ledger most recently applied.
    pub fn ledger_seq(&self) -> u32 {
        self.ledger_seq
    }

    pub fn level(&self, level: usize) -> &BucketLevel {
        &self.levels[level]
    }

    pub fn levels(&self) -> &[BucketLevel] {
        &self.levels
    }

    pub(crate) fn level_mut(&mut self, level: usize) -> &mut BucketLevel {
        &mut self.levels[level]
    }

    /// SHA-256 over the concatenated curr/snap hashes of every level.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        for level in &self.levels {
            hasher.update(level.curr.hash().as_bytes());
            hasher.update(level.snap.hash().as_bytes());
        }
        Hash256::from_bytes(hasher.finalize().into())
    }

    /// Apply one closed ledger's batch.
    pub(crate) fn add_batch(
        &mut self,
        store: &Arc<BucketStore>,
        ledger_seq: u32,
        protocol: u32,
        init: Vec<LedgerEntry>,
        live: Vec<LedgerEntry>,
        dead: Vec<LedgerKey>,
    ) -> Result<()> {
        debug_assert!(ledger_seq > 0);
        let incoming = Bucket::fresh(store, protocol, init, live, dead)?;

        // Snap pass, deepest level first: a level's rotation must read
        // its curr before the level above resolves new output into it.
        for i in (0..TOP_LEVEL).rev() {
            if level_should_snap(ledger_seq, i) {
                if !self.levels[i].next.is_clear() {
                    let output = self.levels[i].next.resolve()?;
                    self.levels[i].next.clear();
                    self.levels[i + 1].curr = output;
                }
                let level = &mut self.levels[i];
                level.snap = std::mem::replace(&mut level.curr, Bucket::empty());
            }
        }

        self.levels[0].curr = incoming;

        // Prepare pass: start the merges that this ledger is due for,
        // shadowed by everything above the output.
        for i in (0..TOP_LEVEL).rev() {
            if level_should_prepare(ledger_seq, i) {
                let old = Arc::clone(&self.levels[i + 1].curr);
                let new = Arc::clone(&self.levels[i].snap);
                let shadows = self.shadows_above(i);
                let keep_tombstones = i + 1 < TOP_LEVEL;
                self.levels[i]
                    .next
                    .start(store, old, new, shadows, protocol, keep_tombstones)?;
            }
        }

        self.ledger_seq = ledger_seq;
        Ok(())
    }

    /// Shadow set for level `i`'s outgoing merge: the curr/snap slots of
    /// every level at or above `i` except the merge's own input
    /// (`snap_i`), deepest first. Each of these holds data younger than
    /// both merge inputs and will itself spill through `curr_{i+1}`
    /// later, so a matching key above makes the copy in the merge
    /// redundant.
    fn shadows_above(&self, i: usize) -> Vec<Arc<Bucket>> {
        let mut shadows = vec![Arc::clone(&self.levels[i].curr)];
        for k in (0..i).rev() {
            shadows.push(Arc::clone(&self.levels[k].snap));
            shadows.push(Arc::clone(&self.levels[k].curr));
        }
        shadows
    }

    /// Block until every running merge has finished. Outputs stay in
    /// their `next` handles; application into curr slots still happens
    /// at the owning level's snap boundary.
    pub fn resolve_all_merges(&mut self) -> Result<()> {
        for level in &mut self.levels {
            if level.next.is_merging() {
                level.next.resolve()?;
            }
        }
        Ok(())
    }

    /// Decode the authoritative live-entry set: scan levels 0→10, curr
    /// before snap, first record per key wins, tombstones drop the key.
    /// This is a survey operation, not a read index.
    pub fn live_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut entries = Vec::new();
        for level in &self.levels {
            for bucket in [&level.curr, &level.snap] {
                let mut iter = bucket.open_input_iterator()?;
                while let Some(entry) = iter.next_entry()? {
                    let Some(key) = entry.key() else { continue };
                    let key_bytes = key.to_xdr(Limits::none()).map_err(|e| {
                        BucketError::Serialization(format!("key encode failed: {e}"))
                    })?;
                    if !seen.insert(key_bytes) {
                        continue;
                    }
                    match entry {
                        BucketEntry::Live(e) | BucketEntry::Init(e) => entries.push(e),
                        BucketEntry::Dead(_) => {}
                        BucketEntry::Metadata(_) => {}
                    }
                }
            }
        }
        Ok(entries)
    }
}
