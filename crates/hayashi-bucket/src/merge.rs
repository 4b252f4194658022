//! The bucket merge engine.
//!
//! Merging folds a *new* bucket into an *old* bucket under a set of
//! *shadow* buckets, producing a new bucket. The two inputs are walked
//! in lockstep by key; on a key collision the new record supersedes the
//! old one, with init/live/dead reconciliation:
//!
//! | old    | new    | result                                  |
//! |--------|--------|-----------------------------------------|
//! | DEAD   | INIT   | LIVE with the new payload (recreation)  |
//! | INIT   | LIVE   | INIT with the new payload               |
//! | INIT   | DEAD   | nothing (created and deleted in-window) |
//! | other  | other  | the new record                          |
//!
//! A record may additionally be elided when any shadow bucket contains
//! its key: a younger copy exists above this level and will spill down
//! through the output later, so the copy in hand is redundant. From the
//! INIT/META protocol gate onward only LIVE records are elided this way;
//! before the gate, tombstones are elided too.
//!
//! The merge is a pure function of (old, new, shadows, protocol): no
//! clocks, no randomness, no tie-breaks. Restarting an interrupted merge
//! from its recorded inputs reproduces the output bit for bit, which is
//! what the restart protocol relies on.
//!
//! The effective protocol of a merge is the maximum of the input
//! buckets' META versions (0 when absent), never the caller's current
//! protocol: merges of pre-gate buckets stay pre-gate merges even after
//! a ledger protocol upgrade, so upgrade effects roll through the list
//! gradually as fresh buckets spill down.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::bucket::Bucket;
use crate::counters::MergeCounters;
use crate::entry::{compare_entries, compare_keys, BucketEntry};
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::BucketStore;
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

/// How often the merge loop checks the shutdown flag.
const ABORT_CHECK_INTERVAL: usize = 1024;

/// Merge `new` into `old` under `shadows`, writing a new bucket into the
/// store. `keep_tombstones` is false only when the output lands in the
/// deepest level, where nothing remains for a tombstone to shadow.
pub(crate) fn merge_buckets(
    store: &BucketStore,
    old: &Bucket,
    new: &Bucket,
    shadows: &[Arc<Bucket>],
    max_protocol: u32,
    keep_tombstones: bool,
    mc: &mut MergeCounters,
) -> Result<Arc<Bucket>> {
    let tmp = store.temp_path();
    match run_merge(
        store,
        old,
        new,
        shadows,
        max_protocol,
        keep_tombstones,
        &tmp,
        mc,
    ) {
        Ok(bucket) => Ok(bucket),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_merge(
    store: &BucketStore,
    old: &Bucket,
    new: &Bucket,
    shadows: &[Arc<Bucket>],
    max_protocol: u32,
    keep_tombstones: bool,
    tmp: &std::path::Path,
    mc: &mut MergeCounters,
) -> Result<Arc<Bucket>> {
    let mut oi = old.open_input_iterator()?;
    let mut ni = new.open_input_iterator()?;

    let merge_protocol = oi.protocol_version().max(ni.protocol_version());
    if merge_protocol > max_protocol {
        return Err(BucketError::ProtocolViolation(format!(
            "bucket protocol {merge_protocol} exceeds ledger protocol {max_protocol}"
        )));
    }
    let init_gate = merge_protocol >= FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY;
    if init_gate {
        mc.post_init_entry_protocol_merges += 1;
    } else {
        mc.pre_init_entry_protocol_merges += 1;
    }

    let mut shadow_iters = Vec::with_capacity(shadows.len());
    for shadow in shadows {
        if !shadow.is_empty() {
            shadow_iters.push(shadow.open_input_iterator()?);
        }
    }

    trace!(
        old = %old.hash(),
        new = %new.hash(),
        shadows = shadow_iters.len(),
        protocol = merge_protocol,
        "merge starting"
    );

    enum Take {
        Old,
        New,
        Both,
        Done,
    }

    let mut out = BucketOutputIterator::new(tmp, merge_protocol, keep_tombstones)?;
    let mut steps = 0usize;

    loop {
        if steps % ABORT_CHECK_INTERVAL == 0 && store.is_shutting_down() {
            return Err(BucketError::MergeAborted);
        }
        steps += 1;

        let take = match (oi.peek(), ni.peek()) {
            (None, None) => Take::Done,
            (Some(_), None) => Take::Old,
            (None, Some(_)) => Take::New,
            (Some(o), Some(n)) => match compare_entries(o, n) {
                Ordering::Less => Take::Old,
                Ordering::Greater => Take::New,
                Ordering::Equal => Take::Both,
            },
        };

        match take {
            Take::Done => break,
            Take::Old => {
                if let Some(entry) = oi.next_entry()? {
                    check_kind(init_gate, &entry)?;
                    count_old(mc, &entry);
                    mc.old_entries_default_accepted += 1;
                    maybe_put(&mut out, entry, &mut shadow_iters, init_gate, mc)?;
                }
            }
            Take::New => {
                if let Some(entry) = ni.next_entry()? {
                    check_kind(init_gate, &entry)?;
                    count_new(mc, &entry);
                    mc.new_entries_default_accepted += 1;
                    maybe_put(&mut out, entry, &mut shadow_iters, init_gate, mc)?;
                }
            }
            Take::Both => {
                let (Some(old_entry), Some(new_entry)) = (oi.next_entry()?, ni.next_entry()?)
                else {
                    return Err(BucketError::BucketCorrupt(
                        "merge inputs advanced past peeked entries".into(),
                    ));
                };
                check_kind(init_gate, &old_entry)?;
                check_kind(init_gate, &new_entry)?;
                count_old(mc, &old_entry);
                count_new(mc, &new_entry);
                merge_equal_keys(
                    &mut out,
                    old_entry,
                    new_entry,
                    &mut shadow_iters,
                    init_gate,
                    mc,
                )?;
            }
        }
    }

    let (tmp, hash, count) = out.finish(mc)?;
    if count == 0 {
        let _ = std::fs::remove_file(&tmp);
        debug!(old = %old.hash(), new = %new.hash(), "merge produced empty bucket");
        return Ok(Bucket::empty());
    }
    let bucket = store.adopt_temp_file(&tmp, hash, count)?;
    debug!(
        old = %old.hash(),
        new = %new.hash(),
        output = %hash,
        records = count,
        "merge complete"
    );
    Ok(bucket)
}

/// Reconcile two records for the same key.
fn merge_equal_keys(
    out: &mut BucketOutputIterator,
    old_entry: BucketEntry,
    new_entry: BucketEntry,
    shadow_iters: &mut [BucketInputIterator],
    init_gate: bool,
    mc: &mut MergeCounters,
) -> Result<()> {
    if init_gate {
        match (&old_entry, &new_entry) {
            (BucketEntry::Dead(_), BucketEntry::Init(payload)) => {
                // The INIT annihilates the tombstone; the surviving
                // record cannot itself claim to be a creation, because a
                // deeper level may still hold the original one.
                mc.new_init_entries_merged_with_old_dead += 1;
                return maybe_put(
                    out,
                    BucketEntry::Live(payload.clone()),
                    shadow_iters,
                    init_gate,
                    mc,
                );
            }
            (BucketEntry::Init(_), BucketEntry::Live(payload)) => {
                // Init-ness survives updates within the window.
                mc.old_init_entries_merged_with_new_live += 1;
                return maybe_put(
                    out,
                    BucketEntry::Init(payload.clone()),
                    shadow_iters,
                    init_gate,
                    mc,
                );
            }
            (BucketEntry::Init(_), BucketEntry::Dead(_)) => {
                // Created and deleted within the window: a no-op.
                mc.old_init_entries_merged_with_new_dead += 1;
                return Ok(());
            }
            _ => {}
        }
    }
    mc.new_entries_merged_with_old_neither_init += 1;
    maybe_put(out, new_entry, shadow_iters, init_gate, mc)
}

/// Emit an entry unless a shadow elides it.
///
/// From the INIT/META gate onward, INIT and DEAD records are written
/// unconditionally (their reconciliation semantics depend on reaching
/// deeper levels); only LIVE records are checked against the shadows.
/// Before the gate, LIVE and DEAD records are both subject to elision.
fn maybe_put(
    out: &mut BucketOutputIterator,
    entry: BucketEntry,
    shadow_iters: &mut [BucketInputIterator],
    keep_shadowed_lifecycle_entries: bool,
    mc: &mut MergeCounters,
) -> Result<()> {
    if !shadow_iters.is_empty() && !(keep_shadowed_lifecycle_entries && !entry.is_live()) {
        if let Some(key) = entry.key() {
            for si in shadow_iters.iter_mut() {
                while let Some(shadow_entry) = si.peek() {
                    let Some(shadow_key) = shadow_entry.key() else {
                        si.advance()?;
                        continue;
                    };
                    match compare_keys(&shadow_key, &key) {
                        Ordering::Less => {
                            mc.shadow_scan_steps += 1;
                            si.advance()?;
                        }
                        Ordering::Equal => {
                            match &entry {
                                BucketEntry::Live(_) => mc.live_entry_shadow_elisions += 1,
                                BucketEntry::Dead(_) => mc.dead_entry_shadow_elisions += 1,
                                BucketEntry::Init(_) => mc.init_entry_shadow_elisions += 1,
                                BucketEntry::Metadata(_) => mc.meta_entry_shadow_elisions += 1,
                            }
                            return Ok(());
                        }
                        Ordering::Greater => break,
                    }
                }
            }
        }
    }
    out.put(entry, mc)
}

fn check_kind(init_gate: bool, entry: &BucketEntry) -> Result<()> {
    if !init_gate && (entry.is_init() || entry.is_metadata()) {
        return Err(BucketError::ProtocolViolation(format!(
            "{:?} record in a pre-INIT/META merge",
            entry.entry_type()
        )));
    }
    Ok(())
}

fn count_old(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Metadata(_) => mc.old_meta_entries += 1,
        BucketEntry::Init(_) => mc.old_init_entries += 1,
        BucketEntry::Live(_) => mc.old_live_entries += 1,
        BucketEntry::Dead(_) => mc.old_dead_entries += 1,
    }
}

fn count_new(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Metadata(_) => mc.new_meta_entries += 1,
        BucketEntry::Init(_) => mc.new_init_entries += 1,
        BucketEntry::Live(_) => mc.new_live_entries += 1,
        BucketEntry::Dead(_) => mc.new_dead_entries += 1,
    }
}
