//! Bucket list storage engine for the hayashi ledger node.
//!
//! Ledger state is stored as a levelled, content-addressed,
//! log-structured collection of *buckets*: immutable sorted files of
//! ledger entry records identified by the SHA-256 of their contents.
//! Once per closed ledger the [`BucketList`] absorbs that ledger's
//! `(init, live, dead)` batch, promoting older data down an
//! eleven-level cascade through background merges, and produces a
//! single deterministic hash covering the entire ledger state.
//!
//! The crate is *not* a read index: there are no point lookups. It is a
//! deterministic state-and-hash accumulator whose output lands in the
//! ledger header, plus the machinery to persist in-flight merges so a
//! restarted node resumes to bit-identical state.
//!
//! # Main types
//!
//! - [`Bucket`]: one immutable sorted file, interned by content hash
//! - [`BucketList`]: the eleven-level curr/snap cascade
//! - [`FutureBucket`]: handle to a background merge
//! - [`BucketManager`]: directory ownership, interning, GC, workers,
//!   merge counters and the ledger-header skip list
//! - [`MergeCounters`]: per-decision merge statistics
//!
//! # Concurrency model
//!
//! A single-threaded main loop sequences ledger closes and is the only
//! mutator of the bucket list. Workers are pure producers: they read
//! immutable input files, write one output file, and publish its hash
//! through a [`FutureBucket`]. The only blocking point on the main loop
//! is [`FutureBucket::resolve`], reached from `add_batch` when a level
//! boundary needs its pending merge.

mod bucket;
mod bucket_list;
mod counters;
mod entry;
mod error;
mod future_bucket;
mod iterator;
mod manager;
mod merge;
mod worker;

pub use bucket::Bucket;
pub use bucket_list::{
    level_half, level_should_prepare, level_should_snap, level_size, BucketLevel, BucketList,
    BUCKET_LIST_LEVELS,
};
pub use counters::MergeCounters;
pub use entry::{compare_entries, compare_keys, ledger_entry_key, BucketEntry};
pub use error::BucketError;
pub use future_bucket::{FutureBucket, FutureBucketSnapshot, FutureBucketState, MergeRecipe};
pub use iterator::{BucketInputIterator, BucketOutputIterator};
pub use manager::{
    calculate_skip_values, BucketLevelSnapshot, BucketManager, DEFAULT_WORKER_THREADS, SKIP_1,
    SKIP_2, SKIP_3, SKIP_4,
};

/// First protocol version at which INIT and META records exist.
///
/// Below this version buckets carry no META record, batches store
/// creations as LIVE records, and merges reject INIT/META on input.
pub const FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY: u32 = 11;

/// Result alias for bucket operations.
pub type Result<T> = std::result::Result<T, BucketError>;
