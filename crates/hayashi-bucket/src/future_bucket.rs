//! FutureBucket: a handle to an in-progress or completed merge.
//!
//! ```text
//!   Clear ──start──▶ Running ──resolve──▶ Resolved
//!     ▲                 │ clear / abort
//!     └─────────────────┘
//! ```
//!
//! A `Running` handle owns the merge's input buckets (keeping their
//! files alive) and the receiving end of a one-shot channel the worker
//! publishes into. [`FutureBucket::resolve`] is the only place the
//! ledger-close path blocks on background work.
//!
//! Handles serialize in two forms: an *input recipe* (the three input
//! hash sets) while running, or the *output hash* once resolved. A
//! deserialized recipe restarts the merge from scratch; because merging
//! is deterministic, the restarted merge produces the identical output.

use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use hayashi_common::Hash256;

use crate::bucket::Bucket;
use crate::counters::MergeCounters;
use crate::manager::BucketStore;
use crate::merge::merge_buckets;
use crate::{BucketError, Result};

/// Observable state of a [`FutureBucket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureBucketState {
    Clear,
    Running,
    Resolved,
}

/// The input hashes describing a merge, as persisted in archive state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecipe {
    pub old: Hash256,
    pub new: Hash256,
    pub shadows: Vec<Hash256>,
}

/// Persisted form of a [`FutureBucket`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum FutureBucketSnapshot {
    /// No merge described.
    Clear,
    /// A merge that must be restarted from its inputs.
    Input {
        old: Hash256,
        new: Hash256,
        shadows: Vec<Hash256>,
    },
    /// A finished merge; the output bucket is on disk.
    Output { hash: Hash256 },
}

enum State {
    Clear,
    Running {
        recipe: MergeRecipe,
        // Holds the inputs alive while the worker reads their files.
        inputs: Vec<Arc<Bucket>>,
        rx: Receiver<Result<Arc<Bucket>>>,
    },
    Resolved(Arc<Bucket>),
}

/// Handle to a merge that may be pending, running or finished.
pub struct FutureBucket {
    state: State,
}

impl Default for FutureBucket {
    fn default() -> Self {
        Self {
            state: State::Clear,
        }
    }
}

impl FutureBucket {
    pub fn state(&self) -> FutureBucketState {
        match self.state {
            State::Clear => FutureBucketState::Clear,
            State::Running { .. } => FutureBucketState::Running,
            State::Resolved(_) => FutureBucketState::Resolved,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self.state, State::Clear)
    }

    pub fn is_merging(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, State::Resolved(_))
    }

    /// Forget any merge this handle describes.
    pub fn clear(&mut self) {
        self.state = State::Clear;
    }

    /// The output hash, once resolved.
    pub fn output_hash(&self) -> Option<Hash256> {
        match &self.state {
            State::Resolved(bucket) => Some(bucket.hash()),
            _ => None,
        }
    }

    /// Every bucket hash this handle keeps reachable (inputs while
    /// running, the output once resolved).
    pub fn referenced_hashes(&self) -> Vec<Hash256> {
        match &self.state {
            State::Clear => Vec::new(),
            State::Running { recipe, .. } => {
                let mut hashes = vec![recipe.old, recipe.new];
                hashes.extend(recipe.shadows.iter().copied());
                hashes
            }
            State::Resolved(bucket) => vec![bucket.hash()],
        }
    }

    /// Schedule `merge(old, new, shadows)` on the store's worker pool.
    /// Empty shadows are dropped from the recipe before it is recorded,
    /// so a restarted merge sees the same effective shadow set.
    pub(crate) fn start(
        &mut self,
        store: &Arc<BucketStore>,
        old: Arc<Bucket>,
        new: Arc<Bucket>,
        shadows: Vec<Arc<Bucket>>,
        max_protocol: u32,
        keep_tombstones: bool,
    ) -> Result<()> {
        if !self.is_clear() {
            return Err(BucketError::FutureState(format!(
                "start in state {:?}",
                self.state()
            )));
        }

        let shadows: Vec<Arc<Bucket>> =
            shadows.into_iter().filter(|s| !s.is_empty()).collect();
        let recipe = MergeRecipe {
            old: old.hash(),
            new: new.hash(),
            shadows: shadows.iter().map(|s| s.hash()).collect(),
        };

        let (tx, rx) = channel();
        let job_store = Arc::clone(store);
        let job_old = Arc::clone(&old);
        let job_new = Arc::clone(&new);
        let job_shadows = shadows.clone();
        store.execute(move || {
            let mut mc = MergeCounters::default();
            let result = merge_buckets(
                &job_store,
                &job_old,
                &job_new,
                &job_shadows,
                max_protocol,
                keep_tombstones,
                &mut mc,
            );
            if result.is_ok() {
                job_store.incr_merge_counters(mc);
            }
            let _ = tx.send(result);
        });

        let mut inputs = vec![old, new];
        inputs.extend(shadows);
        self.state = State::Running { recipe, inputs, rx };
        Ok(())
    }

    /// Block until the merge finishes and return its output.
    ///
    /// A worker that died or was drained before publishing surfaces as
    /// [`BucketError::MergeAborted`]; any merge error collapses the
    /// handle back to `Clear` so the archive state can restart it.
    pub fn resolve(&mut self) -> Result<Arc<Bucket>> {
        if let State::Resolved(bucket) = &self.state {
            return Ok(Arc::clone(bucket));
        }
        // Take the running state out; on any failure the handle stays
        // Clear and the archive state's recipe restarts the merge.
        let State::Running { rx, .. } = std::mem::replace(&mut self.state, State::Clear) else {
            return Err(BucketError::FutureState("resolve on clear handle".into()));
        };
        match rx.recv() {
            Ok(Ok(bucket)) => {
                self.state = State::Resolved(Arc::clone(&bucket));
                Ok(bucket)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BucketError::MergeAborted),
        }
    }

    /// The persisted form of this handle.
    pub fn snapshot(&self) -> FutureBucketSnapshot {
        match &self.state {
            State::Clear => FutureBucketSnapshot::Clear,
            State::Running { recipe, .. } => FutureBucketSnapshot::Input {
                old: recipe.old,
                new: recipe.new,
                shadows: recipe.shadows.clone(),
            },
            State::Resolved(bucket) => FutureBucketSnapshot::Output {
                hash: bucket.hash(),
            },
        }
    }

    /// Rebuild a handle from its persisted form. An input recipe loads
    /// its buckets and restarts the merge immediately; an output form
    /// reattaches the finished bucket from disk.
    pub(crate) fn restore(
        store: &Arc<BucketStore>,
        snapshot: &FutureBucketSnapshot,
        max_protocol: u32,
        keep_tombstones: bool,
    ) -> Result<Self> {
        match snapshot {
            FutureBucketSnapshot::Clear => Ok(Self::default()),
            FutureBucketSnapshot::Output { hash } => {
                let bucket = store.get_bucket_by_hash(*hash)?;
                Ok(Self {
                    state: State::Resolved(bucket),
                })
            }
            FutureBucketSnapshot::Input { old, new, shadows } => {
                let old = store.get_bucket_by_hash(*old)?;
                let new = store.get_bucket_by_hash(*new)?;
                let shadows = shadows
                    .iter()
                    .map(|h| store.get_bucket_by_hash(*h))
                    .collect::<Result<Vec<_>>>()?;
                debug!(old = %old.hash(), new = %new.hash(), "restarting merge from recipe");
                let mut fb = Self::default();
                fb.start(store, old, new, shadows, max_protocol, keep_tombstones)?;
                Ok(fb)
            }
        }
    }
}

impl std::fmt::Debug for FutureBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("FutureBucket");
        s.field("state", &self.state());
        if let State::Running { recipe, .. } = &self.state {
            s.field("old", &recipe.old.to_hex())
                .field("new", &recipe.new.to_hex());
        }
        if let State::Resolved(bucket) = &self.state {
            s.field("output", &bucket.hash().to_hex());
        }
        s.finish()
    }
}
