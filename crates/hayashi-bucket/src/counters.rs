//! Fine-grained merge-operation counters.
//!
//! Every decision the merge engine makes increments one of these
//! counters. They are deliberately plain `u64`s rather than individual
//! atomics: reads and increments happen in bulk under the manager's
//! mutex, and a merge accumulates into a private instance that is folded
//! in only when the merge completes. That makes the counters additive
//! across restarts: after resuming from archive state, re-adding the
//! pre-shutdown snapshot reproduces the totals of an uninterrupted run.

/// Counters covering a set of completed merges.
///
/// All counters are monotonically non-decreasing over the lifetime of a
/// process. `output_iterator_buffer_updates` is always at least
/// `output_iterator_actual_writes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounters {
    /// Merges whose effective protocol predates INIT/META.
    pub pre_init_entry_protocol_merges: u64,
    /// Merges whose effective protocol supports INIT/META.
    pub post_init_entry_protocol_merges: u64,

    pub new_meta_entries: u64,
    pub new_init_entries: u64,
    pub new_live_entries: u64,
    pub new_dead_entries: u64,
    pub old_meta_entries: u64,
    pub old_init_entries: u64,
    pub old_live_entries: u64,
    pub old_dead_entries: u64,

    /// Old-side entries emitted with no competing new-side record.
    pub old_entries_default_accepted: u64,
    /// New-side entries emitted with no competing old-side record.
    pub new_entries_default_accepted: u64,
    pub new_init_entries_merged_with_old_dead: u64,
    pub old_init_entries_merged_with_new_live: u64,
    pub old_init_entries_merged_with_new_dead: u64,
    pub new_entries_merged_with_old_neither_init: u64,

    pub shadow_scan_steps: u64,
    pub meta_entry_shadow_elisions: u64,
    pub live_entry_shadow_elisions: u64,
    pub init_entry_shadow_elisions: u64,
    pub dead_entry_shadow_elisions: u64,

    pub output_iterator_tombstone_elisions: u64,
    pub output_iterator_buffer_updates: u64,
    pub output_iterator_actual_writes: u64,
}

impl std::ops::AddAssign for MergeCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.pre_init_entry_protocol_merges += rhs.pre_init_entry_protocol_merges;
        self.post_init_entry_protocol_merges += rhs.post_init_entry_protocol_merges;

        self.new_meta_entries += rhs.new_meta_entries;
        self.new_init_entries += rhs.new_init_entries;
        self.new_live_entries += rhs.new_live_entries;
        self.new_dead_entries += rhs.new_dead_entries;
        self.old_meta_entries += rhs.old_meta_entries;
        self.old_init_entries += rhs.old_init_entries;
        self.old_live_entries += rhs.old_live_entries;
        self.old_dead_entries += rhs.old_dead_entries;

        self.old_entries_default_accepted += rhs.old_entries_default_accepted;
        self.new_entries_default_accepted += rhs.new_entries_default_accepted;
        self.new_init_entries_merged_with_old_dead += rhs.new_init_entries_merged_with_old_dead;
        self.old_init_entries_merged_with_new_live += rhs.old_init_entries_merged_with_new_live;
        self.old_init_entries_merged_with_new_dead += rhs.old_init_entries_merged_with_new_dead;
        self.new_entries_merged_with_old_neither_init +=
            rhs.new_entries_merged_with_old_neither_init;

        self.shadow_scan_steps += rhs.shadow_scan_steps;
        self.meta_entry_shadow_elisions += rhs.meta_entry_shadow_elisions;
        self.live_entry_shadow_elisions += rhs.live_entry_shadow_elisions;
        self.init_entry_shadow_elisions += rhs.init_entry_shadow_elisions;
        self.dead_entry_shadow_elisions += rhs.dead_entry_shadow_elisions;

        self.output_iterator_tombstone_elisions += rhs.output_iterator_tombstone_elisions;
        self.output_iterator_buffer_updates += rhs.output_iterator_buffer_updates;
        self.output_iterator_actual_writes += rhs.output_iterator_actual_writes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_assign_accumulates() {
        let mut total = MergeCounters::default();
        let delta = MergeCounters {
            post_init_entry_protocol_merges: 2,
            new_live_entries: 5,
            old_dead_entries: 3,
            shadow_scan_steps: 11,
            output_iterator_buffer_updates: 9,
            output_iterator_actual_writes: 7,
            ..Default::default()
        };
        total += delta;
        total += delta;
        assert_eq!(total.post_init_entry_protocol_merges, 4);
        assert_eq!(total.new_live_entries, 10);
        assert_eq!(total.old_dead_entries, 6);
        assert_eq!(total.shadow_scan_steps, 22);
        assert!(total.output_iterator_buffer_updates >= total.output_iterator_actual_writes);
    }
}
