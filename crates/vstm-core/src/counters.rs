//! Global/local conflict counters: O(1) amortized "did anything change".
//!
//! Every commit that could invalidate an untracked reader bumps the
//! process-wide [`GlobalConflictCounter`]. Each transaction caches a
//! snapshot in a [`LocalConflictCounter`] at its first read; before
//! trusting a weak read it re-checks the snapshot. A mismatch is a
//! conservative "maybe conflicted" signal that forces a full read-set
//! scan or an abort — false positives cost a spurious retry, false
//! negatives are never allowed.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache_aligned::CacheAligned;

use vstm_types::RefId;

/// Number of counter stripes. Power of two for cheap modular indexing.
const STRIPES: usize = 8;

// ---------------------------------------------------------------------------
// GlobalConflictCounter
// ---------------------------------------------------------------------------

/// Process-wide monotonic conflict counter, striped to keep committing
/// writers from serializing on one cache line.
///
/// `signal_conflict` bumps the stripe selected by the signalling
/// reference's id; `count` sums all stripes. The sum is monotonic, which
/// is the only property the detection protocol needs.
#[derive(Debug)]
pub struct GlobalConflictCounter {
    stripes: [CacheAligned<AtomicU64>; STRIPES],
}

impl GlobalConflictCounter {
    /// Create a counter with all stripes at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stripes: std::array::from_fn(|_| CacheAligned::new(AtomicU64::new(0))),
        }
    }

    /// Record that a commit to `ref_id` may have invalidated untracked
    /// readers.
    pub fn signal_conflict(&self, ref_id: RefId) {
        let stripe = (ref_id.get() as usize) & (STRIPES - 1);
        self.stripes[stripe].fetch_add(1, Ordering::AcqRel);
    }

    /// Current sum over all stripes.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.stripes
            .iter()
            .map(|stripe| stripe.load(Ordering::Acquire))
            .sum()
    }
}

impl Default for GlobalConflictCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide counter shared by every transaction that does not
/// bring its own (tests isolate detection behavior by injecting one).
pub fn process_wide() -> &'static GlobalConflictCounter {
    static PROCESS_WIDE: std::sync::OnceLock<GlobalConflictCounter> = std::sync::OnceLock::new();
    PROCESS_WIDE.get_or_init(GlobalConflictCounter::new)
}

// ---------------------------------------------------------------------------
// LocalConflictCounter
// ---------------------------------------------------------------------------

/// A transaction's cached snapshot of the global counter.
///
/// Owned by exactly one transaction; not shared between threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConflictCounter {
    snapshot: u64,
}

impl LocalConflictCounter {
    /// Snapshot taken before any read.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-baseline on the current global count. Called at the latest
    /// possible moment: just before the transaction's first read, so no
    /// commit between baseline and read goes unnoticed.
    pub fn reset(&mut self, global: &GlobalConflictCounter) {
        self.snapshot = global.count();
    }

    /// Sync with the global counter, reporting whether it moved since the
    /// last reset/sync. `true` means a full read-set check is required.
    pub fn sync_and_check_conflict(&mut self, global: &GlobalConflictCounter) -> bool {
        let current = global.count();
        if current == self.snapshot {
            return false;
        }
        self.snapshot = current;
        true
    }

    /// The cached snapshot value.
    #[must_use]
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use vstm_types::RefId;

    use super::{GlobalConflictCounter, LocalConflictCounter};

    #[test]
    fn signal_increments_sum() {
        let global = GlobalConflictCounter::new();
        assert_eq!(global.count(), 0);

        let a = RefId::next();
        let b = RefId::next();
        global.signal_conflict(a);
        global.signal_conflict(b);
        global.signal_conflict(a);
        assert_eq!(global.count(), 3);
    }

    #[test]
    fn local_detects_conflict_once_then_resyncs() {
        let global = GlobalConflictCounter::new();
        let mut local = LocalConflictCounter::new();
        local.reset(&global);

        assert!(!local.sync_and_check_conflict(&global));

        global.signal_conflict(RefId::next());
        assert!(local.sync_and_check_conflict(&global));
        // synced: quiet again until the next signal
        assert!(!local.sync_and_check_conflict(&global));
    }

    #[test]
    fn reset_absorbs_earlier_signals() {
        let global = GlobalConflictCounter::new();
        global.signal_conflict(RefId::next());

        let mut local = LocalConflictCounter::new();
        local.reset(&global);
        assert!(!local.sync_and_check_conflict(&global));
    }
}
