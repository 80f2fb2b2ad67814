//! Transaction configuration.
//!
//! A plain knob struct: the engine consumes these fields directly and the
//! driving loop owns mutation between attempts (most importantly the
//! capacity tier, upgraded on a speculative-configuration failure).

use std::time::Duration;

use vstm_types::{CapacityTier, LockMode, DEFAULT_MAX_RETRIES, DEFAULT_SPIN_COUNT};

/// Configuration consumed by [`crate::Transaction`].
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct TxnConfig {
    /// Spin budget for orec arrive/lock attempts before a conflict is
    /// reported.
    pub spin_count: u32,
    /// Readonly transactions reject `open_for_write`/`commute`.
    pub readonly: bool,
    /// Whether `retry` (blocking) is permitted.
    pub blocking_allowed: bool,
    /// Compare staged values against the observed snapshot at prepare
    /// time; disabled, every write tranlocal publishes.
    pub dirty_check: bool,
    /// Attach pure reads to the transaction. Disabled, reads of
    /// read-biased references go untracked and lean entirely on the
    /// conflict counter.
    pub track_reads: bool,
    /// Attempt budget the driving loop honors via `soft_reset`.
    pub max_retries: u32,
    /// Total blocking budget for `retry` waits; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Minimum lock acquired by every read.
    pub read_lock_mode: LockMode,
    /// Minimum lock acquired by every write.
    pub write_lock_mode: LockMode,
    /// Attachment-storage tier.
    pub tier: CapacityTier,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            spin_count: DEFAULT_SPIN_COUNT,
            readonly: false,
            blocking_allowed: true,
            dirty_check: true,
            track_reads: true,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            tier: CapacityTier::default(),
        }
    }
}

impl TxnConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Readonly variant.
    #[must_use]
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Override the spin budget.
    #[must_use]
    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Allow or forbid blocking retry.
    #[must_use]
    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    /// Enable or disable prepare-time dirty checking.
    #[must_use]
    pub fn with_dirty_check(mut self, dirty_check: bool) -> Self {
        self.dirty_check = dirty_check;
        self
    }

    /// Enable or disable read tracking.
    #[must_use]
    pub fn with_track_reads(mut self, track_reads: bool) -> Self {
        self.track_reads = track_reads;
        self
    }

    /// Override the attempt budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Total blocking budget for retry waits.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pessimistic read floor: every read acquires at least this lock.
    #[must_use]
    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    /// Pessimistic write floor: every write acquires at least this lock.
    #[must_use]
    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    /// Attachment-storage tier.
    #[must_use]
    pub fn with_tier(mut self, tier: CapacityTier) -> Self {
        self.tier = tier;
        self
    }
}
