//! Foundation types for the vstm engine.
//!
//! The runtime machinery (orecs, tranlocals, transactions) lives in
//! `vstm-core`; this crate holds the small shared vocabulary those pieces
//! exchange: ids, lock tiers, transaction states, protocol status codes
//! and tuning constants.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default number of spins before `arrive`/`try_lock` give up on a
/// contended orec and report a conflict.
pub const DEFAULT_SPIN_COUNT: u32 = 64;

/// Consecutive read-only commits after which an orec flips to read-biased
/// mode. Must fit the orec's 10-bit readonly counter.
pub const READ_BIASED_THRESHOLD: u32 = 16;

/// Default maximum attempts a driving loop should give a transaction
/// before raising a terminal "too many attempts" error.
pub const DEFAULT_MAX_RETRIES: u32 = 1000;

// ---------------------------------------------------------------------------
// RefId
// ---------------------------------------------------------------------------

/// Process-unique identity of a transactional reference.
///
/// Allocated from a global monotonic counter at reference creation; used
/// by transactions to look up attached tranlocals without touching the
/// reference's value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(u64);

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

impl RefId {
    /// Allocate a fresh id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_REF_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for hashing/striping.
    #[inline]
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// LockMode
// ---------------------------------------------------------------------------

/// Lock tier on an orec, totally ordered by strength.
///
/// - `None`: no lock; arrives and lock acquisition allowed.
/// - `Read`: shared; admits arrives and further read locks, blocks
///   write/commit acquisition.
/// - `Write`: exclusive against other locks, but still admits arrives
///   (readers may register interest while an update is staged).
/// - `Commit`: fully exclusive; blocks arrives as well. Held while a
///   value is being published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    #[default]
    None,
    Read,
    Write,
    Commit,
}

impl LockMode {
    /// Encode as the orec word's 2-bit lock field.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Read => 1,
            Self::Write => 2,
            Self::Commit => 3,
        }
    }

    /// Decode the orec word's 2-bit lock field.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::None,
            1 => Self::Read,
            2 => Self::Write,
            _ => Self::Commit,
        }
    }

    /// The stronger of two modes.
    #[inline]
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if self >= other { self } else { other }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
            Self::Commit => "commit",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TxnStatus
// ---------------------------------------------------------------------------

/// Transaction state machine states.
///
/// Transitions: `Active -> {Prepared, Aborted}`, `Prepared -> {Committed,
/// Aborted}`. `Committed`/`Aborted` are terminal until an explicit reset
/// re-initializes to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// Reading/writing; all open operations allowed.
    Active,
    /// All dirty orecs commit-locked and validated; only commit or abort.
    Prepared,
    /// Published; terminal.
    Committed,
    /// Rolled back; terminal.
    Aborted,
}

impl TxnStatus {
    /// Whether the transaction can still be mutated.
    #[inline]
    #[must_use]
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Active | Self::Prepared)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Prepared => "prepared",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ArriveStatus
// ---------------------------------------------------------------------------

/// Outcome of registering interest in an orec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArriveStatus {
    /// Surplus incremented; the caller owes a matching depart.
    Registered,
    /// The orec is read-biased: interest is not individually tracked and
    /// no depart must follow.
    Unregistered,
    /// Lock contention outlasted the spin budget.
    LockNotFree,
}

impl ArriveStatus {
    /// Whether the arrive succeeded (registered or not).
    #[inline]
    #[must_use]
    pub fn is_success(self) -> bool {
        !matches!(self, Self::LockNotFree)
    }
}

// ---------------------------------------------------------------------------
// RegistrationStatus
// ---------------------------------------------------------------------------

/// Outcome of registering a retry latch on one orec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStatus {
    /// Latch enqueued on the orec's listener chain.
    Done,
    /// The value already advanced past the caller's snapshot; the latch
    /// was opened immediately and no further registrations are needed.
    NotNeeded,
    /// Nothing to wait on (never-committed reference).
    None,
}

// ---------------------------------------------------------------------------
// CapacityTier
// ---------------------------------------------------------------------------

/// Attachment-storage strategy for a transaction.
///
/// Pure performance specialization: a transaction touching one reference
/// needs no hash index, a handful fit a scanned array, and anything
/// larger pays for a map. Exceeding a tier is a speculative-configuration
/// failure the driving loop resolves by upgrading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapacityTier {
    /// Exactly one attached reference.
    Single,
    /// Up to `n` attached references, linear-scanned.
    Array(usize),
    /// Unbounded, hash-indexed.
    Map,
}

impl CapacityTier {
    /// Maximum number of attachments this tier can hold.
    #[inline]
    #[must_use]
    pub fn capacity(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Array(n) => n,
            Self::Map => usize::MAX,
        }
    }

    /// The next tier up, able to hold at least `required` attachments.
    #[must_use]
    pub fn upgraded_for(self, required: usize) -> Self {
        match self {
            Self::Single => {
                if required <= 16 {
                    Self::Array(16.max(required))
                } else {
                    Self::Map
                }
            }
            Self::Array(n) => {
                if required <= n.saturating_mul(2) && required <= 64 {
                    Self::Array(n.saturating_mul(2).max(required))
                } else {
                    Self::Map
                }
            }
            Self::Map => Self::Map,
        }
    }
}

impl Default for CapacityTier {
    fn default() -> Self {
        Self::Array(16)
    }
}
