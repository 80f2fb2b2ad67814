//! Error taxonomy for vstm.
//!
//! Two families share one enum, distinguished by [`StmError::is_recoverable`]:
//!
//! - **Recoverable outcomes** a driving retry-loop is expected to match on
//!   and resolve locally: [`StmError::Conflict`] (abort and re-run the
//!   transaction body) and [`StmError::SpeculativeConfig`] (upgrade the
//!   capacity tier, then re-run). These are ordinary control flow, not
//!   bugs.
//! - **Misuse** signalled outward: operations on dead or prepared
//!   transactions, writes through readonly configurations, blocking where
//!   it is disabled. Retrying these is pointless.
//!
//! Orec bookkeeping violations (departing without surplus, unlocking an
//! unlocked record) are panics in `vstm-core`, not variants here: they are
//! unreachable unless the engine itself is broken.

use thiserror::Error;
use vstm_types::TxnStatus;

// ---------------------------------------------------------------------------
// ConflictCause
// ---------------------------------------------------------------------------

/// Why a read/write conflict was signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictCause {
    /// A lock on the orec outlasted the spin budget.
    LockedByOther,
    /// The committed version moved past the transaction's snapshot.
    StaleRead,
    /// The global conflict counter advanced and the read-set scan found a
    /// changed reference.
    ReadSetInconsistent,
    /// A commit lock could not be acquired while preparing dirty writes.
    CommitLockFailed,
    /// The transaction was poisoned with `set_abort_only`.
    AbortOnly,
}

impl std::fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LockedByOther => "locked by another transaction",
            Self::StaleRead => "committed version moved past snapshot",
            Self::ReadSetInconsistent => "read set inconsistent",
            Self::CommitLockFailed => "commit lock unavailable",
            Self::AbortOnly => "transaction marked abort-only",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SpeculativeFailure
// ---------------------------------------------------------------------------

/// A runtime-discovered sizing/feature assumption violation.
///
/// Not surfaced to end users: the driving loop upgrades the transaction's
/// tier to cover `required` attachments and re-runs the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpeculativeFailure {
    /// Attachment count the transaction actually needed.
    pub required: usize,
}

impl std::fmt::Display for SpeculativeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transaction needs capacity for {} references", self.required)
    }
}

// ---------------------------------------------------------------------------
// StmError
// ---------------------------------------------------------------------------

/// Primary error type for vstm operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmError {
    // === Recoverable outcomes (retry the transaction) ===
    /// Lock contention or stale version detected at read/write/prepare/
    /// commit time.
    #[error("read/write conflict: {0}")]
    Conflict(ConflictCause),

    /// The configured capacity tier cannot hold the transaction's
    /// attachment set.
    #[error("speculative configuration failed: {0}")]
    SpeculativeConfig(SpeculativeFailure),

    // === Misuse (terminal) ===
    /// Operation attempted on a committed or aborted transaction.
    #[error("transaction is {status}, can't {op}")]
    DeadTransaction {
        status: TxnStatus,
        op: &'static str,
    },

    /// Mutating operation attempted after prepare.
    #[error("transaction already prepared, can't {op}")]
    PreparedTransaction { op: &'static str },

    /// Write attempted through a readonly configuration.
    #[error("can't {op} on readonly transaction")]
    Readonly { op: &'static str },

    /// Blocking retry requested where blocking is disabled.
    #[error("retry requested but blocking is disabled for this transaction")]
    RetryNotAllowed,

    /// Blocking retry requested with nothing to wait on.
    #[error("retry requested but no tracked reads exist, no wakeup is possible")]
    NoRetryPossible,

    /// `open_for_construction` on an already-committed reference, or a
    /// second transaction claiming the same unborn reference.
    #[error("reference is not open for construction")]
    IllegalConstruction,

    // === Terminal outcome raised by the driving loop ===
    /// The retry loop exhausted its attempt budget.
    #[error("transaction failed after {attempts} attempts: {last}")]
    TooManyAttempts {
        attempts: u32,
        last: ConflictCause,
    },
}

impl StmError {
    /// Whether the driving loop should resolve this locally (abort +
    /// re-run, possibly after a tier upgrade) instead of surfacing it.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::SpeculativeConfig(_))
    }

    /// The conflict cause, if this is a conflict.
    #[must_use]
    pub fn conflict_cause(&self) -> Option<ConflictCause> {
        match self {
            Self::Conflict(cause) => Some(*cause),
            _ => None,
        }
    }
}

/// Convenience alias used across the engine.
pub type StmResult<T> = Result<T, StmError>;
