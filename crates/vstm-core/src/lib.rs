//! vstm-core: a versioned software transactional memory engine.
//!
//! Threads read and update shared references ([`TRef`]) through a
//! [`Transaction`] without programmer-managed locks. Each reference
//! carries an ownership record ([`Orec`]) — a packed CAS word holding
//! lock tier, reader surplus and an adaptive read-bias heuristic — and a
//! monotonically versioned committed snapshot. Transactions stage their
//! reads and writes in tranlocals, validate them against the orecs and a
//! cheap global conflict counter, and publish dirty writes under commit
//! locks in attachment order.
//!
//! Blocking is cooperative: a transaction that cannot proceed registers
//! an era-guarded [`Latch`] on every orec it read, aborts itself, and the
//! caller parks on the latch until the next committing write to any of
//! those references opens it.
//!
//! The driving retry-loop and transactional collections live above this
//! crate; they consume the [`Transaction`] API and match on the
//! recoverable [`StmError`] variants.

pub mod cache_aligned;
pub mod config;
pub mod counters;
pub mod latch;
pub mod orec;
pub mod pool;
pub mod tranlocal;
pub mod tref;
pub mod txn;

pub use cache_aligned::{CACHE_LINE_BYTES, CacheAligned};
pub use config::TxnConfig;
pub use counters::{GlobalConflictCounter, LocalConflictCounter};
pub use latch::{Latch, ListenerChain};
pub use orec::Orec;
pub use pool::StmPool;
pub use tranlocal::{CommuteFn, StmValue, Tranlocal, TranlocalMode};
pub use tref::TRef;
pub use txn::{Transaction, TxnEvent, TxnListener};

pub use vstm_error::{ConflictCause, SpeculativeFailure, StmError, StmResult};
pub use vstm_types::{
    ArriveStatus, CapacityTier, LockMode, RefId, RegistrationStatus, TxnStatus,
    DEFAULT_MAX_RETRIES, DEFAULT_SPIN_COUNT, READ_BIASED_THRESHOLD,
};
