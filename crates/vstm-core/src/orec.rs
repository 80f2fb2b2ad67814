//! The ownership record: per-reference lock/version/bias state.
//!
//! One packed `AtomicU64` CAS word carries the whole concurrency-control
//! state of a reference, plus a separate full-width version counter:
//!
//! ```text
//! bit 63..62   lock tier (none / read / write / commit)
//! bit 61       read-biased
//! bit 60..51   read-lock count (shared holders of the read tier)
//! bit 50..10   surplus (transactions holding an open interest)
//! bit  9..0    consecutive read-only depart count
//! ```
//!
//! The protocol is arrive/depart (semi-visible reads): a reader registers
//! interest by incrementing the surplus and owes a matching depart. An
//! updater that releases its commit lock while surplus remains knows
//! other transactions still depend on the old value and bumps the global
//! conflict counter, forcing them through a read-set scan.
//!
//! After enough consecutive read-only departs drain the surplus to zero,
//! the orec flips to read-biased: readers thereafter skip registration
//! entirely (no CAS per read) and staleness detection falls back on the
//! conflict counter. The first update converts it back, pessimistically
//! assuming an unknown number of readers.
//!
//! All operations are lock-free CAS loops that spin a bounded number of
//! times on contention and then fail — blocking is built above this layer
//! out of retry, never inside it. Misuse (departing without surplus,
//! unlocking an unlocked record) panics: those states are unreachable
//! unless the engine's own bookkeeping is broken.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::counters::GlobalConflictCounter;

use vstm_types::{ArriveStatus, LockMode, RefId, READ_BIASED_THRESHOLD};

// ---------------------------------------------------------------------------
// Bit layout
// ---------------------------------------------------------------------------

const LOCK_SHIFT: u32 = 62;
const LOCK_MASK: u64 = 0b11 << LOCK_SHIFT;

const READ_BIASED_BIT: u64 = 1 << 61;

const READ_LOCKS_SHIFT: u32 = 51;
const READ_LOCKS_MASK: u64 = 0x3FF << READ_LOCKS_SHIFT;

const SURPLUS_SHIFT: u32 = 10;
const SURPLUS_MASK: u64 = ((1 << 41) - 1) << SURPLUS_SHIFT;

const READONLY_MASK: u64 = 0x3FF;

#[inline]
const fn lock_of(word: u64) -> LockMode {
    LockMode::from_bits((word & LOCK_MASK) >> LOCK_SHIFT)
}

#[inline]
const fn with_lock(word: u64, mode: LockMode) -> u64 {
    (word & !LOCK_MASK) | (mode.to_bits() << LOCK_SHIFT)
}

#[inline]
const fn read_biased_of(word: u64) -> bool {
    word & READ_BIASED_BIT != 0
}

#[inline]
const fn with_read_biased(word: u64, biased: bool) -> u64 {
    if biased {
        word | READ_BIASED_BIT
    } else {
        word & !READ_BIASED_BIT
    }
}

#[inline]
const fn read_locks_of(word: u64) -> u64 {
    (word & READ_LOCKS_MASK) >> READ_LOCKS_SHIFT
}

#[inline]
const fn with_read_locks(word: u64, count: u64) -> u64 {
    (word & !READ_LOCKS_MASK) | (count << READ_LOCKS_SHIFT)
}

#[inline]
const fn surplus_of(word: u64) -> u64 {
    (word & SURPLUS_MASK) >> SURPLUS_SHIFT
}

#[inline]
const fn with_surplus(word: u64, surplus: u64) -> u64 {
    (word & !SURPLUS_MASK) | (surplus << SURPLUS_SHIFT)
}

#[inline]
const fn readonly_of(word: u64) -> u64 {
    word & READONLY_MASK
}

#[inline]
const fn with_readonly(word: u64, count: u64) -> u64 {
    (word & !READONLY_MASK) | count
}

/// Can a new arrive proceed under this word? Only the commit tier blocks
/// readers; read and write tiers admit them.
#[inline]
const fn admits_arrive(word: u64) -> bool {
    !matches!(lock_of(word), LockMode::Commit)
}

/// Can `desired` be acquired given the current tier? Read composes with
/// read; write and commit need the record unlocked.
#[inline]
fn admits_lock(word: u64, desired: LockMode) -> bool {
    match desired {
        LockMode::Read => matches!(lock_of(word), LockMode::None | LockMode::Read),
        LockMode::Write | LockMode::Commit => lock_of(word) == LockMode::None,
        LockMode::None => true,
    }
}

// ---------------------------------------------------------------------------
// Orec
// ---------------------------------------------------------------------------

/// Ownership record for one transactional reference.
pub struct Orec {
    state: AtomicU64,
    /// Monotonic commit version; incremented exactly once per successful
    /// committed update, while the commit lock is still held.
    version: AtomicU64,
}

impl Orec {
    /// Record for a reference born with a committed value (version 1).
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            version: AtomicU64::new(1),
        }
    }

    /// Record for an unborn reference: commit-locked with one interested
    /// holder (the constructing transaction) and no committed version.
    #[must_use]
    pub fn new_unborn() -> Self {
        let word = with_surplus(with_lock(0, LockMode::Commit), 1);
        Self {
            state: AtomicU64::new(word),
            version: AtomicU64::new(0),
        }
    }

    // --- accessors ---------------------------------------------------------

    /// Current lock tier.
    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        lock_of(self.state.load(Ordering::Acquire))
    }

    /// Count of transactions holding an open interest. Unspecified while
    /// read-biased.
    #[must_use]
    pub fn surplus(&self) -> u64 {
        surplus_of(self.state.load(Ordering::Acquire))
    }

    /// Whether readers currently skip registration.
    #[must_use]
    pub fn is_read_biased(&self) -> bool {
        read_biased_of(self.state.load(Ordering::Acquire))
    }

    /// Consecutive read-only departs so far. Unspecified while read-biased.
    #[must_use]
    pub fn readonly_count(&self) -> u64 {
        readonly_of(self.state.load(Ordering::Acquire))
    }

    /// Committed version. Zero means never committed.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether the record is commit-locked (readers blocked).
    #[must_use]
    pub fn is_commit_locked(&self) -> bool {
        self.lock_mode() == LockMode::Commit
    }

    // --- arrive ------------------------------------------------------------

    /// Register as an active holder.
    ///
    /// Spins up to `spin_count` while the record is commit-locked, then
    /// fails. On a read-biased record interest is not individually
    /// tracked: the arrive succeeds without a depart obligation
    /// ([`ArriveStatus::Unregistered`]).
    pub fn arrive(&self, spin_count: u32) -> ArriveStatus {
        let mut remaining = spin_count;
        loop {
            let current = self.state.load(Ordering::Acquire);

            if !admits_arrive(current) {
                if remaining == 0 {
                    return ArriveStatus::LockNotFree;
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            if read_biased_of(current) {
                if surplus_of(current) > 0 {
                    return ArriveStatus::Unregistered;
                }
                // First reader after the flip leaves a permanent surplus
                // of one marking "some reader may exist".
                let next = with_surplus(current, 1);
                if self.cas(current, next) {
                    return ArriveStatus::Unregistered;
                }
            } else {
                let next = with_surplus(current, surplus_of(current) + 1);
                if self.cas(current, next) {
                    return ArriveStatus::Registered;
                }
            }
        }
    }

    /// Arrive and acquire `desired` in a single CAS.
    ///
    /// Used by pessimistic opens that want the lock before reading. Fails
    /// after `spin_count` attempts against an incompatible tier.
    pub fn try_lock_and_arrive(&self, spin_count: u32, desired: LockMode) -> ArriveStatus {
        assert_ne!(desired, LockMode::None, "try_lock_and_arrive needs a lock tier");
        let mut remaining = spin_count;
        loop {
            let current = self.state.load(Ordering::Acquire);

            if !admits_lock(current, desired) {
                if remaining == 0 {
                    return ArriveStatus::LockNotFree;
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            let registered = !read_biased_of(current);
            let surplus = if registered {
                surplus_of(current) + 1
            } else {
                surplus_of(current).max(1)
            };
            let mut next = with_surplus(current, surplus);
            if desired == LockMode::Read {
                next = with_read_locks(next, read_locks_of(next) + 1);
            }
            next = with_lock(next, desired);

            if self.cas(current, next) {
                return if registered {
                    ArriveStatus::Registered
                } else {
                    ArriveStatus::Unregistered
                };
            }
        }
    }

    /// Acquire `desired` for a transaction that has already arrived.
    ///
    /// # Panics
    ///
    /// Panics if the record has no surplus (an arrive must precede).
    pub fn try_lock_after_arrive(&self, spin_count: u32, desired: LockMode) -> bool {
        assert_ne!(desired, LockMode::None, "try_lock_after_arrive needs a lock tier");
        let mut remaining = spin_count;
        loop {
            let current = self.state.load(Ordering::Acquire);

            if !admits_lock(current, desired) {
                if remaining == 0 {
                    return false;
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            assert!(
                surplus_of(current) > 0 || read_biased_of(current),
                "orec: lock-after-arrive without surplus"
            );

            let mut next = current;
            if desired == LockMode::Read {
                next = with_read_locks(next, read_locks_of(next) + 1);
            }
            next = with_lock(next, desired);

            if self.cas(current, next) {
                return true;
            }
        }
    }

    /// Upgrade an already-held lock to a stronger tier.
    ///
    /// Read upgrades require being the sole read locker; a write lock
    /// upgrades to commit unconditionally. Returns `false` when other
    /// read lockers outlast the spin budget.
    ///
    /// # Panics
    ///
    /// Panics if `held` is not actually the current tier.
    pub fn try_upgrade_lock(&self, spin_count: u32, held: LockMode, desired: LockMode) -> bool {
        if held >= desired {
            return true;
        }
        if held == LockMode::None {
            return self.try_lock_after_arrive(spin_count, desired);
        }

        let mut remaining = spin_count;
        loop {
            let current = self.state.load(Ordering::Acquire);
            assert_eq!(
                lock_of(current),
                held,
                "orec: upgrading a lock that is not held"
            );

            let next = match held {
                LockMode::Read => {
                    if read_locks_of(current) > 1 {
                        if remaining == 0 {
                            return false;
                        }
                        remaining -= 1;
                        std::hint::spin_loop();
                        continue;
                    }
                    with_lock(with_read_locks(current, 0), desired)
                }
                LockMode::Write => with_lock(current, desired),
                LockMode::None | LockMode::Commit => unreachable!(),
            };

            if self.cas(current, next) {
                return true;
            }
        }
    }

    // --- depart ------------------------------------------------------------

    /// Depart after a pure read (no lock held).
    ///
    /// Returns `true` when this depart flipped the record to read-biased;
    /// the record is then commit-locked and the caller must follow up
    /// with [`Orec::unlock_after_becoming_read_biased`].
    ///
    /// # Panics
    ///
    /// Panics if there is no surplus or the record is read-biased
    /// (read-biased readers never depart).
    pub fn depart_after_reading(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let surplus = surplus_of(current);
            assert!(surplus > 0, "orec: depart_after_reading without surplus");
            assert!(
                !read_biased_of(current),
                "orec: depart_after_reading on read-biased record"
            );

            let surplus = surplus - 1;
            let readonly = readonly_of(current) + 1;

            if surplus == 0 && readonly >= u64::from(READ_BIASED_THRESHOLD) {
                debug_assert_eq!(lock_of(current), LockMode::None);
                let next = with_read_biased(
                    with_readonly(with_surplus(with_lock(current, LockMode::Commit), 0), 0),
                    true,
                );
                if self.cas(current, next) {
                    tracing::debug!("orec flipped to read-biased");
                    return true;
                }
            } else {
                let next = with_readonly(with_surplus(current, surplus), readonly);
                if self.cas(current, next) {
                    return false;
                }
            }
        }
    }

    /// Depart after a read that also held `held`, releasing the lock.
    ///
    /// Same read-bias flip behavior as [`Orec::depart_after_reading`].
    ///
    /// # Panics
    ///
    /// Panics if no surplus, no lock held, or already read-biased.
    pub fn depart_after_reading_and_release_lock(&self, held: LockMode) -> bool {
        assert_ne!(held, LockMode::None, "orec: release without a held lock");
        loop {
            let current = self.state.load(Ordering::Acquire);
            let surplus = surplus_of(current);
            assert!(surplus > 0, "orec: depart-and-release without surplus");
            assert!(
                !read_biased_of(current),
                "orec: depart-and-release on read-biased record"
            );
            assert_ne!(lock_of(current), LockMode::None, "orec: not locked");

            let unlocked = release_lock(current, held);
            let surplus = surplus - 1;
            let readonly = readonly_of(current) + 1;

            if surplus == 0 && readonly >= u64::from(READ_BIASED_THRESHOLD) {
                let next = with_read_biased(
                    with_readonly(with_surplus(with_lock(unlocked, LockMode::Commit), 0), 0),
                    true,
                );
                if self.cas(current, next) {
                    tracing::debug!("orec flipped to read-biased");
                    return true;
                }
            } else {
                let next = with_readonly(with_surplus(unlocked, surplus), readonly);
                if self.cas(current, next) {
                    return false;
                }
            }
        }
    }

    /// Publish a committed update: bump the version, release the held
    /// write/commit lock, and return the remaining surplus.
    ///
    /// Unless the committer was the sole interested transaction, the
    /// global conflict counter is signalled — other transactions still
    /// depend on the replaced value. The signal fires before the lock
    /// release so no reader can load the new value ahead of the counter
    /// bump (it may fire more than once under CAS contention, which is
    /// harmless: the counter is only ever compared for movement).
    ///
    /// A read-biased record converts back to update-biased here, with an
    /// unknown reader population treated as conflicting.
    ///
    /// # Panics
    ///
    /// Panics if no write/commit lock is held.
    pub fn depart_after_update_and_release_lock(
        &self,
        global: &GlobalConflictCounter,
        ref_id: RefId,
    ) -> u64 {
        // Still under the lock: the new version must be visible before
        // any reader can arrive again.
        self.version.fetch_add(1, Ordering::AcqRel);

        loop {
            let current = self.state.load(Ordering::Acquire);
            assert!(
                lock_of(current) >= LockMode::Write,
                "orec: depart_after_update without write/commit lock"
            );

            let (conflict, surplus, resulting) = if read_biased_of(current) {
                // Reader population unknown: assume the worst.
                (surplus_of(current) > 0, 0, surplus_of(current))
            } else {
                let s = surplus_of(current) - 1;
                (s > 0, s, s)
            };

            if conflict {
                global.signal_conflict(ref_id);
            }

            let next = with_read_biased(
                with_readonly(
                    with_surplus(with_read_locks(with_lock(current, LockMode::None), 0), surplus),
                    0,
                ),
                false,
            );

            if self.cas(current, next) {
                return resulting;
            }
        }
    }

    /// Undo an arrive on the failure path (no lock held by the caller).
    ///
    /// # Panics
    ///
    /// Panics on a read-biased record, or when the surplus bookkeeping
    /// does not cover this depart.
    pub fn depart_after_failure(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            assert!(
                !read_biased_of(current),
                "orec: depart_after_failure on read-biased record"
            );

            let surplus = surplus_of(current);
            if lock_of(current) >= LockMode::Write {
                // Another transaction holds the lock and owns one unit of
                // surplus; ours must still be present.
                assert!(surplus >= 2, "orec: failing depart under foreign lock");
            } else {
                assert!(surplus > 0, "orec: depart_after_failure without surplus");
            }

            let next = with_surplus(current, surplus - 1);
            if self.cas(current, next) {
                return;
            }
        }
    }

    /// Undo an arrive and release `held` on the failure path. Returns the
    /// remaining surplus.
    ///
    /// # Panics
    ///
    /// Panics if not locked or no surplus.
    pub fn depart_after_failure_and_release_lock(&self, held: LockMode) -> u64 {
        assert_ne!(held, LockMode::None, "orec: release without a held lock");
        loop {
            let current = self.state.load(Ordering::Acquire);
            assert_ne!(lock_of(current), LockMode::None, "orec: not locked");
            let surplus = surplus_of(current);
            assert!(surplus > 0, "orec: failing release without surplus");

            // With a read-biased record the surplus does not track
            // individual readers, so it stays put.
            let surplus = if read_biased_of(current) { surplus } else { surplus - 1 };

            let next = with_surplus(release_lock(current, held), surplus);
            if self.cas(current, next) {
                return surplus;
            }
        }
    }

    /// Release the transient commit lock taken while converting to
    /// read-biased mode.
    ///
    /// # Panics
    ///
    /// Panics if the record is not locked.
    pub fn unlock_after_becoming_read_biased(&self) {
        self.release_lock_only(LockMode::Commit);
    }

    /// Release `held` without departing.
    ///
    /// Used on read-biased records, where interest is not individually
    /// tracked and no depart may follow a read.
    ///
    /// # Panics
    ///
    /// Panics if the record is not locked.
    pub fn release_lock_only(&self, held: LockMode) {
        assert_ne!(held, LockMode::None, "orec: release without a held lock");
        loop {
            let current = self.state.load(Ordering::Acquire);
            assert_ne!(lock_of(current), LockMode::None, "orec: not locked");
            let next = release_lock(current, held);
            if self.cas(current, next) {
                return;
            }
        }
    }

    #[inline]
    fn cas(&self, current: u64, next: u64) -> bool {
        self.state
            .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Clear the caller's `held` contribution from the lock field.
#[inline]
fn release_lock(word: u64, held: LockMode) -> u64 {
    match held {
        LockMode::Read => {
            let count = read_locks_of(word);
            debug_assert!(count > 0);
            let next = with_read_locks(word, count - 1);
            if count == 1 {
                with_lock(next, LockMode::None)
            } else {
                next
            }
        }
        LockMode::Write | LockMode::Commit => with_read_locks(with_lock(word, LockMode::None), 0),
        LockMode::None => word,
    }
}

impl Default for Orec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Orec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.state.load(Ordering::Acquire);
        f.debug_struct("Orec")
            .field("lock", &lock_of(word))
            .field("read_locks", &read_locks_of(word))
            .field("read_biased", &read_biased_of(word))
            .field("surplus", &surplus_of(word))
            .field("readonly_count", &readonly_of(word))
            .field("version", &self.version())
            .finish()
    }
}
