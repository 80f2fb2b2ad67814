//! The transactional reference.
//!
//! A [`TRef<T>`] owns one committed, versioned snapshot plus the
//! concurrency-control state around it: the orec and the listener chain.
//! All transactional access goes through a [`crate::Transaction`]; the
//! only direct read is the weak [`TRef::atomic_get`].
//!
//! The committed snapshot is an `Arc` behind a reader/writer lock. Only
//! the commit-lock holder ever replaces it, so the write-side critical
//! section is the pointer store itself; the load protocol (read, arrive,
//! re-read, pointer-compare) mirrors the orec's semi-visible-read design
//! and guarantees the returned snapshot was committed while the caller's
//! interest was registered.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::counters::GlobalConflictCounter;
use crate::latch::{Latch, ListenerChain};
use crate::orec::Orec;
use crate::tranlocal::{StmValue, Tranlocal};
use crate::txn::Transaction;

use vstm_error::{ConflictCause, StmResult};
use vstm_types::{ArriveStatus, LockMode, RefId, RegistrationStatus};

// ---------------------------------------------------------------------------
// Committed / LoadedRead
// ---------------------------------------------------------------------------

/// One committed value with the version it was published under.
/// Immutable once published; shared by every transaction that read it.
#[derive(Debug)]
pub(crate) struct Committed<T> {
    pub(crate) value: T,
    pub(crate) version: u64,
}

/// Result of a successful load: the snapshot, the lock granted along the
/// way, and whether the orec surplus now carries this caller.
#[derive(Debug)]
pub(crate) struct LoadedRead<T> {
    pub(crate) snapshot: Arc<Committed<T>>,
    pub(crate) granted: LockMode,
    pub(crate) depart_obligation: bool,
}

struct RefInner<T> {
    id: RefId,
    orec: Orec,
    active: RwLock<Option<Arc<Committed<T>>>>,
    listeners: Mutex<ListenerChain>,
    /// Set once by the transaction that opens an unborn reference for
    /// construction; a second claimant is misuse.
    construction_claimed: std::sync::atomic::AtomicBool,
}

// ---------------------------------------------------------------------------
// TRef
// ---------------------------------------------------------------------------

/// A shared transactional reference to a value of type `T`.
///
/// Cheap to clone (an `Arc` handle); clones refer to the same cell.
pub struct TRef<T: StmValue> {
    inner: Arc<RefInner<T>>,
}

impl<T: StmValue> Clone for TRef<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: StmValue> TRef<T> {
    /// A reference born with a committed `initial` value (version 1).
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(RefInner {
                id: RefId::next(),
                orec: Orec::new(),
                active: RwLock::new(Some(Arc::new(Committed { value: initial, version: 1 }))),
                listeners: Mutex::new(ListenerChain::new()),
                construction_claimed: std::sync::atomic::AtomicBool::new(true),
            }),
        }
    }

    /// An unborn reference: no committed value, commit-locked from
    /// allocation. It must be opened for construction inside a
    /// transaction and receives its first value at that transaction's
    /// commit. If that transaction aborts instead, the reference stays
    /// locked forever and every later access conflicts.
    #[must_use]
    pub fn new_unborn() -> Self {
        Self {
            inner: Arc::new(RefInner {
                id: RefId::next(),
                orec: Orec::new_unborn(),
                active: RwLock::new(None),
                listeners: Mutex::new(ListenerChain::new()),
                construction_claimed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique identity.
    #[must_use]
    pub fn id(&self) -> RefId {
        self.inner.id
    }

    /// Whether a first value has ever been committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.inner.active.read().is_some()
    }

    /// Committed version of this reference (0 if unborn).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.orec.version()
    }

    // --- convenience transactional API ------------------------------------

    /// Read the value through `txn`.
    pub fn get(&self, txn: &mut Transaction) -> StmResult<T> {
        Ok(txn.open_for_read(self, LockMode::None)?.value().clone())
    }

    /// Stage `value` through `txn`.
    pub fn set(&self, txn: &mut Transaction, value: T) -> StmResult<()> {
        txn.open_for_write(self, LockMode::None)?.set_value(value);
        Ok(())
    }

    /// Stage `function(current)` through `txn`, observing the value.
    pub fn update(&self, txn: &mut Transaction, function: impl Fn(&T) -> T) -> StmResult<T> {
        let tranlocal = txn.open_for_write(self, LockMode::None)?;
        let next = function(tranlocal.value());
        tranlocal.set_value(next.clone());
        Ok(next)
    }

    /// Queue `function` as a commuting update through `txn`: it is
    /// applied at commit time without this transaction observing (or
    /// conflicting on) the current value.
    pub fn commute(
        &self,
        txn: &mut Transaction,
        function: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> StmResult<()> {
        txn.commute(self, function)
    }

    /// Demand a privatization check for this reference at prepare time
    /// even if the transaction never writes it.
    pub fn ensure(&self, txn: &mut Transaction) -> StmResult<()> {
        txn.open_for_read(self, LockMode::None)?;
        txn.mark_check_conflict(self);
        Ok(())
    }

    /// Weak read outside any transaction: the latest committed snapshot.
    ///
    /// Never blocks and never registers interest; concurrent with a
    /// commit it returns either the old or the new value, both of which
    /// were committed at some point during the call.
    ///
    /// # Panics
    ///
    /// Panics on an unborn reference.
    #[must_use]
    pub fn atomic_get(&self) -> T {
        self.try_atomic_get().expect("atomic_get on unborn reference")
    }

    /// Weak read that reports `None` on an unborn reference.
    #[must_use]
    pub fn try_atomic_get(&self) -> Option<T> {
        self.inner.active.read().as_ref().map(|committed| committed.value.clone())
    }

    // --- engine internals --------------------------------------------------

    pub(crate) fn orec(&self) -> &Orec {
        &self.inner.orec
    }

    /// Current committed version straight off the orec.
    pub(crate) fn current_version(&self) -> u64 {
        self.inner.orec.version()
    }

    /// Claim the right to construct this unborn reference. Exactly one
    /// transaction wins.
    pub(crate) fn claim_construction(&self) -> bool {
        self.inner
            .construction_claimed
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
    }

    /// Load the committed snapshot with interest registered.
    ///
    /// Read the snapshot, arrive, and re-read: if the pointer moved in
    /// between, undo and start over, so the snapshot handed out is the
    /// one that was current while the arrive was visible.
    pub(crate) fn load(&self, spin_count: u32) -> Result<LoadedRead<T>, ConflictCause> {
        loop {
            let before = self.inner.active.read().clone();

            let status = self.inner.orec.arrive(spin_count);
            if !status.is_success() {
                return Err(ConflictCause::LockedByOther);
            }

            let after = self.inner.active.read().clone();
            match (before, after) {
                (Some(before), Some(after)) if Arc::ptr_eq(&before, &after) => {
                    return Ok(LoadedRead {
                        snapshot: after,
                        granted: LockMode::None,
                        depart_obligation: status == ArriveStatus::Registered,
                    });
                }
                _ => {
                    // The value changed underneath the arrive; undo and retry.
                    if status == ArriveStatus::Registered {
                        self.inner.orec.depart_after_failure();
                    }
                }
            }
        }
    }

    /// Load with `desired` acquired first (pessimistic open). The lock
    /// pins the snapshot, so no re-read loop is needed.
    pub(crate) fn lock_and_load(
        &self,
        spin_count: u32,
        desired: LockMode,
    ) -> Result<LoadedRead<T>, ConflictCause> {
        let status = self.inner.orec.try_lock_and_arrive(spin_count, desired);
        if !status.is_success() {
            return Err(ConflictCause::LockedByOther);
        }

        let snapshot = self.inner.active.read().clone();
        let Some(snapshot) = snapshot else {
            // Unborn references are commit-locked, so the lock acquisition
            // above can never succeed against one.
            unreachable!("locked an unborn reference");
        };
        Ok(LoadedRead {
            snapshot,
            granted: desired,
            depart_obligation: status == ArriveStatus::Registered,
        })
    }

    /// Undo a successful load whose tranlocal will not be kept, releasing
    /// any lock granted along the way.
    pub(crate) fn release_failed_load(&self, loaded: &LoadedRead<T>) {
        match loaded.granted {
            LockMode::None => {
                if loaded.depart_obligation {
                    self.inner.orec.depart_after_failure();
                }
            }
            held => {
                let _ = self.inner.orec.depart_after_failure_and_release_lock(held);
            }
        }
    }

    /// Publish a committed update while holding the commit lock: swap the
    /// snapshot, detach the listener chain, then bump the version and
    /// release the lock (signalling the conflict counter if anyone else
    /// still depends on the replaced value).
    ///
    /// The caller opens the returned chain only after releasing every
    /// lock the committing transaction holds.
    pub(crate) fn publish_update(
        &self,
        value: T,
        global: &GlobalConflictCounter,
    ) -> ListenerChain {
        let new_version = self.inner.orec.version() + 1;
        {
            let mut active = self.inner.active.write();
            *active = Some(Arc::new(Committed { value, version: new_version }));
        }

        // Detach before the unlock: registrations serialized before this
        // point are our responsibility, later ones see the new snapshot.
        let chain = self.inner.listeners.lock().detach();

        let remaining = self
            .inner
            .orec
            .depart_after_update_and_release_lock(global, self.inner.id);
        tracing::trace!(
            ref_id = %self.inner.id,
            version = new_version,
            remaining_surplus = remaining,
            "published update"
        );
        chain
    }

    /// Register a retry latch to be opened by the next committed update
    /// after `seen_version`.
    ///
    /// Registration is optimistic: if the committed version already moved
    /// past `seen_version`, the latch is opened immediately instead of
    /// enqueued, so a wakeup can never be missed. The snapshot version is
    /// read under the listener mutex, which a committing writer also
    /// takes (after publishing, before unlocking) to detach the chain.
    pub(crate) fn register_change_listener(
        &self,
        latch: &Arc<Latch>,
        era: u64,
        seen_version: u64,
    ) -> RegistrationStatus {
        let mut listeners = self.inner.listeners.lock();
        let current = self.inner.active.read().as_ref().map(|committed| committed.version);
        let Some(current) = current else {
            return RegistrationStatus::None;
        };
        if current != seen_version {
            drop(listeners);
            latch.open(era);
            return RegistrationStatus::NotNeeded;
        }
        listeners.push(Arc::clone(latch), era);
        RegistrationStatus::Done
    }
}

impl<T: StmValue> std::fmt::Debug for TRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TRef")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .field("orec", &self.inner.orec)
            .finish()
    }
}

/// Tranlocal constructors live here so the transaction can stay value-
/// type-agnostic until the last moment.
impl<T: StmValue> TRef<T> {
    pub(crate) fn tranlocal_read(&self, loaded: LoadedRead<T>) -> Tranlocal<T> {
        Tranlocal::new_read(self.clone(), loaded)
    }

    pub(crate) fn tranlocal_write(&self, loaded: LoadedRead<T>) -> Tranlocal<T> {
        Tranlocal::new_write(self.clone(), loaded)
    }

    pub(crate) fn tranlocal_constructing(&self, initial: T) -> Tranlocal<T> {
        Tranlocal::new_constructing(self.clone(), initial)
    }

    pub(crate) fn tranlocal_commuting(
        &self,
        function: crate::tranlocal::CommuteFn<T>,
    ) -> Tranlocal<T> {
        Tranlocal::new_commuting(self.clone(), function)
    }
}
