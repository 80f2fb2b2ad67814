//! Transaction-local staged state for one reference.
//!
//! A [`Tranlocal<T>`] is created when a transaction first opens a
//! reference and owned exclusively by that transaction until commit,
//! abort or reset. It carries the observed committed snapshot plus, for
//! writes, a staged value, and for commuting opens a FIFO queue of
//! pending functions with no observed value at all.
//!
//! Transactions hold tranlocals of heterogeneous value types, so the
//! state machine drives them through the object-safe [`TranlocalDyn`]
//! trait; the value type surfaces only at the [`crate::TRef`] boundary.

use std::any::Any;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::counters::GlobalConflictCounter;
use crate::latch::{Latch, ListenerChain};
use crate::tref::{Committed, LoadedRead, TRef};

use vstm_types::{LockMode, RefId, RegistrationStatus};

/// Bounds a value must satisfy to live in a transactional reference:
/// cloneable for staging, comparable for dirty checking, shareable
/// across the threads that race on the reference.
pub trait StmValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> StmValue for T {}

/// A deferred, order-insensitive update function.
pub type CommuteFn<T> = Arc<dyn Fn(&T) -> T + Send + Sync>;

// ---------------------------------------------------------------------------
// TranlocalMode
// ---------------------------------------------------------------------------

/// What a tranlocal stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranlocalMode {
    /// Pure read: an observed snapshot, nothing staged.
    Read,
    /// Update: observed snapshot plus a staged value.
    Write,
    /// A reference not yet published; implicitly commit-locked from
    /// allocation until the first publish.
    Constructing,
    /// Deferred functions, no observed value. Flattens to `Write` when a
    /// concrete value is demanded.
    Commuting,
}

// ---------------------------------------------------------------------------
// Tranlocal
// ---------------------------------------------------------------------------

/// Per-(transaction, reference) staged snapshot/update.
pub struct Tranlocal<T: StmValue> {
    owner: TRef<T>,
    read: Option<Arc<Committed<T>>>,
    staged: Option<T>,
    /// Snapshot version observed at open time; 0 for constructing and
    /// not-yet-flattened commuting tranlocals.
    version: u64,
    mode: TranlocalMode,
    lock_mode: LockMode,
    dirty: bool,
    /// Whether this open incremented the orec surplus and owes a depart.
    depart_obligation: bool,
    /// Demand a privatization check at prepare time even if clean.
    check_conflict: bool,
    pending: SmallVec<[CommuteFn<T>; 2]>,
}

impl<T: StmValue> Tranlocal<T> {
    pub(crate) fn new_read(owner: TRef<T>, loaded: LoadedRead<T>) -> Self {
        Self {
            owner,
            version: loaded.snapshot.version,
            read: Some(loaded.snapshot),
            staged: None,
            mode: TranlocalMode::Read,
            lock_mode: loaded.granted,
            dirty: false,
            depart_obligation: loaded.depart_obligation,
            check_conflict: false,
            pending: SmallVec::new(),
        }
    }

    pub(crate) fn new_write(owner: TRef<T>, loaded: LoadedRead<T>) -> Self {
        let staged = loaded.snapshot.value.clone();
        Self {
            owner,
            version: loaded.snapshot.version,
            read: Some(loaded.snapshot),
            staged: Some(staged),
            mode: TranlocalMode::Write,
            lock_mode: loaded.granted,
            dirty: false,
            depart_obligation: loaded.depart_obligation,
            check_conflict: false,
            pending: SmallVec::new(),
        }
    }

    pub(crate) fn new_constructing(owner: TRef<T>, initial: T) -> Self {
        Self {
            owner,
            read: None,
            staged: Some(initial),
            version: 0,
            mode: TranlocalMode::Constructing,
            lock_mode: LockMode::Commit,
            dirty: true,
            depart_obligation: true,
            check_conflict: false,
            pending: SmallVec::new(),
        }
    }

    pub(crate) fn new_commuting(owner: TRef<T>, function: CommuteFn<T>) -> Self {
        let mut pending = SmallVec::new();
        pending.push(function);
        Self {
            owner,
            read: None,
            staged: None,
            version: 0,
            mode: TranlocalMode::Commuting,
            lock_mode: LockMode::None,
            dirty: false,
            depart_obligation: false,
            check_conflict: false,
            pending,
        }
    }

    // --- accessors ---------------------------------------------------------

    /// The reference this tranlocal belongs to.
    #[must_use]
    pub fn owner(&self) -> &TRef<T> {
        &self.owner
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> TranlocalMode {
        self.mode
    }

    /// Lock granted on the owning orec so far.
    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Observed snapshot version (0 before any observation).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The value this transaction sees: staged if present, otherwise the
    /// observed snapshot.
    ///
    /// # Panics
    ///
    /// Panics on a commuting tranlocal, which by design holds no value
    /// until flattened.
    #[must_use]
    pub fn value(&self) -> &T {
        match self.mode {
            TranlocalMode::Read => &self.read.as_ref().expect("read tranlocal has a snapshot").value,
            TranlocalMode::Write | TranlocalMode::Constructing => {
                self.staged.as_ref().expect("write tranlocal has a staged value")
            }
            TranlocalMode::Commuting => {
                panic!("commuting tranlocal holds no value until flattened")
            }
        }
    }

    /// Mutable access to the staged value.
    ///
    /// # Panics
    ///
    /// Panics unless the tranlocal is in write or constructing mode.
    pub fn value_mut(&mut self) -> &mut T {
        assert!(
            matches!(self.mode, TranlocalMode::Write | TranlocalMode::Constructing),
            "value_mut on a {:?} tranlocal",
            self.mode
        );
        self.staged.as_mut().expect("write tranlocal has a staged value")
    }

    /// Replace the staged value.
    ///
    /// # Panics
    ///
    /// Panics unless the tranlocal is in write or constructing mode.
    pub fn set_value(&mut self, value: T) {
        *self.value_mut() = value;
    }

    pub(crate) fn is_commuting(&self) -> bool {
        self.mode == TranlocalMode::Commuting
    }

    pub(crate) fn has_depart_obligation(&self) -> bool {
        self.depart_obligation
    }

    pub(crate) fn set_check_conflict(&mut self) {
        self.check_conflict = true;
    }

    // --- transitions -------------------------------------------------------

    /// Read -> Write in place, staging a copy of the observed value.
    pub(crate) fn upgrade_to_write(&mut self) {
        debug_assert_eq!(self.mode, TranlocalMode::Read);
        let observed = self.read.as_ref().expect("read tranlocal has a snapshot");
        self.staged = Some(observed.value.clone());
        self.mode = TranlocalMode::Write;
    }

    /// Queue one more commuting function.
    pub(crate) fn push_commute(&mut self, function: CommuteFn<T>) {
        debug_assert_eq!(self.mode, TranlocalMode::Commuting);
        self.pending.push(function);
    }

    /// Apply a commuting function right now to the staged value.
    pub(crate) fn apply_commute_now(&mut self, function: &CommuteFn<T>) {
        let staged = self.value_mut();
        *staged = function(staged);
    }

    /// Commuting -> Write: adopt a freshly loaded snapshot and apply the
    /// queued functions to it in FIFO order.
    pub(crate) fn flatten(&mut self, loaded: LoadedRead<T>) {
        debug_assert_eq!(self.mode, TranlocalMode::Commuting);
        let mut value = loaded.snapshot.value.clone();
        for function in &self.pending {
            value = function(&value);
        }
        self.pending.clear();
        self.version = loaded.snapshot.version;
        self.read = Some(loaded.snapshot);
        self.staged = Some(value);
        self.lock_mode = self.lock_mode.max(loaded.granted);
        self.depart_obligation = self.depart_obligation || loaded.depart_obligation;
        self.mode = TranlocalMode::Write;
    }

    /// Compute (and cache) dirtiness. With dirty checking disabled every
    /// write counts as dirty.
    pub(crate) fn calculate_is_dirty(&mut self, dirty_check: bool) -> bool {
        if self.dirty {
            return true;
        }
        if !dirty_check {
            self.dirty = true;
            return true;
        }
        if self.mode == TranlocalMode::Write {
            let observed = self.read.as_ref().expect("write tranlocal has a snapshot");
            let staged = self.staged.as_ref().expect("write tranlocal has a staged value");
            self.dirty = *staged != observed.value;
        }
        self.dirty
    }

    /// Acquire at least `desired` on the owning orec and verify the
    /// observed snapshot is still current. On a `false` return any
    /// freshly acquired lock is recorded on the tranlocal so the abort
    /// path releases it.
    pub(crate) fn try_lock_and_check_conflict(&mut self, spin_count: u32, desired: LockMode) -> bool {
        if self.lock_mode >= desired {
            return true;
        }

        let orec = self.owner.orec();
        if self.lock_mode == LockMode::None {
            if self.depart_obligation {
                if !orec.try_lock_after_arrive(spin_count, desired) {
                    return false;
                }
            } else {
                // No registered interest yet (read-biased or untracked):
                // the lock brings its own arrive.
                match orec.try_lock_and_arrive(spin_count, desired) {
                    s if !s.is_success() => return false,
                    s => self.depart_obligation = s == vstm_types::ArriveStatus::Registered,
                }
            }
        } else if !orec.try_upgrade_lock(spin_count, self.lock_mode, desired) {
            return false;
        }
        self.lock_mode = desired;

        self.owner.current_version() == self.version
    }

    /// Release read interest (and any lock) after a commit that did not
    /// publish this tranlocal.
    fn release_read_interest(&mut self) {
        let orec = self.owner.orec();
        if self.lock_mode != LockMode::None {
            if self.depart_obligation {
                if orec.depart_after_reading_and_release_lock(self.lock_mode) {
                    orec.unlock_after_becoming_read_biased();
                }
            } else {
                // Read-biased: locked without registered interest.
                orec.release_lock_only(self.lock_mode);
            }
        } else if self.depart_obligation {
            if orec.depart_after_reading() {
                orec.unlock_after_becoming_read_biased();
            }
        }
        self.depart_obligation = false;
        self.lock_mode = LockMode::None;
    }
}

impl<T: StmValue> std::fmt::Debug for Tranlocal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tranlocal")
            .field("ref", &self.owner.id())
            .field("mode", &self.mode)
            .field("version", &self.version)
            .field("lock_mode", &self.lock_mode)
            .field("dirty", &self.dirty)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TranlocalDyn
// ---------------------------------------------------------------------------

/// The value-type-erased face of a tranlocal, driven by the transaction
/// state machine. The transaction owns the protocol; the concrete
/// `Tranlocal<T>` owns the value representation.
pub(crate) trait TranlocalDyn: Send {
    fn ref_id(&self) -> RefId;

    fn mode(&self) -> TranlocalMode;

    /// Is the observed snapshot still the committed one?
    fn has_read_conflict(&self) -> bool;

    /// Prepare for commit: privatization checks for clean reads, commit
    /// locks for dirty writes, flattening for commuting entries. `false`
    /// reports an unresolvable conflict.
    fn prepare(&mut self, spin_count: u32, dirty_check: bool) -> bool;

    /// Publish if dirty, release read interest otherwise. Returns the
    /// harvested listener chain of a published update.
    fn commit(&mut self, global: &GlobalConflictCounter, dirty_check: bool)
        -> Option<ListenerChain>;

    /// Undo all orec bookkeeping on the abort path.
    fn abort_release(&mut self);

    /// Register a retry latch for the next change to this reference.
    fn register_change_listener(&mut self, latch: &Arc<Latch>, era: u64) -> RegistrationStatus;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: StmValue> TranlocalDyn for Tranlocal<T> {
    fn ref_id(&self) -> RefId {
        self.owner.id()
    }

    fn mode(&self) -> TranlocalMode {
        self.mode
    }

    fn has_read_conflict(&self) -> bool {
        match self.mode {
            // Nothing observed, nothing to invalidate.
            TranlocalMode::Constructing => false,
            TranlocalMode::Commuting => false,
            TranlocalMode::Read | TranlocalMode::Write => {
                if self.owner.current_version() != self.version {
                    return true;
                }
                if self.lock_mode != LockMode::None {
                    return false;
                }
                // A foreign write/commit lock means the value may be
                // replaced before we commit; treat it as conflicted.
                self.owner.orec().lock_mode() >= LockMode::Write
            }
        }
    }

    fn prepare(&mut self, spin_count: u32, dirty_check: bool) -> bool {
        match self.mode {
            TranlocalMode::Constructing => true,
            TranlocalMode::Read => {
                if !self.check_conflict || self.lock_mode != LockMode::None {
                    return true;
                }
                self.try_lock_and_check_conflict(spin_count, LockMode::Write)
            }
            TranlocalMode::Commuting => {
                let Ok(loaded) = self.owner.lock_and_load(spin_count, LockMode::Commit) else {
                    return false;
                };
                self.flatten(loaded);
                true
            }
            TranlocalMode::Write => {
                if !self.calculate_is_dirty(dirty_check) {
                    if !self.check_conflict || self.lock_mode != LockMode::None {
                        return true;
                    }
                    return self.try_lock_and_check_conflict(spin_count, LockMode::Write);
                }
                if self.lock_mode == LockMode::Commit {
                    return true;
                }
                self.try_lock_and_check_conflict(spin_count, LockMode::Commit)
            }
        }
    }

    fn commit(
        &mut self,
        global: &GlobalConflictCounter,
        dirty_check: bool,
    ) -> Option<ListenerChain> {
        match self.mode {
            TranlocalMode::Constructing => {
                let value = self.staged.take().expect("constructing tranlocal has a value");
                Some(self.owner.publish_update(value, global))
            }
            TranlocalMode::Read => {
                self.release_read_interest();
                None
            }
            TranlocalMode::Write => {
                if self.calculate_is_dirty(dirty_check) {
                    debug_assert_eq!(
                        self.lock_mode,
                        LockMode::Commit,
                        "dirty write publishing without commit lock"
                    );
                    let value = self.staged.take().expect("write tranlocal has a staged value");
                    self.lock_mode = LockMode::None;
                    self.depart_obligation = false;
                    Some(self.owner.publish_update(value, global))
                } else {
                    self.release_read_interest();
                    None
                }
            }
            TranlocalMode::Commuting => {
                unreachable!("commuting tranlocals are flattened during prepare")
            }
        }
    }

    fn abort_release(&mut self) {
        // A constructed-but-unpublished reference stays locked forever;
        // its behavior is undefined and the lock keeps everyone out.
        if self.mode == TranlocalMode::Constructing {
            return;
        }
        let orec = self.owner.orec();
        if self.lock_mode != LockMode::None {
            orec.depart_after_failure_and_release_lock(self.lock_mode);
        } else if self.depart_obligation {
            orec.depart_after_failure();
        }
        self.lock_mode = LockMode::None;
        self.depart_obligation = false;
    }

    fn register_change_listener(&mut self, latch: &Arc<Latch>, era: u64) -> RegistrationStatus {
        if self.read.is_none() {
            // Constructing or never-flattened commuting: no committed
            // value to wait on.
            return RegistrationStatus::None;
        }
        self.owner.register_change_listener(latch, era, self.version)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
