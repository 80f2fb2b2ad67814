//! The transaction state machine.
//!
//! A [`Transaction`] orchestrates a set of tranlocals against their orecs
//! through open/commute/prepare/commit/abort/retry. Transitions are
//! strict: `Active -> {Prepared, Aborted}`, `Prepared -> {Committed,
//! Aborted}`; the terminal states thaw only through an explicit reset.
//!
//! Commit ordering: every dirty tranlocal is commit-locked during
//! `prepare`, before anything is published; publication then walks the
//! attachment set in a fixed order (so two transactions locking the same
//! set cannot livelock each other), and harvested retry latches are
//! opened only after the transaction's own locks are all released.
//!
//! Attachment storage is capacity-tiered ([`CapacityTier`]): a
//! single-slot, a linear-scanned array, or a hash-indexed map, selected
//! by configuration. Overflowing the configured tier is reported as a
//! speculative-configuration failure for the driving loop to resolve by
//! upgrading and re-running — not an error the transaction body sees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;

use crate::config::TxnConfig;
use crate::counters::{self, GlobalConflictCounter, LocalConflictCounter};
use crate::latch::{Latch, ListenerChain};
use crate::tranlocal::{CommuteFn, StmValue, Tranlocal, TranlocalDyn, TranlocalMode};
use crate::tref::TRef;

use vstm_error::{ConflictCause, SpeculativeFailure, StmError, StmResult};
use vstm_types::{CapacityTier, LockMode, RefId, RegistrationStatus, TxnStatus};

// ---------------------------------------------------------------------------
// Lifecycle listeners
// ---------------------------------------------------------------------------

/// Lifecycle event delivered to registered [`TxnListener`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnEvent {
    /// About to acquire commit locks.
    PrePrepare,
    /// Published; terminal.
    PostCommit,
    /// Rolled back; terminal.
    PostAbort,
}

/// Callback invoked at transaction lifecycle transitions.
///
/// Normal registrations are cleared by every reset; permanent ones
/// survive until a hard reset.
pub trait TxnListener: Send + Sync {
    fn notify(&self, event: TxnEvent);
}

impl<F: Fn(TxnEvent) + Send + Sync> TxnListener for F {
    fn notify(&self, event: TxnEvent) {
        self(event);
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A single-threaded view over shared transactional references.
///
/// Owned and threaded explicitly by the caller (typically an atomic-block
/// retry loop); never looked up ambiently.
pub struct Transaction {
    config: TxnConfig,
    status: TxnStatus,
    attempt: u32,
    remaining_timeout: Option<Duration>,
    abort_only: bool,
    has_reads: bool,
    has_untracked_reads: bool,
    global: &'static GlobalConflictCounter,
    local: LocalConflictCounter,
    attached: Vec<Box<dyn TranlocalDyn>>,
    /// Hash index over `attached`, maintained for the map tier only.
    index: Option<HashMap<RefId, usize>>,
    /// Holding pen for the latest untracked read (returned by reference,
    /// but not part of the read set).
    scratch: Option<Box<dyn TranlocalDyn>>,
    normal_listeners: Vec<Arc<dyn TxnListener>>,
    permanent_listeners: Vec<Arc<dyn TxnListener>>,
}

impl Transaction {
    /// A fresh active transaction on the process-wide conflict counter.
    #[must_use]
    pub fn new(config: TxnConfig) -> Self {
        Self::with_conflict_counter(config, counters::process_wide())
    }

    /// A fresh active transaction on an explicit conflict counter. All
    /// transactions touching the same references must share one counter.
    #[must_use]
    pub fn with_conflict_counter(
        config: TxnConfig,
        global: &'static GlobalConflictCounter,
    ) -> Self {
        let index = matches!(config.tier, CapacityTier::Map).then(HashMap::new);
        let remaining_timeout = config.timeout;
        Self {
            config,
            status: TxnStatus::Active,
            attempt: 1,
            remaining_timeout,
            abort_only: false,
            has_reads: false,
            has_untracked_reads: false,
            global,
            local: LocalConflictCounter::new(),
            attached: Vec::new(),
            index,
            scratch: None,
            normal_listeners: Vec::new(),
            permanent_listeners: Vec::new(),
        }
    }

    // --- accessors ---------------------------------------------------------

    /// Current state.
    #[must_use]
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Attempt number, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Blocking budget left for retry waits (`None` = unbounded).
    #[must_use]
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    /// Charge blocked time against the budget. The driving loop calls
    /// this with what the latch wait returned.
    pub fn set_remaining_timeout(&mut self, remaining: Option<Duration>) {
        self.remaining_timeout = remaining;
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Number of attached tranlocals.
    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.attached.len()
    }

    /// Whether this transaction is poisoned to abort at prepare time.
    #[must_use]
    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    /// Poison the transaction: it can keep reading and writing, but
    /// prepare/commit will fail with a conflict.
    pub fn set_abort_only(&mut self) -> StmResult<()> {
        if self.status != TxnStatus::Active {
            return Err(StmError::DeadTransaction {
                status: self.status,
                op: "set_abort_only",
            });
        }
        self.abort_only = true;
        Ok(())
    }

    // --- listeners ---------------------------------------------------------

    /// Register a lifecycle listener cleared by the next reset.
    pub fn register(&mut self, listener: Arc<dyn TxnListener>) -> StmResult<()> {
        if self.status != TxnStatus::Active {
            return Err(StmError::DeadTransaction {
                status: self.status,
                op: "register",
            });
        }
        self.normal_listeners.push(listener);
        Ok(())
    }

    /// Register a lifecycle listener that survives soft resets.
    pub fn register_permanent(&mut self, listener: Arc<dyn TxnListener>) -> StmResult<()> {
        if self.status != TxnStatus::Active {
            return Err(StmError::DeadTransaction {
                status: self.status,
                op: "register_permanent",
            });
        }
        self.permanent_listeners.push(listener);
        Ok(())
    }

    fn notify_listeners(&self, event: TxnEvent) {
        for listener in &self.permanent_listeners {
            listener.notify(event);
        }
        for listener in &self.normal_listeners {
            listener.notify(event);
        }
    }

    // --- open_for_read -----------------------------------------------------

    /// Open `tref` for reading under at least `desired` (raised to the
    /// configured read-lock floor).
    pub fn open_for_read<'t, T: StmValue>(
        &'t mut self,
        tref: &TRef<T>,
        desired: LockMode,
    ) -> StmResult<&'t Tranlocal<T>> {
        self.ensure_active("open_for_read")?;
        let lock = desired.max(self.config.read_lock_mode);

        if let Some(ix) = self.index_of(tref.id()) {
            if self.attached[ix].mode() == TranlocalMode::Commuting {
                self.flatten_attached(ix, tref, lock)?;
            } else if lock > entry_of::<T>(self.attached[ix].as_ref()).lock_mode() {
                let spin = self.config.spin_count;
                let ok = entry_of_mut::<T>(self.attached[ix].as_mut())
                    .try_lock_and_check_conflict(spin, lock);
                if !ok {
                    return Err(self.abort_on_conflict(ConflictCause::LockedByOther));
                }
            }
            let ix = self.move_to_front(ix);
            return Ok(entry_of::<T>(self.attached[ix].as_ref()));
        }

        self.ensure_capacity()?;
        self.baseline_counter();

        let loaded = self.load_through(tref, lock)?;
        if self.detect_read_conflict() {
            tref.release_failed_load(&loaded);
            return Err(self.abort_on_conflict(ConflictCause::ReadSetInconsistent));
        }

        let tranlocal = tref.tranlocal_read(loaded);
        if lock != LockMode::None || self.config.track_reads || tranlocal.has_depart_obligation() {
            let ix = self.attach(Box::new(tranlocal));
            Ok(entry_of::<T>(self.attached[ix].as_ref()))
        } else {
            // Read-biased reference with tracking disabled: consistency
            // rides entirely on the conflict counter from here on.
            self.has_untracked_reads = true;
            self.scratch = Some(Box::new(tranlocal));
            let entry = self.scratch.as_ref().expect("scratch just stored");
            Ok(entry_of::<T>(entry.as_ref()))
        }
    }

    // --- open_for_write ----------------------------------------------------

    /// Open `tref` for writing under at least `desired` (raised to the
    /// configured write-lock floor), upgrading an existing read in place.
    pub fn open_for_write<'t, T: StmValue>(
        &'t mut self,
        tref: &TRef<T>,
        desired: LockMode,
    ) -> StmResult<&'t mut Tranlocal<T>> {
        self.ensure_active("open_for_write")?;
        self.ensure_writable("open_for_write")?;
        let lock = desired.max(self.config.write_lock_mode);

        if let Some(ix) = self.index_of(tref.id()) {
            if self.attached[ix].mode() == TranlocalMode::Commuting {
                self.flatten_attached(ix, tref, lock)?;
            } else {
                if lock > entry_of::<T>(self.attached[ix].as_ref()).lock_mode() {
                    let spin = self.config.spin_count;
                    let ok = entry_of_mut::<T>(self.attached[ix].as_mut())
                        .try_lock_and_check_conflict(spin, lock);
                    if !ok {
                        return Err(self.abort_on_conflict(ConflictCause::LockedByOther));
                    }
                }
                if self.attached[ix].mode() == TranlocalMode::Read {
                    entry_of_mut::<T>(self.attached[ix].as_mut()).upgrade_to_write();
                }
            }
            let ix = self.move_to_front(ix);
            return Ok(entry_of_mut::<T>(self.attached[ix].as_mut()));
        }

        self.ensure_capacity()?;
        self.baseline_counter();

        let loaded = self.load_through(tref, lock)?;
        if self.detect_read_conflict() {
            tref.release_failed_load(&loaded);
            return Err(self.abort_on_conflict(ConflictCause::ReadSetInconsistent));
        }

        let ix = self.attach(Box::new(tref.tranlocal_write(loaded)));
        Ok(entry_of_mut::<T>(self.attached[ix].as_mut()))
    }

    // --- open_for_construction --------------------------------------------

    /// Open an unborn `tref` for construction, staging `initial`.
    ///
    /// The reference carries its commit lock from allocation; nothing can
    /// conflict with a constructing transaction. Opening an
    /// already-committed reference (or one claimed by another
    /// transaction) is misuse.
    pub fn open_for_construction<'t, T: StmValue>(
        &'t mut self,
        tref: &TRef<T>,
        initial: T,
    ) -> StmResult<&'t mut Tranlocal<T>> {
        self.ensure_active("open_for_construction")?;
        self.ensure_writable("open_for_construction")?;

        if let Some(ix) = self.index_of(tref.id()) {
            if self.attached[ix].mode() != TranlocalMode::Constructing {
                self.abort_internal();
                return Err(StmError::IllegalConstruction);
            }
            let ix = self.move_to_front(ix);
            return Ok(entry_of_mut::<T>(self.attached[ix].as_mut()));
        }

        if tref.is_committed() {
            self.abort_internal();
            return Err(StmError::IllegalConstruction);
        }
        self.ensure_capacity()?;
        if !tref.claim_construction() {
            self.abort_internal();
            return Err(StmError::IllegalConstruction);
        }

        let ix = self.attach(Box::new(tref.tranlocal_constructing(initial)));
        Ok(entry_of_mut::<T>(self.attached[ix].as_mut()))
    }

    // --- commute -----------------------------------------------------------

    /// Queue `function` as a deferred, order-insensitive update to
    /// `tref`.
    ///
    /// If the reference is not yet attached, no value is loaded and no
    /// conflict can arise from this call; the functions are applied —
    /// FIFO — when a concrete value is finally demanded (a later open, or
    /// prepare). If the reference is already open, the function is
    /// applied immediately to the staged value.
    pub fn commute<T: StmValue>(
        &mut self,
        tref: &TRef<T>,
        function: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> StmResult<()> {
        self.ensure_active("commute")?;
        self.ensure_writable("commute")?;
        let function: CommuteFn<T> = Arc::new(function);

        if let Some(ix) = self.index_of(tref.id()) {
            let tranlocal = entry_of_mut::<T>(self.attached[ix].as_mut());
            match tranlocal.mode() {
                TranlocalMode::Commuting => tranlocal.push_commute(function),
                TranlocalMode::Read => {
                    tranlocal.upgrade_to_write();
                    tranlocal.apply_commute_now(&function);
                }
                TranlocalMode::Write | TranlocalMode::Constructing => {
                    tranlocal.apply_commute_now(&function);
                }
            }
            return Ok(());
        }

        self.ensure_capacity()?;
        self.attach(Box::new(tref.tranlocal_commuting(function)));
        Ok(())
    }

    /// Demand a prepare-time privatization check on an attached read.
    pub(crate) fn mark_check_conflict<T: StmValue>(&mut self, tref: &TRef<T>) {
        if let Some(ix) = self.index_of(tref.id()) {
            entry_of_mut::<T>(self.attached[ix].as_mut()).set_check_conflict();
        }
    }

    // --- prepare -----------------------------------------------------------

    /// Acquire commit locks on all dirty writes, flatten pending
    /// commutes, and run privatization checks. Idempotent once prepared.
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Prepared => return Ok(()),
            TxnStatus::Committed | TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction {
                    status: self.status,
                    op: "prepare",
                });
            }
            TxnStatus::Active => {}
        }

        self.notify_listeners(TxnEvent::PrePrepare);

        if self.abort_only {
            return Err(self.abort_on_conflict(ConflictCause::AbortOnly));
        }

        let spin = self.config.spin_count;
        let dirty_check = self.config.dirty_check;
        let mut conflicted = false;
        for entry in &mut self.attached {
            if !entry.prepare(spin, dirty_check) {
                conflicted = true;
                break;
            }
        }
        if conflicted {
            return Err(self.abort_on_conflict(ConflictCause::CommitLockFailed));
        }

        self.status = TxnStatus::Prepared;
        Ok(())
    }

    // --- commit ------------------------------------------------------------

    /// Publish all dirty writes atomically and release everything held.
    ///
    /// Prepares first if still active. Idempotent once committed.
    /// Harvested retry latches are opened only after the last own lock is
    /// released, so woken transactions never contend with this one.
    pub fn commit(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Committed => return Ok(()),
            TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction {
                    status: self.status,
                    op: "commit",
                });
            }
            TxnStatus::Active => self.prepare()?,
            TxnStatus::Prepared => {}
        }

        let dirty_check = self.config.dirty_check;
        let mut harvested: SmallVec<[ListenerChain; 4]> = SmallVec::new();
        for entry in &mut self.attached {
            if let Some(chain) = entry.commit(self.global, dirty_check) {
                harvested.push(chain);
            }
        }

        self.status = TxnStatus::Committed;
        tracing::debug!(
            attempt = self.attempt,
            attachments = self.attached.len(),
            "transaction committed"
        );

        for chain in harvested {
            chain.open_all();
        }

        self.notify_listeners(TxnEvent::PostCommit);
        Ok(())
    }

    // --- abort -------------------------------------------------------------

    /// Roll back, releasing every lock and registration held. Idempotent
    /// on an already-aborted transaction; misuse on a committed one.
    pub fn abort(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Active | TxnStatus::Prepared => {
                self.abort_internal();
                Ok(())
            }
            TxnStatus::Aborted => Ok(()),
            TxnStatus::Committed => Err(StmError::DeadTransaction {
                status: self.status,
                op: "abort",
            }),
        }
    }

    fn abort_internal(&mut self) {
        for entry in &mut self.attached {
            entry.abort_release();
        }
        self.status = TxnStatus::Aborted;
        tracing::debug!(attempt = self.attempt, "transaction aborted");
        self.notify_listeners(TxnEvent::PostAbort);
    }

    /// Abort and wrap `cause` for the driving loop.
    fn abort_on_conflict(&mut self, cause: ConflictCause) -> StmError {
        self.abort_internal();
        StmError::Conflict(cause)
    }

    // --- retry (blocking) --------------------------------------------------

    /// Signal a blocking retry: register `latch` on every tracked read,
    /// abort, and hand control back. On `Ok` the caller parks on the
    /// latch (with [`Transaction::remaining_timeout`]) and soft-resets
    /// once woken.
    pub fn retry(&mut self, latch: &Arc<Latch>) -> StmResult<()> {
        match self.status {
            TxnStatus::Active => {}
            TxnStatus::Prepared => {
                self.abort_internal();
                return Err(StmError::PreparedTransaction { op: "retry" });
            }
            TxnStatus::Committed | TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction {
                    status: self.status,
                    op: "retry",
                });
            }
        }

        if !self.config.blocking_allowed {
            self.abort_internal();
            return Err(StmError::RetryNotAllowed);
        }
        if self.attached.is_empty() {
            self.abort_internal();
            return Err(StmError::NoRetryPossible);
        }

        let era = latch.era();
        let mut further_registration_needed = true;
        let mut at_least_one = false;
        for entry in &mut self.attached {
            if further_registration_needed {
                match entry.register_change_listener(latch, era) {
                    RegistrationStatus::Done => at_least_one = true,
                    RegistrationStatus::NotNeeded => {
                        // Already changed: the latch is open, no point
                        // registering on the rest.
                        further_registration_needed = false;
                        at_least_one = true;
                    }
                    RegistrationStatus::None => {}
                }
            }
            entry.abort_release();
        }

        self.status = TxnStatus::Aborted;
        tracing::debug!(attempt = self.attempt, "transaction parked for retry");
        self.notify_listeners(TxnEvent::PostAbort);

        if at_least_one {
            Ok(())
        } else {
            Err(StmError::NoRetryPossible)
        }
    }

    // --- reset -------------------------------------------------------------

    /// Re-arm for the next attempt. Returns `false` once the attempt
    /// budget is exhausted (the loop then raises the terminal error).
    pub fn soft_reset(&mut self) -> bool {
        if self.status.is_alive() {
            self.abort_internal();
        }
        if self.attempt >= self.config.max_retries {
            return false;
        }
        self.attempt += 1;
        self.reset_working_state();
        self.normal_listeners.clear();
        true
    }

    /// Re-arm from scratch: attempt 1, timeout restored, all listeners
    /// dropped.
    pub fn hard_reset(&mut self) {
        if self.status.is_alive() {
            self.abort_internal();
        }
        self.attempt = 1;
        self.remaining_timeout = self.config.timeout;
        self.reset_working_state();
        self.normal_listeners.clear();
        self.permanent_listeners.clear();
    }

    /// Adopt a new configuration (e.g. an upgraded tier) and hard-reset.
    pub fn init(&mut self, config: TxnConfig) {
        self.config = config;
        self.index = matches!(self.config.tier, CapacityTier::Map).then(HashMap::new);
        self.hard_reset();
    }

    fn reset_working_state(&mut self) {
        self.status = TxnStatus::Active;
        self.abort_only = false;
        self.has_reads = false;
        self.has_untracked_reads = false;
        self.local = LocalConflictCounter::new();
        self.attached.clear();
        if let Some(index) = &mut self.index {
            index.clear();
        }
        self.scratch = None;
    }

    // --- internals ---------------------------------------------------------

    fn ensure_active(&mut self, op: &'static str) -> StmResult<()> {
        match self.status {
            TxnStatus::Active => Ok(()),
            TxnStatus::Prepared => {
                self.abort_internal();
                Err(StmError::PreparedTransaction { op })
            }
            TxnStatus::Committed | TxnStatus::Aborted => Err(StmError::DeadTransaction {
                status: self.status,
                op,
            }),
        }
    }

    fn ensure_writable(&mut self, op: &'static str) -> StmResult<()> {
        if self.config.readonly {
            self.abort_internal();
            return Err(StmError::Readonly { op });
        }
        Ok(())
    }

    fn ensure_capacity(&mut self) -> StmResult<()> {
        if self.attached.len() < self.config.tier.capacity() {
            return Ok(());
        }
        let required = self.attached.len() + 1;
        self.abort_internal();
        tracing::debug!(required, tier = ?self.config.tier, "capacity tier overflow");
        Err(StmError::SpeculativeConfig(SpeculativeFailure { required }))
    }

    /// Baseline the local conflict counter at the latest possible moment:
    /// right before the first read, so no commit slips between baseline
    /// and load.
    fn baseline_counter(&mut self) {
        if !self.has_reads {
            self.local.reset(self.global);
            self.has_reads = true;
        }
    }

    fn load_through<T: StmValue>(
        &mut self,
        tref: &TRef<T>,
        lock: LockMode,
    ) -> StmResult<crate::tref::LoadedRead<T>> {
        let spin = self.config.spin_count;
        let result = if lock == LockMode::None {
            tref.load(spin)
        } else {
            tref.lock_and_load(spin, lock)
        };
        result.map_err(|cause| self.abort_on_conflict(cause))
    }

    /// The cheap-then-thorough read-consistency check.
    ///
    /// Pessimistic (lock-floored) reads skip it: the lock already
    /// excludes the writes it would detect. Untracked reads force the
    /// conservative counter-only answer.
    fn detect_read_conflict(&mut self) -> bool {
        if self.config.read_lock_mode >= LockMode::Read {
            return false;
        }
        if self.has_untracked_reads {
            return self.local.sync_and_check_conflict(self.global);
        }
        if self.attached.is_empty() {
            return false;
        }
        if !self.local.sync_and_check_conflict(self.global) {
            return false;
        }
        self.attached.iter().any(|entry| entry.has_read_conflict())
    }

    fn flatten_attached<T: StmValue>(
        &mut self,
        ix: usize,
        tref: &TRef<T>,
        lock: LockMode,
    ) -> StmResult<()> {
        self.baseline_counter();
        let loaded = self.load_through(tref, lock)?;
        if self.detect_read_conflict() {
            tref.release_failed_load(&loaded);
            return Err(self.abort_on_conflict(ConflictCause::ReadSetInconsistent));
        }
        entry_of_mut::<T>(self.attached[ix].as_mut()).flatten(loaded);
        Ok(())
    }

    fn index_of(&self, id: RefId) -> Option<usize> {
        if let Some(index) = &self.index {
            index.get(&id).copied()
        } else {
            self.attached.iter().position(|entry| entry.ref_id() == id)
        }
    }

    fn attach(&mut self, entry: Box<dyn TranlocalDyn>) -> usize {
        let ix = self.attached.len();
        if let Some(index) = &mut self.index {
            index.insert(entry.ref_id(), ix);
        }
        self.attached.push(entry);
        ix
    }

    /// Linear-scan tiers shift a hit toward the front so hot references
    /// are found faster next time. The map tier keeps positions stable.
    fn move_to_front(&mut self, ix: usize) -> usize {
        if self.index.is_none() && ix > 0 {
            self.attached.swap(0, ix);
            0
        } else {
            ix
        }
    }
}

impl Drop for Transaction {
    /// A transaction abandoned mid-flight still releases everything it
    /// holds.
    fn drop(&mut self) {
        if self.status.is_alive() {
            self.abort_internal();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("attachments", &self.attached.len())
            .field("abort_only", &self.abort_only)
            .finish_non_exhaustive()
    }
}

fn entry_of<T: StmValue>(entry: &dyn TranlocalDyn) -> &Tranlocal<T> {
    entry
        .as_any()
        .downcast_ref::<Tranlocal<T>>()
        .expect("tranlocal value type mismatch")
}

fn entry_of_mut<T: StmValue>(entry: &mut dyn TranlocalDyn) -> &mut Tranlocal<T> {
    entry
        .as_any_mut()
        .downcast_mut::<Tranlocal<T>>()
        .expect("tranlocal value type mismatch")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::config::TxnConfig;
    use crate::counters::GlobalConflictCounter;
    use crate::latch::Latch;
    use crate::tranlocal::TranlocalMode;
    use crate::tref::TRef;

    use vstm_error::{ConflictCause, StmError};
    use vstm_types::{CapacityTier, LockMode, TxnStatus};

    use super::{Transaction, TxnEvent, TxnListener};

    /// Counter shared by the transactions of one test, isolated from the
    /// process-wide one so unrelated test threads can't perturb the
    /// untracked-read paths.
    fn isolated() -> &'static GlobalConflictCounter {
        Box::leak(Box::new(GlobalConflictCounter::new()))
    }

    fn txn() -> Transaction {
        Transaction::new(TxnConfig::default())
    }

    // -----------------------------------------------------------------------
    // open_for_read
    // -----------------------------------------------------------------------

    #[test]
    fn read_observes_committed_value() {
        let tref = TRef::new(41_i64);
        let mut txn = txn();
        let value = tref.get(&mut txn).expect("get");
        assert_eq!(value, 41);
        assert_eq!(txn.attachment_count(), 1);
        txn.commit().expect("commit");
    }

    #[test]
    fn default_read_never_takes_a_lock() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        let _ = tref.get(&mut txn).expect("get");
        // Readers must not block writers.
        assert_eq!(tref.orec().lock_mode(), LockMode::None);
        txn.commit().expect("commit");
        assert_eq!(tref.orec().lock_mode(), LockMode::None);
    }

    #[test]
    fn repeated_read_reuses_the_tranlocal() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        let _ = tref.get(&mut txn).expect("first");
        let _ = tref.get(&mut txn).expect("second");
        assert_eq!(txn.attachment_count(), 1);
        txn.commit().expect("commit");
    }

    #[test]
    fn read_on_dead_transaction_is_misuse() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        txn.abort().expect("abort");
        let err = tref.get(&mut txn).unwrap_err();
        assert!(matches!(err, StmError::DeadTransaction { .. }));
    }

    #[test]
    fn read_fails_against_foreign_commit_lock() {
        let tref = TRef::new(1_i64);
        assert!(tref.orec().try_lock_and_arrive(8, LockMode::Commit).is_success());

        let mut txn = Transaction::new(TxnConfig::default().with_spin_count(2));
        let err = tref.get(&mut txn).unwrap_err();
        assert_eq!(err, StmError::Conflict(ConflictCause::LockedByOther));
        assert_eq!(txn.status(), TxnStatus::Aborted);
    }

    // -----------------------------------------------------------------------
    // open_for_write / commit
    // -----------------------------------------------------------------------

    #[test]
    fn write_commit_read_round_trip() {
        let tref = TRef::new(0_i64);

        let mut t1 = txn();
        tref.set(&mut t1, 7).expect("set");
        t1.commit().expect("commit");

        let mut t2 = txn();
        assert_eq!(tref.get(&mut t2).expect("get"), 7);
        t2.commit().expect("commit");
    }

    #[test]
    fn two_updates_advance_version_by_exactly_two() {
        let tref = TRef::new(0_i64);
        let v0 = tref.version();

        let mut t1 = txn();
        tref.set(&mut t1, 1).expect("set 1");
        t1.commit().expect("commit 1");

        let mut t2 = txn();
        let incremented = tref.update(&mut t2, |v| v + 1).expect("increment");
        assert_eq!(incremented, 2);
        t2.commit().expect("commit 2");

        assert_eq!(tref.atomic_get(), 2);
        assert_eq!(tref.version(), v0 + 2);
    }

    #[test]
    fn read_upgrades_to_write_in_place() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        let _ = tref.get(&mut txn).expect("read");
        let tranlocal = txn.open_for_write(&tref, LockMode::None).expect("write");
        assert_eq!(tranlocal.mode(), TranlocalMode::Write);
        tranlocal.set_value(2);
        assert_eq!(txn.attachment_count(), 1);
        txn.commit().expect("commit");
        assert_eq!(tref.atomic_get(), 2);
    }

    #[test]
    fn write_on_readonly_transaction_aborts() {
        let tref = TRef::new(1_i64);
        let mut txn = Transaction::new(TxnConfig::default().with_readonly(true));
        let err = tref.set(&mut txn, 2).unwrap_err();
        assert!(matches!(err, StmError::Readonly { .. }));
        assert_eq!(txn.status(), TxnStatus::Aborted);
    }

    #[test]
    fn clean_write_does_not_publish_under_dirty_check() {
        let tref = TRef::new(5_i64);
        let v0 = tref.version();

        let mut txn = txn();
        tref.set(&mut txn, 5).expect("identical value");
        txn.commit().expect("commit");

        assert_eq!(tref.version(), v0, "clean write must not bump the version");
    }

    #[test]
    fn clean_write_publishes_with_dirty_check_disabled() {
        let tref = TRef::new(5_i64);
        let v0 = tref.version();

        let mut txn = Transaction::new(TxnConfig::default().with_dirty_check(false));
        tref.set(&mut txn, 5).expect("identical value");
        txn.commit().expect("commit");

        assert_eq!(tref.version(), v0 + 1);
    }

    #[test]
    fn stale_write_set_fails_at_prepare() {
        let tref = TRef::new(0_i64);

        let mut t1 = txn();
        let _ = tref.get(&mut t1).expect("t1 read");

        let mut t2 = txn();
        tref.set(&mut t2, 9).expect("t2 write");
        t2.commit().expect("t2 commit");

        // t1 now stages a write over a stale snapshot; prepare detects it.
        let err = match t1.open_for_write(&tref, LockMode::None) {
            // The open may already notice the moved version via the
            // conflict counter scan.
            Err(err) => err,
            Ok(tranlocal) => {
                tranlocal.set_value(1);
                t1.commit().unwrap_err()
            }
        };
        assert!(matches!(err, StmError::Conflict(_)), "got {err}");
        assert_eq!(tref.atomic_get(), 9);
    }

    #[test]
    fn read_set_inconsistency_detected_on_next_open() {
        let global = isolated();
        let a = TRef::new(0_i64);
        let b = TRef::new(0_i64);

        let mut t1 = Transaction::with_conflict_counter(TxnConfig::default(), global);
        let _ = a.get(&mut t1).expect("t1 reads a");

        // A concurrent commit to `a` while t1 still depends on it.
        let mut t2 = Transaction::with_conflict_counter(TxnConfig::default(), global);
        a.set(&mut t2, 1).expect("t2 writes a");
        t2.commit().expect("t2 commits");

        let err = b.get(&mut t1).unwrap_err();
        assert_eq!(err, StmError::Conflict(ConflictCause::ReadSetInconsistent));
        assert_eq!(t1.status(), TxnStatus::Aborted);
    }

    #[test]
    fn unrelated_commit_does_not_abort_tracked_reader() {
        let global = isolated();
        let a = TRef::new(0_i64);
        let b = TRef::new(0_i64);
        let c = TRef::new(0_i64);

        let mut t1 = Transaction::with_conflict_counter(TxnConfig::default(), global);
        let _ = a.get(&mut t1).expect("t1 reads a");

        // A commit to an unrelated reference is either globally free (no
        // other reader was interested) or triggers a scan that finds
        // every tracked version intact.
        let mut t2 = Transaction::with_conflict_counter(TxnConfig::default(), global);
        c.set(&mut t2, 1).expect("t2 writes c");
        t2.commit().expect("t2 commits");

        let _ = b.get(&mut t1).expect("t1 reads b despite counter movement");
        t1.commit().expect("t1 commits");
    }

    // -----------------------------------------------------------------------
    // pessimistic lock floors
    // -----------------------------------------------------------------------

    #[test]
    fn commit_locked_write_floor_excludes_readers() {
        let tref = TRef::new(1_i64);

        let mut writer = Transaction::new(
            TxnConfig::default().with_write_lock_mode(LockMode::Commit),
        );
        tref.set(&mut writer, 2).expect("locked write");
        assert_eq!(tref.orec().lock_mode(), LockMode::Commit);

        let mut reader = Transaction::new(TxnConfig::default().with_spin_count(2));
        let err = tref.get(&mut reader).unwrap_err();
        assert_eq!(err, StmError::Conflict(ConflictCause::LockedByOther));

        writer.commit().expect("commit");
        assert_eq!(tref.atomic_get(), 2);
    }

    #[test]
    fn write_locked_floor_admits_readers_but_blocks_writers() {
        let tref = TRef::new(1_i64);

        let mut writer =
            Transaction::new(TxnConfig::default().with_write_lock_mode(LockMode::Write));
        tref.set(&mut writer, 2).expect("locked write");
        assert_eq!(tref.orec().lock_mode(), LockMode::Write);

        // A plain read still gets through (arrive is admitted).
        let mut reader = txn();
        assert_eq!(tref.get(&mut reader).expect("read"), 1);
        reader.commit().expect("reader commit");

        // A second locking writer does not.
        let mut other =
            Transaction::new(TxnConfig::default().with_write_lock_mode(LockMode::Write).with_spin_count(2));
        let err = tref.set(&mut other, 3).unwrap_err();
        assert_eq!(err, StmError::Conflict(ConflictCause::LockedByOther));

        writer.commit().expect("writer commit");
        assert_eq!(tref.atomic_get(), 2);
    }

    // -----------------------------------------------------------------------
    // construction
    // -----------------------------------------------------------------------

    #[test]
    fn construction_publishes_first_version() {
        let tref: TRef<i64> = TRef::new_unborn();
        let mut txn = txn();
        let tranlocal = txn.open_for_construction(&tref, 10).expect("construct");
        assert_eq!(tranlocal.mode(), TranlocalMode::Constructing);
        *tranlocal.value_mut() += 1;
        txn.commit().expect("commit");

        assert_eq!(tref.atomic_get(), 11);
        assert_eq!(tref.version(), 1);
        assert_eq!(tref.orec().lock_mode(), LockMode::None);
    }

    #[test]
    fn construction_on_committed_ref_is_misuse() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        let err = txn.open_for_construction(&tref, 2).unwrap_err();
        assert_eq!(err, StmError::IllegalConstruction);
        assert_eq!(txn.status(), TxnStatus::Aborted);
    }

    #[test]
    fn aborted_construction_leaves_the_ref_dead() {
        let tref: TRef<i64> = TRef::new_unborn();
        let mut txn = txn();
        let _ = txn.open_for_construction(&tref, 10).expect("construct");
        txn.abort().expect("abort");

        // Undefined object: permanently commit-locked, every access conflicts.
        let mut other = Transaction::new(TxnConfig::default().with_spin_count(2));
        assert!(tref.get(&mut other).is_err());
    }

    #[test]
    fn second_transaction_cannot_claim_construction() {
        let tref: TRef<i64> = TRef::new_unborn();
        let mut t1 = txn();
        let _ = t1.open_for_construction(&tref, 1).expect("t1 claims");

        let mut t2 = txn();
        let err = t2.open_for_construction(&tref, 2).unwrap_err();
        assert_eq!(err, StmError::IllegalConstruction);
        t1.commit().expect("t1 commit");
        assert_eq!(tref.atomic_get(), 1);
    }

    // -----------------------------------------------------------------------
    // commute
    // -----------------------------------------------------------------------

    #[test]
    fn commute_defers_and_applies_at_commit() {
        let tref = TRef::new(10_i64);
        let mut txn = txn();
        tref.commute(&mut txn, |v| v + 5).expect("commute");
        // Nothing loaded, nothing observed.
        assert_eq!(txn.attachment_count(), 1);
        txn.commit().expect("commit");
        assert_eq!(tref.atomic_get(), 15);
    }

    #[test]
    fn interleaved_commutes_do_not_conflict() {
        let tref = TRef::new(0_i64);

        let mut t1 = txn();
        let mut t2 = txn();
        tref.commute(&mut t1, |v| v + 1).expect("t1 commute");
        tref.commute(&mut t2, |v| v + 1).expect("t2 commute");

        t1.commit().expect("t1 commit");
        t2.commit().expect("t2 commit");

        assert_eq!(tref.atomic_get(), 2);
    }

    #[test]
    fn commute_functions_flatten_in_fifo_order() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        tref.commute(&mut txn, |v| v * 10).expect("times ten");
        tref.commute(&mut txn, |v| v + 1).expect("plus one");

        // Demanding the value flattens: (1 * 10) + 1, not (1 + 1) * 10.
        assert_eq!(tref.get(&mut txn).expect("flattened read"), 11);
        txn.commit().expect("commit");
        assert_eq!(tref.atomic_get(), 11);
    }

    #[test]
    fn commute_on_open_write_applies_immediately() {
        let tref = TRef::new(2_i64);
        let mut txn = txn();
        tref.set(&mut txn, 3).expect("write");
        tref.commute(&mut txn, |v| v * 2).expect("commute");
        assert_eq!(tref.get(&mut txn).expect("read"), 6);
        txn.commit().expect("commit");
        assert_eq!(tref.atomic_get(), 6);
    }

    #[test]
    fn commute_sees_concurrent_commits_at_flatten_time() {
        let tref = TRef::new(0_i64);

        let mut t1 = txn();
        tref.commute(&mut t1, |v| v + 1).expect("t1 commute");

        // A full write commits in between; the commute must apply on top.
        let mut t2 = txn();
        tref.set(&mut t2, 100).expect("t2 write");
        t2.commit().expect("t2 commit");

        t1.commit().expect("t1 commit");
        assert_eq!(tref.atomic_get(), 101);
    }

    // -----------------------------------------------------------------------
    // state machine edges
    // -----------------------------------------------------------------------

    #[test]
    fn prepare_then_commit() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        tref.set(&mut txn, 2).expect("write");
        txn.prepare().expect("prepare");
        assert_eq!(txn.status(), TxnStatus::Prepared);
        assert_eq!(tref.orec().lock_mode(), LockMode::Commit);

        // Idempotent while prepared.
        txn.prepare().expect("prepare again");

        txn.commit().expect("commit");
        assert_eq!(tref.atomic_get(), 2);
        assert_eq!(tref.orec().lock_mode(), LockMode::None);
    }

    #[test]
    fn open_after_prepare_aborts_with_prepared_error() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        tref.set(&mut txn, 2).expect("write");
        txn.prepare().expect("prepare");

        let err = tref.set(&mut txn, 3).unwrap_err();
        assert!(matches!(err, StmError::PreparedTransaction { .. }));
        assert_eq!(txn.status(), TxnStatus::Aborted);
        // The prepared lock was released by the abort.
        assert_eq!(tref.orec().lock_mode(), LockMode::None);
        assert_eq!(tref.atomic_get(), 1);
    }

    #[test]
    fn commit_is_idempotent() {
        let tref = TRef::new(1_i64);
        let v0 = tref.version();
        let mut txn = txn();
        tref.set(&mut txn, 2).expect("write");
        txn.commit().expect("commit");
        txn.commit().expect("second commit is a no-op");
        assert_eq!(tref.version(), v0 + 1);
    }

    #[test]
    fn abort_is_idempotent_but_commit_after_abort_is_not() {
        let mut txn = txn();
        txn.abort().expect("abort");
        txn.abort().expect("second abort is a no-op");
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, StmError::DeadTransaction { .. }));
    }

    #[test]
    fn abort_after_commit_is_misuse() {
        let mut txn = txn();
        txn.commit().expect("empty commit");
        let err = txn.abort().unwrap_err();
        assert!(matches!(err, StmError::DeadTransaction { .. }));
    }

    #[test]
    fn abort_discards_staged_writes() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        tref.set(&mut txn, 99).expect("write");
        txn.abort().expect("abort");
        assert_eq!(tref.atomic_get(), 1);
        assert_eq!(tref.orec().surplus(), 0);
    }

    #[test]
    fn abort_only_poisons_prepare() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        tref.set(&mut txn, 2).expect("write");
        txn.set_abort_only().expect("poison");

        let err = txn.commit().unwrap_err();
        assert_eq!(err, StmError::Conflict(ConflictCause::AbortOnly));
        assert_eq!(tref.atomic_get(), 1);
    }

    #[test]
    fn dropped_transaction_releases_its_locks() {
        let tref = TRef::new(1_i64);
        {
            let mut txn =
                Transaction::new(TxnConfig::default().with_write_lock_mode(LockMode::Commit));
            tref.set(&mut txn, 2).expect("locked write");
            assert_eq!(tref.orec().lock_mode(), LockMode::Commit);
            // Dropped without commit or abort.
        }
        assert_eq!(tref.orec().lock_mode(), LockMode::None);
        assert_eq!(tref.atomic_get(), 1);
    }

    // -----------------------------------------------------------------------
    // capacity tiers / speculative configuration
    // -----------------------------------------------------------------------

    #[test]
    fn single_tier_overflows_into_speculative_failure() {
        let a = TRef::new(1_i64);
        let b = TRef::new(2_i64);

        let mut txn = Transaction::new(TxnConfig::default().with_tier(CapacityTier::Single));
        let _ = a.get(&mut txn).expect("first ref fits");
        let err = b.get(&mut txn).unwrap_err();
        let StmError::SpeculativeConfig(failure) = err else {
            panic!("expected speculative failure, got {err}");
        };
        assert_eq!(failure.required, 2);
        assert_eq!(txn.status(), TxnStatus::Aborted);
    }

    #[test]
    fn driving_loop_upgrades_tier_and_succeeds() {
        let a = TRef::new(1_i64);
        let b = TRef::new(2_i64);

        let mut config = TxnConfig::default().with_tier(CapacityTier::Single);
        let mut txn = Transaction::new(config.clone());
        let sum = loop {
            let attempt = (|txn: &mut Transaction| -> Result<i64, StmError> {
                Ok(a.get(txn)? + b.get(txn)?)
            })(&mut txn);
            match attempt {
                Ok(sum) => {
                    txn.commit().expect("commit");
                    break sum;
                }
                Err(StmError::SpeculativeConfig(failure)) => {
                    let upgraded = config.tier.upgraded_for(failure.required);
                    config = config.with_tier(upgraded);
                    txn.init(config.clone());
                }
                Err(err) => panic!("unexpected {err}"),
            }
        };
        assert_eq!(sum, 3);
    }

    #[test]
    fn map_tier_handles_many_refs() {
        let refs: Vec<TRef<i64>> = (0..100).map(TRef::new).collect();
        let mut txn = Transaction::new(TxnConfig::default().with_tier(CapacityTier::Map));
        let mut sum = 0;
        for tref in &refs {
            sum += tref.get(&mut txn).expect("read");
        }
        assert_eq!(sum, (0..100).sum::<i64>());
        assert_eq!(txn.attachment_count(), 100);
        txn.commit().expect("commit");
    }

    #[test]
    fn array_tier_lookup_survives_move_to_front() {
        let refs: Vec<TRef<i64>> = (0..4).map(TRef::new).collect();
        let mut txn = Transaction::new(TxnConfig::default().with_tier(CapacityTier::Array(8)));
        for tref in &refs {
            let _ = tref.get(&mut txn).expect("read");
        }
        // Re-open in reverse order; each hit shifts to the front and the
        // values must still line up per reference.
        for (expected, tref) in refs.iter().enumerate().rev() {
            let value = tref.get(&mut txn).expect("re-read");
            assert_eq!(value, i64::try_from(expected).expect("fits"));
        }
        assert_eq!(txn.attachment_count(), 4);
        txn.commit().expect("commit");
    }

    // -----------------------------------------------------------------------
    // retry / blocking
    // -----------------------------------------------------------------------

    #[test]
    fn retry_without_tracked_reads_is_rejected() {
        let latch = Arc::new(Latch::new());
        let mut txn = txn();
        let err = txn.retry(&latch).unwrap_err();
        assert_eq!(err, StmError::NoRetryPossible);
        assert_eq!(txn.status(), TxnStatus::Aborted);
    }

    #[test]
    fn retry_with_blocking_disabled_is_rejected() {
        let tref = TRef::new(1_i64);
        let latch = Arc::new(Latch::new());
        let mut txn = Transaction::new(TxnConfig::default().with_blocking_allowed(false));
        let _ = tref.get(&mut txn).expect("read");
        let err = txn.retry(&latch).unwrap_err();
        assert_eq!(err, StmError::RetryNotAllowed);
    }

    #[test]
    fn retry_registers_and_next_commit_wakes() {
        let tref = TRef::new(0_i64);
        let latch = Arc::new(Latch::new());

        let mut waiter = txn();
        let _ = tref.get(&mut waiter).expect("read");
        waiter.retry(&latch).expect("retry registered");
        assert_eq!(waiter.status(), TxnStatus::Aborted);
        assert!(!latch.is_open());

        let mut writer = txn();
        tref.set(&mut writer, 1).expect("write");
        writer.commit().expect("commit");

        assert!(latch.is_open(), "committing write must wake the waiter");
    }

    #[test]
    fn unrelated_commit_does_not_wake_retrying_transaction() {
        let watched = TRef::new(0_i64);
        let unrelated = TRef::new(0_i64);
        let latch = Arc::new(Latch::new());

        let mut waiter = txn();
        let _ = watched.get(&mut waiter).expect("read");
        waiter.retry(&latch).expect("retry registered");

        let mut writer = txn();
        unrelated.set(&mut writer, 1).expect("write");
        writer.commit().expect("commit");

        assert!(!latch.is_open(), "unrelated commit must not wake the waiter");
    }

    #[test]
    fn retry_after_missed_update_opens_immediately() {
        let tref = TRef::new(0_i64);
        let latch = Arc::new(Latch::new());

        let mut waiter = txn();
        let _ = tref.get(&mut waiter).expect("read");

        // The update lands between the read and the retry; registration
        // must not miss it.
        let mut writer = txn();
        tref.set(&mut writer, 1).expect("write");
        writer.commit().expect("commit");

        waiter.retry(&latch).expect("retry registered");
        assert!(latch.is_open(), "advanced era must open the latch immediately");
    }

    // -----------------------------------------------------------------------
    // ensure (privatization)
    // -----------------------------------------------------------------------

    #[test]
    fn ensure_fails_prepare_when_read_is_overwritten() {
        let tref = TRef::new(0_i64);

        let mut t1 = txn();
        tref.ensure(&mut t1).expect("tracked + ensured read");

        let mut t2 = txn();
        tref.set(&mut t2, 1).expect("overwrite");
        t2.commit().expect("t2 commit");

        let err = t1.commit().unwrap_err();
        assert!(matches!(err, StmError::Conflict(_)));
    }

    #[test]
    fn plain_read_does_not_validate_at_prepare() {
        let tref = TRef::new(0_i64);

        let mut t1 = txn();
        let _ = tref.get(&mut t1).expect("plain read");

        let mut t2 = txn();
        tref.set(&mut t2, 1).expect("overwrite");
        t2.commit().expect("t2 commit");

        // Read-only transactions publish nothing; a stale read-set is
        // acceptable at commit unless explicitly ensured.
        t1.commit().expect("t1 read-only commit");
    }

    // -----------------------------------------------------------------------
    // resets / listeners
    // -----------------------------------------------------------------------

    #[test]
    fn soft_reset_increments_attempt_and_clears_state() {
        let tref = TRef::new(1_i64);
        let mut txn = txn();
        let _ = tref.get(&mut txn).expect("read");
        assert!(txn.soft_reset());
        assert_eq!(txn.status(), TxnStatus::Active);
        assert_eq!(txn.attempt(), 2);
        assert_eq!(txn.attachment_count(), 0);
        assert_eq!(tref.orec().surplus(), 0, "reset releases registered interest");
    }

    #[test]
    fn soft_reset_honors_the_attempt_budget() {
        let mut txn = Transaction::new(TxnConfig::default().with_max_retries(2));
        assert!(txn.soft_reset());
        assert!(!txn.soft_reset(), "attempt budget exhausted");
    }

    #[test]
    fn hard_reset_restores_attempt_and_timeout() {
        let timeout = Some(std::time::Duration::from_secs(1));
        let mut txn = Transaction::new(TxnConfig::default().with_timeout(timeout));
        txn.set_remaining_timeout(Some(std::time::Duration::from_millis(1)));
        assert!(txn.soft_reset());
        assert!(txn.soft_reset());

        txn.hard_reset();
        assert_eq!(txn.attempt(), 1);
        assert_eq!(txn.remaining_timeout(), timeout);
    }

    #[test]
    fn lifecycle_listeners_fire_in_order() {
        #[derive(Default)]
        struct Recorder(std::sync::Mutex<Vec<TxnEvent>>);
        impl TxnListener for Recorder {
            fn notify(&self, event: TxnEvent) {
                self.0.lock().expect("recorder lock").push(event);
            }
        }

        let recorder = Arc::new(Recorder::default());
        let tref = TRef::new(1_i64);

        let mut txn = txn();
        txn.register(Arc::clone(&recorder) as Arc<dyn TxnListener>)
            .expect("register");
        tref.set(&mut txn, 2).expect("write");
        txn.commit().expect("commit");

        let events = recorder.0.lock().expect("recorder lock").clone();
        assert_eq!(events, vec![TxnEvent::PrePrepare, TxnEvent::PostCommit]);
    }

    #[test]
    fn normal_listeners_are_cleared_by_soft_reset_permanent_survive() {
        let normal_hits = Arc::new(AtomicUsize::new(0));
        let permanent_hits = Arc::new(AtomicUsize::new(0));

        let mut txn = txn();
        {
            let hits = Arc::clone(&normal_hits);
            txn.register(Arc::new(move |event| {
                if event == TxnEvent::PostAbort {
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }))
            .expect("register normal");
        }
        {
            let hits = Arc::clone(&permanent_hits);
            txn.register_permanent(Arc::new(move |event| {
                if event == TxnEvent::PostAbort {
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }))
            .expect("register permanent");
        }

        assert!(txn.soft_reset()); // aborts: both fire
        txn.abort().expect("abort again: only permanent fires");

        assert_eq!(normal_hits.load(Ordering::Relaxed), 1);
        assert_eq!(permanent_hits.load(Ordering::Relaxed), 2);
    }

    // -----------------------------------------------------------------------
    // untracked reads
    // -----------------------------------------------------------------------

    #[test]
    fn untracked_read_of_read_biased_ref_does_not_attach() {
        let global = isolated();
        let tref = TRef::new(3_i64);

        // Drive the orec read-biased with tracked read-only commits.
        for _ in 0..vstm_types::READ_BIASED_THRESHOLD {
            let mut reader = Transaction::with_conflict_counter(TxnConfig::default(), global);
            let _ = tref.get(&mut reader).expect("read");
            reader.commit().expect("commit");
        }
        assert!(tref.orec().is_read_biased());

        let mut txn = Transaction::with_conflict_counter(
            TxnConfig::default().with_track_reads(false),
            global,
        );
        assert_eq!(tref.get(&mut txn).expect("untracked read"), 3);
        assert_eq!(txn.attachment_count(), 0);
        txn.commit().expect("commit");
    }
}
