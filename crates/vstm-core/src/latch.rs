//! Blocking-retry wakeup: era-guarded latches and per-orec listener chains.
//!
//! A transaction that calls retry parks on a [`Latch`] after registering
//! it on every orec it read. The latch carries an *era* so it can be
//! pooled: `open` with a stale era is a no-op, which turns the classic
//! missed/spurious-wakeup races of a recycled latch into harmless noise.
//!
//! Each reference holds at most one [`ListenerChain`], a singly-linked
//! list of `(latch, era)` pairs. A committing update detaches the whole
//! chain while still holding its locks and opens every latch only after
//! the locks are released, so a woken thread never contends with the
//! still-locked committer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

// ---------------------------------------------------------------------------
// Latch
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LatchState {
    open: bool,
    era: u64,
}

/// A one-shot gate a retrying transaction parks on, reusable via eras.
#[derive(Debug)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    /// A closed latch in era 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState { open: false, era: 1 }),
            cond: Condvar::new(),
        }
    }

    /// The current era. Capture this before registering the latch
    /// anywhere; `open`/`try_await_open` calls must present it back.
    #[must_use]
    pub fn era(&self) -> u64 {
        self.state.lock().era
    }

    /// Whether the latch is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Open the latch if `era` is still current. A stale era means the
    /// latch was reset for reuse after this registration; the wakeup
    /// belongs to a dead wait and is dropped.
    pub fn open(&self, era: u64) {
        let mut state = self.state.lock();
        if state.era != era || state.open {
            return;
        }
        state.open = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Park until the latch opens, without a timeout.
    ///
    /// Returns immediately if the latch is already open or `era` is no
    /// longer current (the wait is moot either way).
    pub fn await_open(&self, era: u64) {
        let mut state = self.state.lock();
        while state.era == era && !state.open {
            self.cond.wait(&mut state);
        }
    }

    /// Park until the latch opens or `timeout` elapses.
    ///
    /// Returns the remaining timeout on wakeup — time is only consumed
    /// while actually blocked — or `None` if the timeout elapsed.
    pub fn try_await_open(&self, era: u64, timeout: Duration) -> Option<Duration> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.era == era && !state.open {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.era == era && !state.open {
                    None
                } else {
                    Some(Duration::ZERO)
                };
            }
        }
        drop(state);
        Some(deadline.saturating_duration_since(std::time::Instant::now()))
    }

    /// Close the latch and advance the era, invalidating every
    /// outstanding registration. Required before reuse.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.era += 1;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ListenerChain
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ListenerNode {
    latch: Arc<Latch>,
    era: u64,
    next: Option<Box<ListenerNode>>,
}

/// Head of a reference's singly-linked listener chain.
///
/// Pushed to by registering (retrying) transactions, detached wholesale
/// by a committing update. The owning reference serializes access.
#[derive(Debug, Default)]
pub struct ListenerChain {
    head: Option<Box<ListenerNode>>,
}

impl ListenerChain {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Prepend a `(latch, era)` registration.
    pub fn push(&mut self, latch: Arc<Latch>, era: u64) {
        self.head = Some(Box::new(ListenerNode {
            latch,
            era,
            next: self.head.take(),
        }));
    }

    /// Detach the whole chain, leaving this one empty.
    #[must_use]
    pub fn detach(&mut self) -> ListenerChain {
        ListenerChain { head: self.head.take() }
    }

    /// Open every latch in the chain. Call only after the committing
    /// transaction has released its own locks.
    pub fn open_all(self) {
        let mut node = self.head;
        while let Some(current) = node {
            current.latch.open(current.era);
            node = current.next;
        }
    }
}
