//! Reuse pools for latches and transactions.
//!
//! Both objects are built for reuse: a latch invalidates stale
//! registrations by advancing its era, and a transaction clears every
//! field through its reset contract. The pool enforces both on `put`, so
//! a taken object can never observe state from its previous life.
//!
//! Tranlocal values are owned and dropped rather than recycled; the
//! single-owner discipline the engine needs is then free.

use std::sync::Arc;

use crate::config::TxnConfig;
use crate::latch::Latch;
use crate::txn::Transaction;

/// Free lists for the engine's reusable objects. Owned and threaded by
/// the caller, like the transactions it stores.
#[derive(Debug, Default)]
pub struct StmPool {
    latches: Vec<Arc<Latch>>,
    transactions: Vec<Transaction>,
}

impl StmPool {
    /// An empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a closed latch, allocating when the pool is empty.
    #[must_use]
    pub fn take_latch(&mut self) -> Arc<Latch> {
        self.latches.pop().unwrap_or_else(|| Arc::new(Latch::new()))
    }

    /// Return a latch for reuse. Its era advances, so registrations from
    /// the previous life open nothing.
    pub fn put_latch(&mut self, latch: Arc<Latch>) {
        latch.reset();
        self.latches.push(latch);
    }

    /// Take a transaction initialized with `config`, reusing a pooled one
    /// when available.
    #[must_use]
    pub fn take_transaction(&mut self, config: TxnConfig) -> Transaction {
        match self.transactions.pop() {
            Some(mut txn) => {
                txn.init(config);
                txn
            }
            None => Transaction::new(config),
        }
    }

    /// Return a transaction for reuse; it is hard-reset on the way in.
    pub fn put_transaction(&mut self, mut txn: Transaction) {
        txn.hard_reset();
        self.transactions.push(txn);
    }

    /// Pooled latch count (diagnostics).
    #[must_use]
    pub fn latch_count(&self) -> usize {
        self.latches.len()
    }

    /// Pooled transaction count (diagnostics).
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}
