//! Transaction manager integration (component E).
//!
//! `TransactionManager` is a minimal embedded two-phase-commit driver: enough
//! to exercise `Database`'s `Synchronizer` and `ResourceManager`
//! implementations end to end, with no distributed transaction support and
//! no external XA integration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use log::{debug, warn};

use crate::error::DResult;
use crate::oid::Timestamp;

/// Orders hook invocations within a transaction phase. Lower sorts first;
/// the synchronizer must sort last, so `Database` reports a lower tier for
/// its `ResourceManager` role than for its `Synchronizer` role.
pub type SortKey = (u8, u64);

/// Lifecycle hooks the transaction manager drives on every registered
/// synchronizer.
pub trait Synchronizer: Send + Sync {
    fn new_transaction(&self, tx: &Transaction);
    fn before_completion(&self, tx: &Transaction);
    fn after_completion(&self, tx: &Transaction);
    fn sort_key(&self) -> SortKey;
}

/// The two-phase-commit surface the transaction manager drives on every
/// registered resource manager.
pub trait ResourceManager: Send + Sync {
    fn sort_key(&self) -> SortKey;
    fn commit(&self, tx: &Transaction) -> DResult<()>;
    fn abort(&self, tx: &Transaction);
    fn tpc_begin(&self, tx: &Transaction) -> DResult<()>;
    fn tpc_vote(&self, tx: &Transaction) -> DResult<()>;
    fn tpc_finish(&self, tx: &Transaction, timestamp: Timestamp) -> DResult<()>;
    fn tpc_abort(&self, tx: &Transaction, timestamp: Timestamp);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// The identity object passed to every hook call. Carries nothing resource
/// managers couldn't recompute themselves; it exists so multiple
/// collaborators agree on which logical transaction a callback belongs to.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    thread: ThreadId,
    begin_timestamp: Timestamp,
    status: Mutex<TransactionStatus>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn begin_timestamp(&self) -> Timestamp {
        self.begin_timestamp
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock().unwrap()
    }
}

/// A minimal embedded two-phase-commit coordinator. One instance is shared
/// by every thread using a given `Database`; `Database::open` registers
/// itself as both a `Synchronizer` and a `ResourceManager`.
pub struct TransactionManager {
    synchronizers: Mutex<Vec<Arc<dyn Synchronizer>>>,
    resource_managers: Mutex<Vec<Arc<dyn ResourceManager>>>,
    next_id: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            synchronizers: Mutex::new(Vec::new()),
            resource_managers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register_synchronizer(&self, sync: Arc<dyn Synchronizer>) {
        let mut list = self.synchronizers.lock().unwrap();
        list.push(sync);
        list.sort_by_key(|s| s.sort_key());
    }

    pub fn register_resource_manager(&self, rm: Arc<dyn ResourceManager>) {
        let mut list = self.resource_managers.lock().unwrap();
        list.push(rm);
        list.sort_by_key(|r| r.sort_key());
    }

    /// Starts a new transaction for the calling thread and fires
    /// `new_transaction` on every registered synchronizer so each can
    /// re-checkout its connected objects into this thread's view.
    pub fn begin(&self, begin_timestamp: Timestamp) -> Transaction {
        let tx = Transaction {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            thread: std::thread::current().id(),
            begin_timestamp,
            status: Mutex::new(TransactionStatus::Active),
        };
        for sync in self.synchronizers.lock().unwrap().iter() {
            sync.new_transaction(&tx);
        }
        tx
    }

    /// Drives the full two-phase commit across every registered resource
    /// manager, in `sort_key` order, aborting everything already prepared
    /// if any step fails.
    pub fn commit(&self, tx: &Transaction, finish_timestamp: Timestamp) -> DResult<()> {
        for sync in self.synchronizers.lock().unwrap().iter() {
            sync.before_completion(tx);
        }

        let rms = self.resource_managers.lock().unwrap().clone();
        let mut prepared = Vec::new();

        let result = (|| {
            for rm in &rms {
                rm.tpc_begin(tx)?;
                prepared.push(rm.clone());
            }
            for rm in &rms {
                rm.commit(tx)?;
            }
            for rm in &rms {
                rm.tpc_vote(tx)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            warn!("transaction {} failed to prepare: {err}", tx.id);
            self.unwind(tx, &prepared, tx.begin_timestamp);
            return Err(err);
        }

        for rm in &rms {
            rm.tpc_finish(tx, finish_timestamp)?;
        }
        *tx.status.lock().unwrap() = TransactionStatus::Committed;
        debug!("transaction {} committed at {finish_timestamp}", tx.id);

        for sync in self.synchronizers.lock().unwrap().iter() {
            sync.after_completion(tx);
        }
        Ok(())
    }

    /// Rolls back whichever resource managers had already entered `tpc_begin`
    /// when a prepare step failed, and plain-aborts the rest.
    fn unwind(&self, tx: &Transaction, prepared: &[Arc<dyn ResourceManager>], abort_timestamp: Timestamp) {
        for rm in prepared {
            rm.tpc_abort(tx, abort_timestamp);
        }
        for rm in self.resource_managers.lock().unwrap().iter() {
            if !prepared.iter().any(|p| Arc::ptr_eq(p, rm)) {
                rm.abort(tx);
            }
        }
        *tx.status.lock().unwrap() = TransactionStatus::Aborted;
        for sync in self.synchronizers.lock().unwrap().iter() {
            sync.after_completion(tx);
        }
    }

    /// Explicit user-initiated abort: runs the same prepare steps `commit`
    /// would (so any versions already written land in the log as orphaned
    /// segments) then aborts instead of voting and finishing.
    pub fn abort(&self, tx: &Transaction, abort_timestamp: Timestamp) -> DResult<()> {
        let rms = self.resource_managers.lock().unwrap().clone();
        let mut prepared = Vec::new();
        let result = (|| {
            for rm in &rms {
                rm.tpc_begin(tx)?;
                prepared.push(rm.clone());
            }
            for rm in &rms {
                rm.commit(tx)?;
            }
            Ok(())
        })();
        self.unwind(tx, &prepared, abort_timestamp);
        result
    }
}
