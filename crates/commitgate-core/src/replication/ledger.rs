//! Commit-callback ledger
//!
//! Holds the commit callbacks parked under the synchronous policy and the
//! set of replicas known to have applied each parked transaction. Callbacks
//! are released strictly in the order their batches were enqueued: a
//! transaction that reaches full coverage early still waits behind every
//! earlier transaction that has not. Commit notifications are externally
//! observable, so releasing out of order would let a later transaction look
//! durable before an earlier one.
//!
//! [`LedgerState`] is the unsynchronized aggregate; [`CommitLedger`] wraps it
//! in one mutex so that recording an acknowledgment and draining the queue
//! happen in the same critical section.

use crate::replication::ids::{ReplicaId, TxnTimestamp};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// A transaction's deferred commit notification
pub struct CommitCallback {
    txn_start_time: TxnTimestamp,
    invoke: Box<dyn FnOnce() + Send>,
}

impl CommitCallback {
    /// Create a callback for the transaction that started at `txn_start_time`
    pub fn new(
        txn_start_time: impl Into<TxnTimestamp>,
        invoke: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            txn_start_time: txn_start_time.into(),
            invoke: Box::new(invoke),
        }
    }

    /// Start timestamp of the owning transaction
    pub fn txn_start_time(&self) -> TxnTimestamp {
        self.txn_start_time
    }

    /// Run the callback, consuming it
    pub fn fire(self) {
        (self.invoke)()
    }
}

impl fmt::Debug for CommitCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitCallback")
            .field("txn_start_time", &self.txn_start_time)
            .finish_non_exhaustive()
    }
}

/// Commit callbacks queued while a single WAL buffer was being flushed
#[derive(Debug)]
pub struct BatchOfCommitCallbacks {
    callbacks: VecDeque<CommitCallback>,
    has_records: bool,
}

impl BatchOfCommitCallbacks {
    /// Create a batch
    pub fn new(callbacks: Vec<CommitCallback>, has_records: bool) -> Self {
        Self {
            callbacks: callbacks.into(),
            has_records,
        }
    }

    /// A batch of read-only commits; released without waiting on replicas
    pub fn read_only(callbacks: Vec<CommitCallback>) -> Self {
        Self::new(callbacks, false)
    }

    /// Whether the batch carried log records
    pub fn has_records(&self) -> bool {
        self.has_records
    }

    /// Callbacks still waiting in this batch
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether every callback has fired
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Transactions with callbacks in this batch, in order
    pub fn txn_ids(&self) -> Vec<TxnTimestamp> {
        self.callbacks.iter().map(|cb| cb.txn_start_time).collect()
    }
}

/// Callback queue plus applied-sets, without synchronization
#[derive(Debug, Default)]
pub struct LedgerState {
    /// Batches in arrival order
    queue: VecDeque<BatchOfCommitCallbacks>,
    /// Replicas known to have applied each parked transaction
    applied: HashMap<TxnTimestamp, HashSet<ReplicaId>>,
    /// Parked callbacks per transaction, for batches that carry records
    awaiting: HashMap<TxnTimestamp, usize>,
}

impl LedgerState {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch to the tail of the queue
    pub fn enqueue(&mut self, batch: BatchOfCommitCallbacks) {
        if batch.has_records {
            for callback in &batch.callbacks {
                *self.awaiting.entry(callback.txn_start_time).or_insert(0) += 1;
            }
        }
        self.queue.push_back(batch);
    }

    /// Note that `replica` applied `txn`.
    ///
    /// Returns true once every one of the `replica_count` replicas has applied
    /// it. Acknowledgments for transactions with no parked callback (already
    /// released, or never synchronous) are ignored.
    pub fn record_applied(
        &mut self,
        txn: TxnTimestamp,
        replica: ReplicaId,
        replica_count: usize,
    ) -> bool {
        if !self.awaiting.contains_key(&txn) {
            tracing::trace!("Ignoring applied ack from {} for untracked txn {}", replica, txn);
            return false;
        }

        let replicas = self.applied.entry(txn).or_default();
        replicas.insert(replica);
        replicas.len() >= replica_count
    }

    /// Fire every callback that is ready and not blocked by an earlier one.
    ///
    /// Returns the number of callbacks fired.
    pub fn drain_ready(&mut self, replica_count: usize) -> usize {
        let Self {
            queue,
            applied,
            awaiting,
        } = self;
        let mut fired = 0;

        while let Some(batch) = queue.front_mut() {
            if !batch.has_records {
                // Read-only commits never depend on replication
                for callback in batch.callbacks.drain(..) {
                    callback.fire();
                    fired += 1;
                }
                queue.pop_front();
                continue;
            }

            while let Some(head) = batch.callbacks.front() {
                let txn = head.txn_start_time;
                if !is_covered(applied, txn, replica_count) {
                    return fired;
                }

                let Some(callback) = batch.callbacks.pop_front() else {
                    break;
                };
                release(applied, awaiting, txn);
                callback.fire();
                fired += 1;
                tracing::trace!("Commit callback invoked for txn: {}", txn);
            }

            queue.pop_front();
        }

        fired
    }

    /// Drop `replica` from every applied-set
    pub fn forget_replica(&mut self, replica: &ReplicaId) {
        for replicas in self.applied.values_mut() {
            replicas.remove(replica);
        }
    }

    /// Batches still queued
    pub fn pending_batches(&self) -> usize {
        self.queue.len()
    }

    /// Callbacks still queued, across all batches
    pub fn pending_callbacks(&self) -> usize {
        self.queue.iter().map(BatchOfCommitCallbacks::len).sum()
    }

    /// Transactions with at least one recorded acknowledgment
    pub fn tracked_transactions(&self) -> usize {
        self.applied.len()
    }

    /// Replicas recorded as having applied `txn`
    pub fn applied_count(&self, txn: TxnTimestamp) -> usize {
        self.applied.get(&txn).map_or(0, HashSet::len)
    }
}

fn is_covered(
    applied: &HashMap<TxnTimestamp, HashSet<ReplicaId>>,
    txn: TxnTimestamp,
    replica_count: usize,
) -> bool {
    // With no replicas there is nobody to wait for
    replica_count == 0 || applied.get(&txn).is_some_and(|r| r.len() >= replica_count)
}

fn release(
    applied: &mut HashMap<TxnTimestamp, HashSet<ReplicaId>>,
    awaiting: &mut HashMap<TxnTimestamp, usize>,
    txn: TxnTimestamp,
) {
    if let Some(count) = awaiting.get_mut(&txn) {
        *count -= 1;
        if *count == 0 {
            awaiting.remove(&txn);
            applied.remove(&txn);
        }
    }
}

/// The ledger shared by the commit path and the acknowledgment path
#[derive(Debug, Default)]
pub struct CommitLedger {
    state: Mutex<LedgerState>,
}

impl CommitLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the ledger lock across a compound step, such as a membership
    /// change followed by a drain
    pub(crate) fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock()
    }

    /// Park a batch of callbacks
    pub fn enqueue(&self, batch: BatchOfCommitCallbacks) {
        self.state.lock().enqueue(batch);
    }

    /// Record that `replica` applied `txn` and release whatever that unblocks.
    ///
    /// Returns the number of callbacks fired. Callbacks run with the ledger
    /// lock held and must not call back into the ledger.
    pub fn acknowledge(
        &self,
        txn: TxnTimestamp,
        replica: ReplicaId,
        replica_count: usize,
    ) -> usize {
        let mut state = self.state.lock();
        if state.record_applied(txn, replica, replica_count) {
            state.drain_ready(replica_count)
        } else {
            0
        }
    }

    /// Release whatever is ready without recording anything new
    pub fn drain(&self, replica_count: usize) -> usize {
        self.state.lock().drain_ready(replica_count)
    }

    /// Forget a departed replica's acknowledgments, then drain against the
    /// smaller replica set
    pub fn forget_replica(&self, replica: &ReplicaId, replica_count: usize) -> usize {
        let mut state = self.state.lock();
        state.forget_replica(replica);
        state.drain_ready(replica_count)
    }

    /// Batches still queued
    pub fn pending_batches(&self) -> usize {
        self.state.lock().pending_batches()
    }

    /// Callbacks still queued
    pub fn pending_callbacks(&self) -> usize {
        self.state.lock().pending_callbacks()
    }

    /// Transactions with at least one recorded acknowledgment
    pub fn tracked_transactions(&self) -> usize {
        self.state.lock().tracked_transactions()
    }
}
