use crate::delta::TransactionId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Per-transaction replication status, shared between the Raft server task
/// and local writers.
///
/// Two bits matter to a writer: *replicated* (the transaction's log entry is
/// known committed by Raft) and *safe-to-commit* (the entry has also been
/// applied to local storage). A writer blocked in `safe_to_commit` parks a
/// oneshot here; the apply path resolves it with `true`, while an abort,
/// a step-down or shutdown resolves it with `false`.
pub struct ReplicationLog {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    statuses: HashMap<TransactionId, TxStatus>,
    waiters: HashMap<TransactionId, Vec<oneshot::Sender<bool>>>,
}

#[derive(Default, Clone, Copy)]
struct TxStatus {
    replicated: bool,
    safe_to_commit: bool,
    aborted: bool,
}

impl ReplicationLog {
    pub fn new() -> Self {
        ReplicationLog {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn set_replicated(&self, tx_id: TransactionId) {
        self.lock().statuses.entry(tx_id).or_default().replicated = true;
    }

    pub fn set_safe_to_commit(&self, tx_id: TransactionId) {
        let mut inner = self.lock();
        inner.statuses.entry(tx_id).or_default().safe_to_commit = true;
        resolve(&mut inner, tx_id, true);
    }

    /// Recorded by the log-entry buffer when it drops an aborted
    /// transaction, so a writer polling `safe_to_commit` gets a definite
    /// answer instead of blocking forever.
    pub fn set_aborted(&self, tx_id: TransactionId) {
        let mut inner = self.lock();
        inner.statuses.entry(tx_id).or_default().aborted = true;
        resolve(&mut inner, tx_id, false);
    }

    pub fn is_replicated(&self, tx_id: TransactionId) -> bool {
        self.status(tx_id).replicated
    }

    pub fn is_safe_to_commit(&self, tx_id: TransactionId) -> bool {
        self.status(tx_id).safe_to_commit
    }

    pub fn is_aborted(&self, tx_id: TransactionId) -> bool {
        self.status(tx_id).aborted
    }

    /// Parks `sender` until the transaction's fate is known. If the fate is
    /// already known the sender is resolved immediately.
    pub fn register_waiter(&self, tx_id: TransactionId, sender: oneshot::Sender<bool>) {
        let mut inner = self.lock();
        let status = inner.statuses.get(&tx_id).copied().unwrap_or_default();
        if status.safe_to_commit {
            let _ = sender.send(true);
        } else if status.aborted {
            let _ = sender.send(false);
        } else {
            inner.waiters.entry(tx_id).or_default().push(sender);
        }
    }

    /// Drops all bookkeeping for transactions with ids <= `up_to_tx_id`.
    /// Idempotent. Any waiter on a collected transaction resolves to false.
    pub fn garbage_collect(&self, up_to_tx_id: TransactionId) {
        let mut inner = self.lock();
        inner.statuses.retain(|&tx_id, _| tx_id > up_to_tx_id);
        let collected: Vec<TransactionId> = inner
            .waiters
            .keys()
            .copied()
            .filter(|&tx_id| tx_id <= up_to_tx_id)
            .collect();
        for tx_id in collected {
            resolve(&mut inner, tx_id, false);
        }
    }

    /// Clears every bit and resolves every waiter with false. Invoked on the
    /// Leader to Follower transition and on shutdown.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.statuses.clear();
        for (_, waiters) in inner.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(false);
            }
        }
    }

    fn status(&self, tx_id: TransactionId) -> TxStatus {
        self.lock().statuses.get(&tx_id).copied().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("replication log lock poisoned")
    }
}

fn resolve(inner: &mut Inner, tx_id: TransactionId, outcome: bool) {
    if let Some(waiters) = inner.waiters.remove(&tx_id) {
        for waiter in waiters {
            // A writer that gave up waiting is fine to ignore.
            let _ = waiter.send(outcome);
        }
    }
}
