use crate::actor::WeakActorClient;
use crate::delta::{DeltaOp, StateDelta, TransactionId};
use crate::raft::replication_log::ReplicationLog;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Buffers the deltas of in-flight local transactions until each
/// transaction's terminating delta arrives.
///
/// A buffered sequence is complete once it ends with a commit delta; only
/// then is it worth replicating, so nothing here is ever persisted. A crash
/// simply discards the buffer, and the incomplete transactions with it.
///
/// The buffer is enabled exactly while this server is leader. While
/// disabled, `emplace` is a no-op.
pub struct LogEntryBuffer {
    logger: slog::Logger,
    state: Mutex<BufferState>,
    raft: WeakActorClient,
    rlog: Arc<ReplicationLog>,
}

#[derive(Default)]
struct BufferState {
    enabled: bool,
    batches: HashMap<TransactionId, Vec<StateDelta>>,
}

enum Terminated {
    No,
    Aborted,
    Committed(Vec<StateDelta>),
}

impl LogEntryBuffer {
    pub fn new(logger: slog::Logger, raft: WeakActorClient, rlog: Arc<ReplicationLog>) -> Self {
        LogEntryBuffer {
            logger,
            state: Mutex::new(BufferState::default()),
            raft,
            rlog,
        }
    }

    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    /// Disables future insertions and clears everything already buffered.
    pub fn disable(&self) {
        let mut state = self.lock();
        state.enabled = false;
        state.batches.clear();
    }

    /// Adds one delta to its transaction's batch. A commit delta completes
    /// the batch and hands it to the Raft server for replication; an abort
    /// delta throws the batch away.
    pub async fn emplace(&self, delta: StateDelta) {
        let tx_id = delta.tx_id;

        // The buffer lock is released before calling back into the Raft
        // server.
        let terminated = {
            let mut state = self.lock();
            if !state.enabled {
                return;
            }
            match delta.op {
                DeltaOp::TransactionAbort => {
                    state.batches.remove(&tx_id);
                    Terminated::Aborted
                }
                DeltaOp::TransactionCommit => {
                    let mut batch = state.batches.remove(&tx_id).unwrap_or_default();
                    batch.push(delta);
                    Terminated::Committed(batch)
                }
                _ => {
                    state.batches.entry(tx_id).or_default().push(delta);
                    Terminated::No
                }
            }
        };

        match terminated {
            Terminated::No => {}
            Terminated::Aborted => {
                slog::debug!(self.logger, "Dropped aborted transaction {}", tx_id);
                self.rlog.set_aborted(tx_id);
            }
            Terminated::Committed(batch) => {
                if self.raft.append_to_log(tx_id, batch).await.is_err() {
                    slog::debug!(
                        self.logger,
                        "Raft server gone; dropped transaction {}",
                        tx_id
                    );
                }
            }
        }
    }

    #[cfg(test)]
    fn contains(&self, tx_id: TransactionId) -> bool {
        self.lock().batches.contains_key(&tx_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().expect("log entry buffer lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::delta::DeltaOp;
    use slog::o;
    use tokio::sync::mpsc;

    fn test_buffer() -> (LogEntryBuffer, mpsc::Receiver<Event>, Arc<ReplicationLog>) {
        let (actor_client, rx) = ActorClient::new(16);
        let rlog = Arc::new(ReplicationLog::new());
        let buffer = LogEntryBuffer::new(
            slog::Logger::root(slog::Discard, o!()),
            actor_client.weak(),
            rlog.clone(),
        );
        // Leak the strong client so the weak one stays upgradable for the
        // duration of the test.
        std::mem::forget(actor_client);
        (buffer, rx, rlog)
    }

    fn data_delta(tx_id: TransactionId) -> StateDelta {
        StateDelta {
            tx_id,
            op: DeltaOp::CreateVertex { gid: tx_id },
        }
    }

    #[tokio::test]
    async fn commit_hands_batch_to_raft() {
        let (buffer, mut rx, _rlog) = test_buffer();
        buffer.enable();

        buffer.emplace(StateDelta::begin(10)).await;
        buffer.emplace(data_delta(10)).await;
        buffer.emplace(StateDelta::commit(10)).await;

        match rx.try_recv().expect("expected an AppendToLog event") {
            Event::AppendToLog { tx_id, deltas } => {
                assert_eq!(tx_id, 10);
                assert_eq!(deltas.len(), 3);
                assert_eq!(deltas[2], StateDelta::commit(10));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!buffer.contains(10));
    }

    #[tokio::test]
    async fn abort_drops_batch_without_replication() {
        let (buffer, mut rx, rlog) = test_buffer();
        buffer.enable();

        buffer.emplace(StateDelta::begin(42)).await;
        buffer.emplace(data_delta(42)).await;
        buffer.emplace(data_delta(42)).await;
        buffer.emplace(StateDelta::abort(42)).await;

        assert!(rx.try_recv().is_err());
        assert!(!buffer.contains(42));
        assert!(rlog.is_aborted(42));
    }

    #[tokio::test]
    async fn disabled_buffer_ignores_deltas() {
        let (buffer, mut rx, _rlog) = test_buffer();

        buffer.emplace(StateDelta::begin(7)).await;
        buffer.emplace(StateDelta::commit(7)).await;

        assert!(rx.try_recv().is_err());
        assert!(!buffer.contains(7));
    }

    #[tokio::test]
    async fn disable_clears_buffered_batches() {
        let (buffer, mut rx, _rlog) = test_buffer();
        buffer.enable();

        buffer.emplace(StateDelta::begin(7)).await;
        assert!(buffer.contains(7));

        buffer.disable();
        assert!(!buffer.contains(7));

        // A commit arriving after the disable is ignored outright.
        buffer.emplace(StateDelta::commit(7)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn interleaved_transactions_stay_separate() {
        let (buffer, mut rx, _rlog) = test_buffer();
        buffer.enable();

        buffer.emplace(StateDelta::begin(1)).await;
        buffer.emplace(StateDelta::begin(2)).await;
        buffer.emplace(data_delta(1)).await;
        buffer.emplace(data_delta(2)).await;
        buffer.emplace(StateDelta::commit(2)).await;

        match rx.try_recv().expect("expected an AppendToLog event") {
            Event::AppendToLog { tx_id, deltas } => {
                assert_eq!(tx_id, 2);
                assert!(deltas.iter().all(|d| d.tx_id == 2));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(buffer.contains(1));
    }
}
