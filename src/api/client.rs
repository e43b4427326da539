use crate::actor::ActorClient;
use crate::delta::{StateDelta, TransactionId};
use crate::raft::{LogEntryBuffer, Mode, ReplicationLog};
use std::sync::Arc;
use tokio::sync::watch;

/// Handle the database layer holds on its replication core.
///
/// A writing transaction pushes every state delta through [`emplace`]; once
/// its commit delta goes in, [`safe_to_commit`] blocks until the
/// transaction is replicated to a majority and applied locally (true), or
/// until it is known aborted or this server stops leading (false).
///
/// [`emplace`]: ConsensusClient::emplace
/// [`safe_to_commit`]: ConsensusClient::safe_to_commit
pub struct ConsensusClient {
    pub(super) actor: ActorClient,
    pub(super) buffer: Arc<LogEntryBuffer>,
    pub(super) rlog: Arc<ReplicationLog>,
    pub(super) mode: watch::Receiver<Mode>,
}

impl ConsensusClient {
    pub fn is_leader(&self) -> bool {
        *self.mode.borrow() == Mode::Leader
    }

    /// Buffers one state delta. A no-op unless this server currently leads;
    /// followers receive their data through replication instead.
    pub async fn emplace(&self, delta: StateDelta) {
        self.buffer.emplace(delta).await;
    }

    /// True once the transaction is durably replicated and locally applied;
    /// false if it aborted, or on step-down or shutdown before that point.
    pub async fn safe_to_commit(&self, tx_id: TransactionId) -> bool {
        self.actor.safe_to_commit(tx_id).await
    }

    /// Drops replication bookkeeping for all transactions with ids at or
    /// below `up_to_tx_id`. Callers invoke this once their transaction
    /// engine has retired those ids.
    pub fn garbage_collect_replication_log(&self, up_to_tx_id: TransactionId) {
        self.rlog.garbage_collect(up_to_tx_id);
    }

    /// Stops the Raft task, the timers and the RPC server. Idempotent;
    /// parked `safe_to_commit` callers return false.
    pub async fn shutdown(&self) {
        self.actor.shutdown().await;
    }
}
