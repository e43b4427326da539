//! Event-loop plumbing for the Raft server.
//!
//! All mutable Raft state is owned by a single task running
//! [`RaftActor::run_event_loop`]; everything else (RPC handlers, timer
//! tasks, the log-entry buffer, local writers) talks to it through the
//! event queue. This gives the same serialization as one coarse lock, with
//! suspension points only between events.

use crate::delta::{StateDelta, TransactionId};
use crate::raft::{
    AppendEntriesReply, AppendEntriesReplyFromPeer, AppendEntriesRequest, RaftServer,
    RequestVoteReply, RequestVoteReplyFromPeer, RequestVoteRequest, ServerId, Term,
};
use crate::storage::{MetadataStorage, StorageError};
use std::fmt::{self, Debug, Formatter};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum Event {
    /// A complete transaction from the log-entry buffer, ready to replicate.
    AppendToLog {
        tx_id: TransactionId,
        deltas: Vec<StateDelta>,
    },

    /// Inbound RequestVote from a candidate.
    RequestVote(RequestVoteRequest, Callback<RequestVoteReply>),

    /// Inbound AppendEntries from a leader.
    AppendEntries(AppendEntriesRequest, Callback<AppendEntriesReply>),

    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    /// Per-peer heartbeat tick; only meaningful while leader in `term`.
    LeaderHeartbeat { peer: ServerId, term: Term },

    /// The election deadline expired without hearing from a leader.
    ElectionTimeout,

    /// Fired once after winning an election; appends the no-op entry that
    /// forces a commit in the new leader's term.
    LeaderEstablished { term: Term },

    /// A local writer asking whether its transaction may commit locally.
    SafeToCommit {
        tx_id: TransactionId,
        callback: Callback<bool>,
    },

    Shutdown,
}

pub struct Callback<T>(oneshot::Sender<T>);

impl<T> Callback<T> {
    pub fn send(self, value: T) {
        // The caller may have stopped waiting; that's fine.
        let _ = self.0.send(value);
    }

    /// Unwraps the underlying sender, for parking the callback somewhere
    /// other than an immediate reply (e.g. the replication log's waiters).
    pub fn into_inner(self) -> oneshot::Sender<T> {
        self.0
    }

    #[cfg(test)]
    pub fn for_test(sender: oneshot::Sender<T>) -> Self {
        Callback(sender)
    }
}

impl<T> Debug for Callback<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("raft server task has exited")]
pub struct ActorExited;

/// Strong handle; keeps the event loop's queue open. Held by the public
/// client.
#[derive(Clone)]
pub struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(queue_size);
        (ActorClient { sender: tx }, rx)
    }

    pub fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub async fn safe_to_commit(&self, tx_id: TransactionId) -> bool {
        let (tx, rx) = oneshot::channel();
        let event = Event::SafeToCommit {
            tx_id,
            callback: Callback(tx),
        };
        if self.sender.send(event).await.is_err() {
            return false;
        }
        // The callback is resolved by the apply path, or with false on
        // abort, step-down or shutdown.
        rx.await.unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        // Idempotent: a second call finds the queue closed and does nothing.
        let _ = self.sender.send(Event::Shutdown).await;
    }
}

/// Weak handle for internal collaborators (RPC handlers, timers, the
/// buffer, spawned peer calls). Does not keep the event loop alive.
#[derive(Clone)]
pub struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub async fn append_to_log(
        &self,
        tx_id: TransactionId,
        deltas: Vec<StateDelta>,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendToLog { tx_id, deltas }).await
    }

    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(request, Callback(tx))).await?;
        rx.await.map_err(|_| ActorExited)
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(request, Callback(tx)))
            .await?;
        rx.await.map_err(|_| ActorExited)
    }

    pub async fn request_vote_reply_from_peer(
        &self,
        reply: RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub async fn append_entries_reply_from_peer(
        &self,
        reply: AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub async fn leader_heartbeat(&self, peer: ServerId, term: Term) -> Result<(), ActorExited> {
        self.send(Event::LeaderHeartbeat { peer, term }).await
    }

    pub async fn election_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::ElectionTimeout).await
    }

    pub async fn leader_established(&self, term: Term) -> Result<(), ActorExited> {
        self.send(Event::LeaderEstablished { term }).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        let sender = self.sender.upgrade().ok_or(ActorExited)?;
        sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// Owns the Raft server and drains the event queue until shutdown.
pub struct RaftActor<S: MetadataStorage> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    server: RaftServer<S>,
}

impl<S: MetadataStorage> RaftActor<S> {
    pub fn new(
        logger: slog::Logger,
        receiver: mpsc::Receiver<Event>,
        server: RaftServer<S>,
    ) -> Self {
        RaftActor {
            logger,
            receiver,
            server,
        }
    }

    pub async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "Received event: {:?}", event);
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle_event(event);
        }
        self.receiver.close();
        self.server.stop();
        slog::info!(self.logger, "Raft server task exited");
    }

    // Handlers must not await: any slow work is spawned and comes back as
    // another event.
    fn handle_event(&mut self, event: Event) {
        let result = match event {
            Event::AppendToLog { tx_id, deltas } => self.server.handle_append_to_log(tx_id, deltas),
            Event::RequestVote(request, callback) => {
                let reply = self.server.handle_request_vote(request);
                reply.map(|r| callback.send(r))
            }
            Event::AppendEntries(request, callback) => {
                let reply = self.server.handle_append_entries(request);
                reply.map(|r| callback.send(r))
            }
            Event::RequestVoteReplyFromPeer(reply) => self.server.handle_request_vote_reply(reply),
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.server.handle_append_entries_reply(reply)
            }
            Event::LeaderHeartbeat { peer, term } => {
                self.server.handle_leader_heartbeat(peer, term);
                Ok(())
            }
            Event::ElectionTimeout => self.server.handle_election_timeout(),
            Event::LeaderEstablished { term } => self.server.handle_leader_established(term),
            Event::SafeToCommit { tx_id, callback } => {
                self.server.handle_safe_to_commit(tx_id, callback);
                Ok(())
            }
            Event::Shutdown => unreachable!("handled by the event loop"),
        };

        if let Err(e) = result {
            self.fatal_storage_failure(e);
        }
    }

    /// A failed write to the metadata store means we can no longer uphold
    /// Raft's safety guarantees. Operator intervention is required.
    fn fatal_storage_failure(&self, error: StorageError) -> ! {
        slog::crit!(self.logger, "Raft persistent storage failure: {}", error);
        panic!("raft persistent storage failure: {}", error);
    }
}
