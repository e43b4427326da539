use crate::actor::{Callback, WeakActorClient};
use crate::coordination::{PeerClient, RpcServerShutdownHandle};
use crate::delta::{DeltaApplier, StateDelta, TransactionId};
use crate::raft::election::{ElectionConfig, ElectionState, Mode};
use crate::raft::log::{LogEntry, LogIndex, RaftLog, Term};
use crate::raft::log_entry_buffer::LogEntryBuffer;
use crate::raft::messages::{
    AppendEntriesReply, AppendEntriesReplyFromPeer, AppendEntriesRequest, PeerRpcOutcome,
    RequestVoteReply, RequestVoteReplyFromPeer, RequestVoteRequest,
};
use crate::raft::peers::{ClusterTracker, ServerId};
use crate::raft::replication_log::ReplicationLog;
use crate::storage::{MetadataStorage, StorageError};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::cmp;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

pub struct RaftConfig<S: MetadataStorage> {
    pub logger: slog::Logger,
    pub cluster: ClusterTracker,
    pub storage: S,
    pub rlog: Arc<ReplicationLog>,
    pub buffer: Arc<LogEntryBuffer>,
    pub applier: Box<dyn DeltaApplier>,
    pub actor: WeakActorClient,
    pub mode_watch: watch::Sender<Mode>,
    pub rpc_shutdown: RpcServerShutdownHandle,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub replicate_timeout: Duration,
}

/// One server in the Raft cluster. Owns the persistent state (through the
/// metadata store), the volatile commit/apply cursors, and the mode state
/// machine. Every handler runs on the actor task; anything slow is spawned
/// and comes back as another event.
pub struct RaftServer<S: MetadataStorage> {
    logger: slog::Logger,
    cluster: ClusterTracker,
    storage: S,

    // Read-through caches of the persistent record. Updated only after the
    // corresponding storage write succeeded.
    current_term: Term,
    voted_for: Option<ServerId>,
    log: RaftLog,

    commit_index: LogIndex,
    last_applied: LogIndex,

    election: ElectionState,
    rlog: Arc<ReplicationLog>,
    buffer: Arc<LogEntryBuffer>,
    applier: Box<dyn DeltaApplier>,
    actor: WeakActorClient,
    mode_watch: watch::Sender<Mode>,
    rpc_shutdown: Option<RpcServerShutdownHandle>,

    heartbeat_interval: Duration,
    replicate_timeout: Duration,
}

impl<S: MetadataStorage> RaftServer<S> {
    /// Recovers from the metadata store and starts out as a follower with
    /// `commit_index = 0`: committed entries are re-applied as the commit
    /// index re-advances, not replayed eagerly here.
    pub fn new(config: RaftConfig<S>) -> Result<Self, StorageError> {
        let current_term = config.storage.current_term()?;
        let voted_for = config.storage.voted_for()?;
        let log = RaftLog::new(config.storage.load_log()?);
        config.rlog.reset();

        let rng = Arc::new(Mutex::new(SmallRng::from_entropy()));
        let election = ElectionState::new_follower(
            ElectionConfig {
                heartbeat_interval: config.heartbeat_interval,
                election_timeout_min: config.election_timeout_min,
                election_timeout_max: config.election_timeout_max,
            },
            rng,
            config.actor.clone(),
        );

        slog::info!(
            config.logger,
            "Recovered raft server {}: term={}, voted_for={:?}, log_entries={}",
            config.cluster.me(),
            current_term,
            voted_for,
            log.last_index()
        );

        let server = RaftServer {
            logger: config.logger,
            cluster: config.cluster,
            storage: config.storage,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            election,
            rlog: config.rlog,
            buffer: config.buffer,
            applier: config.applier,
            actor: config.actor,
            mode_watch: config.mode_watch,
            rpc_shutdown: Some(config.rpc_shutdown),
            heartbeat_interval: config.heartbeat_interval,
            replicate_timeout: config.replicate_timeout,
        };
        server.publish_mode();
        Ok(server)
    }

    /// Final cleanup, run by the actor after the event loop drains.
    /// Unblocks every parked writer and stops the RPC server; the timer
    /// tasks die when `self` (and their handles with it) drops.
    pub fn stop(&mut self) {
        self.buffer.disable();
        self.rlog.reset();
        let _ = self.mode_watch.send(Mode::Follower);
        self.rpc_shutdown.take();
    }

    // ------------------------------------------------------------------
    // RequestVote, receiver side
    // ------------------------------------------------------------------

    pub fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply, StorageError> {
        if !self.cluster.contains_member(request.candidate_id) {
            slog::warn!(
                self.logger,
                "Ignoring vote request from unknown server {}",
                request.candidate_id
            );
            return Ok(self.deny_vote());
        }

        // > Reply false if term < currentTerm (§5.1)
        if request.term < self.current_term {
            slog::debug!(
                self.logger,
                "Denying vote for {}: stale term {} < {}",
                request.candidate_id,
                request.term,
                self.current_term
            );
            return Ok(self.deny_vote());
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if request.term > self.current_term {
            self.update_term(request.term)?;
            self.step_down(None);
        }

        // > If votedFor is null or candidateId, and candidate's log is at
        // > least as up-to-date as receiver's log, grant vote (§5.2, §5.4)
        let can_vote_for = match self.voted_for {
            None => true,
            Some(voted_for) => voted_for == request.candidate_id,
        };
        if !can_vote_for {
            slog::debug!(
                self.logger,
                "Denying vote for {}: already voted for {:?} in term {}",
                request.candidate_id,
                self.voted_for,
                self.current_term
            );
            return Ok(self.deny_vote());
        }
        if !self.candidate_log_at_least_up_to_date(&request) {
            slog::debug!(
                self.logger,
                "Denying vote for {}: candidate log is behind",
                request.candidate_id
            );
            return Ok(self.deny_vote());
        }

        // The vote must be durable before the reply leaves this server.
        self.set_voted_for(Some(request.candidate_id))?;
        self.election.reset_deadline();

        slog::info!(
            self.logger,
            "Granted vote to {} for term {}",
            request.candidate_id,
            self.current_term
        );
        Ok(RequestVoteReply {
            term: self.current_term,
            vote_granted: true,
        })
    }

    fn deny_vote(&self) -> RequestVoteReply {
        RequestVoteReply {
            term: self.current_term,
            vote_granted: false,
        }
    }

    /// Raft determines which of two logs is more up-to-date by comparing
    /// `(last_log_term, last_log_index)` lexicographically (§5.4.1).
    fn candidate_log_at_least_up_to_date(&self, request: &RequestVoteRequest) -> bool {
        let (my_last_index, my_last_term) = self.log.last_entry_data();
        (request.last_log_term, request.last_log_index) >= (my_last_term, my_last_index)
    }

    // ------------------------------------------------------------------
    // RequestVote, candidate side
    // ------------------------------------------------------------------

    pub fn handle_election_timeout(&mut self) -> Result<(), StorageError> {
        if self.election.mode() == Mode::Leader {
            // A timer event can race a mode transition; leaders have no
            // election deadline.
            return Ok(());
        }

        let new_term = self.current_term.next();
        self.storage.set_current_term(new_term)?;
        self.current_term = new_term;
        self.set_voted_for(Some(self.cluster.me()))?;

        let peer_ids = self.cluster.peer_ids();
        self.election.transition_to_candidate(new_term, &peer_ids);
        self.publish_mode();
        slog::info!(
            self.logger,
            "Election deadline expired; campaigning in term {}",
            new_term
        );

        // A cluster of one elects itself.
        if self.cluster.has_majority(1) {
            self.become_leader();
            return Ok(());
        }

        let request = self.build_request_vote_request();
        for peer_id in peer_ids {
            self.spawn_request_vote(peer_id, request.clone(), Duration::ZERO);
        }
        Ok(())
    }

    fn build_request_vote_request(&self) -> RequestVoteRequest {
        let (last_log_index, last_log_term) = self.log.last_entry_data();
        RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.cluster.me(),
            last_log_index,
            last_log_term,
        }
    }

    fn spawn_request_vote(&self, peer_id: ServerId, request: RequestVoteRequest, delay: Duration) {
        let client = match self.cluster.peer_client(peer_id) {
            Some(client) => client.clone(),
            None => return,
        };
        let actor = self.actor.clone();
        let rpc_timeout = self.replicate_timeout;
        tokio::task::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Self::call_peer_request_vote(client, peer_id, request, actor, rpc_timeout).await;
        });
    }

    async fn call_peer_request_vote(
        mut client: PeerClient,
        peer: ServerId,
        request: RequestVoteRequest,
        actor: WeakActorClient,
        rpc_timeout: Duration,
    ) {
        let request_term = request.term;
        let outcome = match tokio::time::timeout(rpc_timeout, client.request_vote(request)).await {
            Ok(Ok(reply)) => PeerRpcOutcome::Reply(reply),
            Ok(Err(_)) | Err(_) => PeerRpcOutcome::Unreachable,
        };
        let _ = actor
            .request_vote_reply_from_peer(RequestVoteReplyFromPeer {
                peer,
                request_term,
                outcome,
            })
            .await;
    }

    pub fn handle_request_vote_reply(
        &mut self,
        input: RequestVoteReplyFromPeer,
    ) -> Result<(), StorageError> {
        match input.outcome {
            PeerRpcOutcome::Reply(reply) => {
                if reply.term > self.current_term {
                    slog::info!(
                        self.logger,
                        "Vote reply from {} carries term {}; stepping down",
                        input.peer,
                        reply.term
                    );
                    self.update_term(reply.term)?;
                    self.step_down(None);
                } else if reply.vote_granted {
                    let votes = self.election.record_granted_vote(input.request_term, input.peer);
                    // votes is 0 when the election for request_term is over.
                    if votes > 0 && self.cluster.has_majority(votes) {
                        self.become_leader();
                    }
                } else {
                    self.election.record_denied_vote(input.request_term, input.peer);
                }
            }
            PeerRpcOutcome::Unreachable => {
                // Keep knocking while the election is open; the peer may
                // just not be up yet.
                if self.election.vote_still_pending(input.request_term, input.peer) {
                    let request = self.build_request_vote_request();
                    self.spawn_request_vote(input.peer, request, self.heartbeat_interval);
                }
            }
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        let term = self.current_term;
        let peer_ids = self.cluster.peer_ids();
        self.election
            .transition_to_leader(term, &peer_ids, self.log.last_index() + 1);
        self.publish_mode();
        self.buffer.enable();
        slog::info!(self.logger, "Won election; leading term {}", term);

        // The no-op goes through the event queue like any other append, so
        // it serializes behind whatever the new leader is already handling.
        let actor = self.actor.clone();
        tokio::task::spawn(async move {
            let _ = actor.leader_established(term).await;
        });
    }

    /// First append of every leadership: an entry with no deltas in the new
    /// term, so that entries replicated-but-uncommitted in earlier terms
    /// become committable (§5.4.2).
    pub fn handle_leader_established(&mut self, term: Term) -> Result<(), StorageError> {
        if self.election.leader_term() != Some(term) {
            return Ok(());
        }
        slog::debug!(self.logger, "Appending no-op entry for term {}", term);
        self.append_entry(LogEntry::no_op(term))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // AppendEntries, receiver side
    // ------------------------------------------------------------------

    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, StorageError> {
        if !self.cluster.contains_member(request.leader_id) {
            slog::warn!(
                self.logger,
                "Ignoring AppendEntries from unknown server {}",
                request.leader_id
            );
            return Ok(self.reject_append());
        }

        // 1. Reply false if term < currentTerm (§5.1)
        if request.term < self.current_term {
            slog::debug!(
                self.logger,
                "Rejecting AppendEntries from {}: stale term {} < {}",
                request.leader_id,
                request.term,
                self.current_term
            );
            return Ok(self.reject_append());
        }

        // 2. A valid leader for this term quiets us down.
        if request.term > self.current_term {
            self.update_term(request.term)?;
            self.step_down(Some(request.leader_id));
        } else {
            match self.election.mode() {
                Mode::Follower => {
                    self.election.note_leader(request.leader_id);
                    self.election.reset_deadline();
                }
                Mode::Candidate => {
                    // Someone else won this term's election.
                    self.step_down(Some(request.leader_id));
                }
                Mode::Leader => {
                    slog::error!(
                        self.logger,
                        "AppendEntries from {} in my own term {}; election safety violated?",
                        request.leader_id,
                        self.current_term
                    );
                    return Ok(self.reject_append());
                }
            }
        }

        // 3. Reply false if our log has no entry matching prevLogIndex /
        //    prevLogTerm (§5.3)
        if request.prev_log_index > 0 {
            match self.log.term_at(request.prev_log_index) {
                Some(term) if term == request.prev_log_term => {}
                _ => {
                    slog::debug!(
                        self.logger,
                        "Rejecting AppendEntries: no entry matching {}/{}",
                        request.prev_log_index,
                        request.prev_log_term
                    );
                    return Ok(self.reject_append());
                }
            }
        }

        // 4. Delete a conflicting entry and everything after it; 5. append
        //    whatever we don't already have (§5.3). In a correct cluster a
        //    conflict always shows as a term mismatch; comparing whole
        //    entries is the same check, just stricter.
        let leader_commit = request.leader_commit;
        let mut index = request.prev_log_index;
        let mut modified = false;
        for entry in request.entries {
            index += 1;
            match self.log.entry(index) {
                Some(existing) if *existing == entry => continue,
                Some(_) => {
                    slog::info!(
                        self.logger,
                        "Truncating conflicting log suffix from index {}",
                        index
                    );
                    self.log.truncate_suffix(index);
                    self.log.append(entry);
                    modified = true;
                }
                None => {
                    self.log.append(entry);
                    modified = true;
                }
            }
        }
        if modified {
            // Durable before the success reply leaves this server.
            self.storage.save_log(self.log.entries())?;
        }

        // 6. Advance the commit cursor and apply (§5.3)
        if leader_commit > self.commit_index {
            self.commit_index = cmp::min(leader_commit, self.log.last_index());
        }
        self.apply_committed_entries();

        Ok(AppendEntriesReply {
            term: self.current_term,
            success: true,
        })
    }

    fn reject_append(&self) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term,
            success: false,
        }
    }

    // ------------------------------------------------------------------
    // AppendEntries, leader side
    // ------------------------------------------------------------------

    /// A complete local transaction, handed over by the log-entry buffer.
    pub fn handle_append_to_log(
        &mut self,
        tx_id: TransactionId,
        deltas: Vec<StateDelta>,
    ) -> Result<(), StorageError> {
        if self.election.mode() != Mode::Leader {
            // The buffer was disabled while this event was in flight.
            slog::debug!(self.logger, "Not leader; dropping transaction {}", tx_id);
            return Ok(());
        }

        let entry = LogEntry {
            term: self.current_term,
            deltas,
        };
        let index = self.append_entry(entry)?;
        slog::debug!(
            self.logger,
            "Appended transaction {} at log index {}",
            tx_id,
            index
        );
        Ok(())
    }

    /// Leader Append-Only: the local log only ever grows here; truncation
    /// happens exclusively in the follower path.
    fn append_entry(&mut self, entry: LogEntry) -> Result<LogIndex, StorageError> {
        let index = self.log.append(entry);
        // Durable before any AppendEntries advertising this index is sent.
        self.storage.save_log(self.log.entries())?;

        for peer_id in self.cluster.peer_ids() {
            self.send_append_entries(peer_id);
        }
        // A cluster of one commits on its own majority.
        self.advance_commit_index();
        Ok(index)
    }

    /// Periodic per-peer tick. Sends whatever the peer is missing, or an
    /// empty heartbeat when it is caught up.
    pub fn handle_leader_heartbeat(&mut self, peer: ServerId, term: Term) {
        if self.election.leader_term() != Some(term) {
            return;
        }
        self.send_append_entries(peer);
    }

    fn send_append_entries(&mut self, peer_id: ServerId) {
        let now = Instant::now();
        let next_index = match self.election.peer_progress(peer_id) {
            Some(progress) if progress.in_backoff(now) => return,
            Some(progress) => progress.next_index,
            None => return,
        };

        let prev_log_index = next_index - 1;
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                slog::error!(
                    self.logger,
                    "next_index {} for peer {} is past my log",
                    next_index,
                    peer_id
                );
                return;
            }
        };

        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.cluster.me(),
            prev_log_index,
            prev_log_term,
            entries: self.log.suffix(next_index),
            leader_commit: self.commit_index,
        };

        if let Some(progress) = self.election.peer_progress(peer_id) {
            progress.push_back_heartbeat();
        }
        let client = match self.cluster.peer_client(peer_id) {
            Some(client) => client.clone(),
            None => return,
        };
        tokio::task::spawn(Self::call_peer_append_entries(
            client,
            peer_id,
            request,
            self.actor.clone(),
            self.replicate_timeout,
        ));
    }

    async fn call_peer_append_entries(
        mut client: PeerClient,
        peer: ServerId,
        request: AppendEntriesRequest,
        actor: WeakActorClient,
        rpc_timeout: Duration,
    ) {
        let request_term = request.term;
        let prev_log_index = request.prev_log_index;
        let num_entries = request.entries.len() as u64;

        let outcome = match tokio::time::timeout(rpc_timeout, client.append_entries(request)).await
        {
            Ok(Ok(reply)) => PeerRpcOutcome::Reply(reply),
            Ok(Err(_)) | Err(_) => PeerRpcOutcome::Unreachable,
        };
        let _ = actor
            .append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
                peer,
                request_term,
                prev_log_index,
                num_entries,
                outcome,
            })
            .await;
    }

    pub fn handle_append_entries_reply(
        &mut self,
        input: AppendEntriesReplyFromPeer,
    ) -> Result<(), StorageError> {
        if let PeerRpcOutcome::Reply(reply) = &input.outcome {
            if reply.term > self.current_term {
                slog::info!(
                    self.logger,
                    "AppendEntries reply from {} carries term {}; stepping down",
                    input.peer,
                    reply.term
                );
                self.update_term(reply.term)?;
                self.step_down(None);
                return Ok(());
            }
        }

        // Replies from a previous leadership stint are stale.
        if self.election.leader_term() != Some(input.request_term) {
            return Ok(());
        }

        match input.outcome {
            PeerRpcOutcome::Reply(reply) => {
                let progress = match self.election.peer_progress_mut(input.peer) {
                    Some(progress) => progress,
                    None => return Ok(()),
                };
                progress.record_reachable();

                if reply.success {
                    let matched = input.prev_log_index + input.num_entries;
                    if matched > progress.match_index {
                        progress.match_index = matched;
                        progress.next_index = matched + 1;
                    }
                    let more_to_send = progress.next_index <= self.log.last_index();
                    self.advance_commit_index();
                    if more_to_send {
                        self.send_append_entries(input.peer);
                    }
                } else {
                    // Same-term rejection: probe backwards until the logs
                    // agree (§5.3).
                    progress.next_index = cmp::max(1, progress.next_index.saturating_sub(1));
                    self.send_append_entries(input.peer);
                }
            }
            PeerRpcOutcome::Unreachable => {
                if let Some(progress) = self.election.peer_progress_mut(input.peer) {
                    progress.record_unreachable(self.heartbeat_interval, Instant::now());
                }
                // The next heartbeat tick retries once the backoff clears.
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit & apply
    // ------------------------------------------------------------------

    fn advance_commit_index(&mut self) {
        if self.election.mode() != Mode::Leader {
            return;
        }

        let mut indexes = self.election.match_indexes();
        indexes.push(self.log.last_index());
        indexes.sort_unstable();
        indexes.reverse();
        let quorum = self.cluster.cluster_size() / 2 + 1;
        let majority_index = indexes[quorum - 1];

        // Entries from earlier terms only commit through a current-term
        // entry stored on a majority (§5.4.2); the leader's initial no-op
        // guarantees such an entry exists.
        if majority_index > self.commit_index
            && self.log.term_at(majority_index) == Some(self.current_term)
        {
            slog::debug!(self.logger, "Commit index advanced to {}", majority_index);
            self.commit_index = majority_index;
        }
        self.apply_committed_entries();
    }

    /// Applies in strict ascending index order, at most once per index.
    fn apply_committed_entries(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self
                .log
                .entry(index)
                .expect("committed entry must be present in the log");
            for delta in &entry.deltas {
                self.applier.apply(delta);
            }
            let applied_tx = entry.deltas.last().map(|d| d.tx_id);
            self.last_applied = index;

            match applied_tx {
                Some(tx_id) => {
                    self.rlog.set_replicated(tx_id);
                    self.rlog.set_safe_to_commit(tx_id);
                    slog::debug!(self.logger, "Applied entry {} (tx {})", index, tx_id);
                }
                None => slog::debug!(self.logger, "Applied no-op entry {}", index),
            }
        }
    }

    // ------------------------------------------------------------------
    // Local writers
    // ------------------------------------------------------------------

    /// Resolves immediately when the transaction's fate is known, otherwise
    /// parks the callback in the replication log. Step-down and shutdown
    /// resolve parked callbacks with false.
    pub fn handle_safe_to_commit(&mut self, tx_id: TransactionId, callback: Callback<bool>) {
        if self.election.mode() != Mode::Leader {
            callback.send(false);
        } else if self.rlog.is_safe_to_commit(tx_id) {
            callback.send(true);
        } else if self.rlog.is_aborted(tx_id) {
            callback.send(false);
        } else {
            self.rlog.register_waiter(tx_id, callback.into_inner());
        }
    }

    // ------------------------------------------------------------------
    // Term & mode bookkeeping
    // ------------------------------------------------------------------

    /// Persists a strictly larger term and forgets this term's vote. The
    /// write order matters: persisting the vote reset first could let us
    /// vote twice in the old term after a crash.
    fn update_term(&mut self, new_term: Term) -> Result<(), StorageError> {
        debug_assert!(new_term > self.current_term);
        self.storage.set_current_term(new_term)?;
        self.current_term = new_term;
        self.set_voted_for(None)?;
        slog::info!(self.logger, "Term advanced to {}", new_term);
        Ok(())
    }

    fn set_voted_for(&mut self, vote: Option<ServerId>) -> Result<(), StorageError> {
        self.storage.set_voted_for(vote)?;
        self.voted_for = vote;
        Ok(())
    }

    /// Leaving leadership also wipes the leader-only machinery: the buffer
    /// drops its incomplete transactions, parked writers resolve to false,
    /// and the state machine resets so the committed prefix can replay from
    /// index 1.
    fn step_down(&mut self, known_leader: Option<ServerId>) {
        let was_leader = self.election.mode() == Mode::Leader;
        self.election.transition_to_follower(known_leader);
        if was_leader {
            slog::info!(self.logger, "Stepping down in term {}", self.current_term);
            self.buffer.disable();
            self.rlog.reset();
            self.applier.reset();
            self.last_applied = 0;
            self.apply_committed_entries();
        }
        self.publish_mode();
    }

    fn publish_mode(&self) {
        let _ = self.mode_watch.send(self.election.mode());
    }
}

#[cfg(test)]
impl<S: MetadataStorage> RaftServer<S> {
    fn mode(&self) -> Mode {
        self.election.mode()
    }

    fn term(&self) -> Term {
        self.current_term
    }

    fn vote(&self) -> Option<ServerId> {
        self.voted_for
    }

    fn committed(&self) -> LogIndex {
        self.commit_index
    }

    fn applied(&self) -> LogIndex {
        self.last_applied
    }

    fn log_data(&self) -> Vec<Term> {
        self.log.entries().iter().map(|e| e.term).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::coordination::shutdown_signal;
    use crate::delta::{DeltaOp, InMemoryGraph};
    use crate::raft::peers::MemberInfo;
    use crate::storage::InMemoryMetadataStore;
    use slog::o;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{mpsc, oneshot};

    struct SharedGraph(Arc<StdMutex<InMemoryGraph>>);

    impl DeltaApplier for SharedGraph {
        fn apply(&mut self, delta: &StateDelta) {
            self.0.lock().unwrap().apply(delta);
        }

        fn reset(&mut self) {
            self.0.lock().unwrap().reset();
        }
    }

    struct Fixture {
        server: RaftServer<InMemoryMetadataStore>,
        graph: Arc<StdMutex<InMemoryGraph>>,
        rlog: Arc<ReplicationLog>,
        mode_rx: watch::Receiver<Mode>,
        _client: ActorClient,
        _events: mpsc::Receiver<Event>,
    }

    fn fixture(cluster_size: u16) -> Fixture {
        let logger = slog::Logger::root(slog::Discard, o!());
        let (client, events) = ActorClient::new(256);

        let members = (1..=cluster_size)
            .map(|id| MemberInfo {
                id: ServerId(id),
                ip: Ipv4Addr::LOCALHOST,
                // Nothing listens here; outbound RPCs are expected to fail.
                port: 36_000 + id,
            })
            .collect();
        let cluster = ClusterTracker::new(ServerId(1), members).unwrap();

        let rlog = Arc::new(ReplicationLog::new());
        let buffer = Arc::new(LogEntryBuffer::new(
            logger.clone(),
            client.weak(),
            rlog.clone(),
        ));
        let graph = Arc::new(StdMutex::new(InMemoryGraph::new()));
        let (mode_tx, mode_rx) = watch::channel(Mode::Follower);
        let (rpc_shutdown, _signal) = shutdown_signal();

        let server = RaftServer::new(RaftConfig {
            logger,
            cluster,
            storage: InMemoryMetadataStore::new(),
            rlog: rlog.clone(),
            buffer,
            applier: Box::new(SharedGraph(graph.clone())),
            actor: client.weak(),
            mode_watch: mode_tx,
            rpc_shutdown,
            heartbeat_interval: Duration::from_millis(50),
            // Long enough that the background election timer never fires
            // during a test; tests drive timeouts by hand.
            election_timeout_min: Duration::from_secs(60),
            election_timeout_max: Duration::from_secs(120),
            replicate_timeout: Duration::from_millis(50),
        })
        .unwrap();

        Fixture {
            server,
            graph,
            rlog,
            mode_rx,
            _client: client,
            _events: events,
        }
    }

    fn tx_entry(term: u64, tx_id: u64) -> LogEntry {
        LogEntry {
            term: Term(term),
            deltas: vec![
                StateDelta::begin(tx_id),
                StateDelta {
                    tx_id,
                    op: DeltaOp::CreateVertex { gid: tx_id },
                },
                StateDelta::commit(tx_id),
            ],
        }
    }

    fn vote_request(term: u64, candidate: u16, last_index: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term: Term(term),
            candidate_id: ServerId(candidate),
            last_log_index: last_index,
            last_log_term: Term(last_term),
        }
    }

    fn append_request(
        term: u64,
        leader: u16,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: Term(term),
            leader_id: ServerId(leader),
            prev_log_index: prev_index,
            prev_log_term: Term(prev_term),
            entries,
            leader_commit: commit,
        }
    }

    fn granted_reply(peer: u16, request_term: u64) -> RequestVoteReplyFromPeer {
        RequestVoteReplyFromPeer {
            peer: ServerId(peer),
            request_term: Term(request_term),
            outcome: PeerRpcOutcome::Reply(RequestVoteReply {
                term: Term(request_term),
                vote_granted: true,
            }),
        }
    }

    fn success_append_reply(
        peer: u16,
        request_term: u64,
        prev_index: u64,
        num_entries: u64,
    ) -> AppendEntriesReplyFromPeer {
        AppendEntriesReplyFromPeer {
            peer: ServerId(peer),
            request_term: Term(request_term),
            prev_log_index: prev_index,
            num_entries,
            outcome: PeerRpcOutcome::Reply(AppendEntriesReply {
                term: Term(request_term),
                success: true,
            }),
        }
    }

    /// Runs server 1 through a full election in a 3-server cluster,
    /// including the no-op append.
    fn make_leader(f: &mut Fixture) -> Term {
        f.server.handle_election_timeout().unwrap();
        let term = f.server.term();
        f.server.handle_request_vote_reply(granted_reply(2, term.as_u64())).unwrap();
        assert_eq!(f.server.mode(), Mode::Leader);
        f.server.handle_leader_established(term).unwrap();
        term
    }

    // ---------------- vote granting ----------------

    #[tokio::test]
    async fn grants_vote_and_persists_it() {
        let mut f = fixture(3);

        let reply = f.server.handle_request_vote(vote_request(1, 2, 0, 0)).unwrap();
        assert!(reply.vote_granted);
        assert_eq!(reply.term, Term(1));
        assert_eq!(f.server.term(), Term(1));
        assert_eq!(f.server.vote(), Some(ServerId(2)));
        assert_eq!(f.server.storage.voted_for().unwrap(), Some(ServerId(2)));
        assert_eq!(f.server.storage.current_term().unwrap(), Term(1));
    }

    #[tokio::test]
    async fn denies_vote_for_stale_term() {
        let mut f = fixture(3);
        f.server.handle_request_vote(vote_request(5, 2, 0, 0)).unwrap();

        let reply = f.server.handle_request_vote(vote_request(4, 3, 0, 0)).unwrap();
        assert!(!reply.vote_granted);
        // The denial carries our term so the stale candidate catches up.
        assert_eq!(reply.term, Term(5));
    }

    #[tokio::test]
    async fn denies_second_vote_in_same_term() {
        let mut f = fixture(3);
        assert!(f.server.handle_request_vote(vote_request(1, 2, 0, 0)).unwrap().vote_granted);

        let reply = f.server.handle_request_vote(vote_request(1, 3, 0, 0)).unwrap();
        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn repeats_vote_for_same_candidate() {
        let mut f = fixture(3);
        assert!(f.server.handle_request_vote(vote_request(1, 2, 0, 0)).unwrap().vote_granted);
        // Retried request (e.g. the first reply was lost) is granted again.
        assert!(f.server.handle_request_vote(vote_request(1, 2, 0, 0)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn denies_vote_when_candidate_log_is_behind() {
        let mut f = fixture(3);
        f.server
            .handle_append_entries(append_request(1, 2, 0, 0, vec![tx_entry(1, 10)], 0))
            .unwrap();

        // Candidate with an empty log in a later term.
        let reply = f.server.handle_request_vote(vote_request(2, 3, 0, 0)).unwrap();
        assert!(!reply.vote_granted);

        // Candidate whose log is at least as up to date.
        let reply = f.server.handle_request_vote(vote_request(2, 3, 1, 1)).unwrap();
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn ignores_vote_request_from_unknown_server() {
        let mut f = fixture(3);
        let reply = f.server.handle_request_vote(vote_request(1, 9, 0, 0)).unwrap();
        assert!(!reply.vote_granted);
        assert_eq!(f.server.term(), Term(0));
    }

    // ---------------- append entries, receiver side ----------------

    #[tokio::test]
    async fn rejects_append_entries_with_stale_term() {
        let mut f = fixture(3);
        f.server.handle_request_vote(vote_request(5, 2, 0, 0)).unwrap();

        let reply = f.server
            .handle_append_entries(append_request(3, 3, 0, 0, vec![], 0))
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.term, Term(5));
    }

    #[tokio::test]
    async fn appends_and_applies_committed_entries() {
        let mut f = fixture(3);

        let reply = f.server
            .handle_append_entries(append_request(
                1,
                2,
                0,
                0,
                vec![LogEntry::no_op(Term(1)), tx_entry(1, 10)],
                2,
            ))
            .unwrap();

        assert!(reply.success);
        assert_eq!(f.server.committed(), 2);
        assert_eq!(f.server.applied(), 2);
        assert!(f.graph.lock().unwrap().has_vertex(10));
        assert!(f.rlog.is_replicated(10));
        assert!(f.rlog.is_safe_to_commit(10));
    }

    #[tokio::test]
    async fn commit_index_is_capped_by_local_log() {
        let mut f = fixture(3);
        let reply = f.server
            .handle_append_entries(append_request(1, 2, 0, 0, vec![tx_entry(1, 10)], 9))
            .unwrap();
        assert!(reply.success);
        assert_eq!(f.server.committed(), 1);
    }

    #[tokio::test]
    async fn rejects_append_entries_with_missing_previous_entry() {
        let mut f = fixture(3);
        let reply = f.server
            .handle_append_entries(append_request(1, 2, 5, 1, vec![tx_entry(1, 10)], 0))
            .unwrap();
        assert!(!reply.success);
        assert_eq!(f.server.log_data().len(), 0);
    }

    #[tokio::test]
    async fn truncates_conflicting_suffix() {
        let mut f = fixture(3);

        // Follower log: [(1,A), (1,B), (2,X)]
        f.server
            .handle_append_entries(append_request(
                2,
                2,
                0,
                0,
                vec![tx_entry(1, 1), tx_entry(1, 2), tx_entry(2, 3)],
                0,
            ))
            .unwrap();
        assert_eq!(f.server.log_data(), vec![Term(1), Term(1), Term(2)]);

        // New leader disagrees from index 3 on: entries [(2,Y), (3,Z)]
        // after prev 2/1.
        let reply = f.server
            .handle_append_entries(append_request(
                3,
                3,
                2,
                1,
                vec![tx_entry(2, 4), tx_entry(3, 5)],
                0,
            ))
            .unwrap();

        assert!(reply.success);
        assert_eq!(
            f.server.log_data(),
            vec![Term(1), Term(1), Term(2), Term(3)]
        );
        // The replacement suffix is durable.
        assert_eq!(f.server.storage.load_log().unwrap().len(), 4);
        assert_eq!(f.server.storage.load_log().unwrap()[2], tx_entry(2, 4));
    }

    #[tokio::test]
    async fn duplicate_append_entries_is_idempotent() {
        let mut f = fixture(3);
        let request = append_request(1, 2, 0, 0, vec![tx_entry(1, 10)], 1);

        f.server.handle_append_entries(request.clone()).unwrap();
        let reply = f.server.handle_append_entries(request).unwrap();

        assert!(reply.success);
        assert_eq!(f.server.log_data(), vec![Term(1)]);
        assert_eq!(f.server.applied(), 1);
        assert_eq!(f.graph.lock().unwrap().vertex_count(), 1);
    }

    #[tokio::test]
    async fn candidate_steps_down_for_current_term_leader() {
        let mut f = fixture(3);
        f.server.handle_election_timeout().unwrap();
        assert_eq!(f.server.mode(), Mode::Candidate);
        let term = f.server.term();

        let reply = f.server
            .handle_append_entries(append_request(term.as_u64(), 2, 0, 0, vec![], 0))
            .unwrap();
        assert!(reply.success);
        assert_eq!(f.server.mode(), Mode::Follower);
    }

    // ---------------- elections ----------------

    #[tokio::test]
    async fn election_timeout_starts_campaign() {
        let mut f = fixture(3);
        f.server.handle_election_timeout().unwrap();

        assert_eq!(f.server.mode(), Mode::Candidate);
        assert_eq!(f.server.term(), Term(1));
        assert_eq!(f.server.vote(), Some(ServerId(1)));
        assert_eq!(f.server.storage.current_term().unwrap(), Term(1));
    }

    #[tokio::test]
    async fn majority_of_votes_wins_election() {
        let mut f = fixture(3);
        f.server.handle_election_timeout().unwrap();
        assert_eq!(f.server.mode(), Mode::Candidate);

        f.server.handle_request_vote_reply(granted_reply(2, 1)).unwrap();
        assert_eq!(f.server.mode(), Mode::Leader);
        assert_eq!(*f.mode_rx.borrow(), Mode::Leader);
    }

    #[tokio::test]
    async fn stale_votes_do_not_elect() {
        let mut f = fixture(5);
        f.server.handle_election_timeout().unwrap();
        // Vote for an election that is already over.
        f.server.handle_request_vote_reply(granted_reply(2, 0)).unwrap();
        assert_eq!(f.server.mode(), Mode::Candidate);
    }

    #[tokio::test]
    async fn single_server_cluster_elects_itself() {
        let mut f = fixture(1);
        f.server.handle_election_timeout().unwrap();
        assert_eq!(f.server.mode(), Mode::Leader);

        // The no-op commits instantly: the majority is this server alone.
        f.server.handle_leader_established(Term(1)).unwrap();
        assert_eq!(f.server.committed(), 1);
        assert_eq!(f.server.applied(), 1);
    }

    #[tokio::test]
    async fn leader_appends_no_op_on_taking_office() {
        let mut f = fixture(3);
        let term = make_leader(&mut f);

        assert_eq!(f.server.log_data(), vec![term]);
        // Not committed yet: no majority has stored it.
        assert_eq!(f.server.committed(), 0);
    }

    #[tokio::test]
    async fn repeated_election_timeouts_bump_the_term() {
        let mut f = fixture(3);
        f.server.handle_election_timeout().unwrap();
        f.server.handle_election_timeout().unwrap();
        assert_eq!(f.server.mode(), Mode::Candidate);
        assert_eq!(f.server.term(), Term(2));
    }

    // ---------------- leader replication & commit ----------------

    #[tokio::test]
    async fn no_op_commit_also_commits_prior_term_entries() {
        let mut f = fixture(3);

        // Entries from term 1, replicated to us by the old leader but never
        // committed.
        f.server
            .handle_append_entries(append_request(
                1,
                2,
                0,
                0,
                vec![tx_entry(1, 10), tx_entry(1, 11)],
                0,
            ))
            .unwrap();
        assert_eq!(f.server.committed(), 0);

        // We win term 2 and append our no-op at index 3.
        let term = make_leader(&mut f);
        assert_eq!(term, Term(2));
        assert_eq!(f.server.log_data(), vec![Term(1), Term(1), Term(2)]);

        // Peer 2 stores everything up to the no-op; the no-op commit drags
        // the term-1 entries along with it.
        f.server
            .handle_append_entries_reply(success_append_reply(2, 2, 0, 3))
            .unwrap();
        assert_eq!(f.server.committed(), 3);
        assert_eq!(f.server.applied(), 3);
        assert!(f.graph.lock().unwrap().has_vertex(10));
        assert!(f.graph.lock().unwrap().has_vertex(11));
        assert!(f.rlog.is_safe_to_commit(10));
        assert!(f.rlog.is_safe_to_commit(11));
    }

    #[tokio::test]
    async fn prior_term_entries_alone_do_not_commit() {
        let mut f = fixture(3);
        f.server
            .handle_append_entries(append_request(
                1,
                2,
                0,
                0,
                vec![tx_entry(1, 10), tx_entry(1, 11)],
                0,
            ))
            .unwrap();
        let term = make_leader(&mut f);
        assert_eq!(term, Term(2));

        // Peer 2 confirms only the term-1 prefix, not the no-op.
        f.server
            .handle_append_entries_reply(success_append_reply(2, 2, 0, 2))
            .unwrap();
        assert_eq!(f.server.committed(), 0);
        assert_eq!(f.server.applied(), 0);
    }

    #[tokio::test]
    async fn local_append_replicates_and_commits_on_majority() {
        let mut f = fixture(3);
        let term = make_leader(&mut f);

        // no-op committed via peer 2.
        f.server
            .handle_append_entries_reply(success_append_reply(2, term.as_u64(), 0, 1))
            .unwrap();
        assert_eq!(f.server.committed(), 1);

        // Local transaction 42 lands at index 2.
        f.server
            .handle_append_to_log(42, tx_entry(term.as_u64(), 42).deltas)
            .unwrap();
        assert_eq!(f.server.log_data().len(), 2);
        assert_eq!(f.server.committed(), 1);

        f.server
            .handle_append_entries_reply(success_append_reply(2, term.as_u64(), 1, 1))
            .unwrap();
        assert_eq!(f.server.committed(), 2);
        assert!(f.rlog.is_replicated(42));
        assert!(f.rlog.is_safe_to_commit(42));
        assert!(f.graph.lock().unwrap().has_vertex(42));
    }

    #[tokio::test]
    async fn minority_acknowledgement_does_not_commit() {
        let mut f = fixture(5);
        f.server.handle_election_timeout().unwrap();
        f.server.handle_request_vote_reply(granted_reply(2, 1)).unwrap();
        f.server.handle_request_vote_reply(granted_reply(3, 1)).unwrap();
        assert_eq!(f.server.mode(), Mode::Leader);
        f.server.handle_leader_established(Term(1)).unwrap();

        // Only one of four peers confirms: 2 of 5 servers have the entry.
        f.server
            .handle_append_entries_reply(success_append_reply(2, 1, 0, 1))
            .unwrap();
        assert_eq!(f.server.committed(), 0);

        // A second peer makes it 3 of 5.
        f.server
            .handle_append_entries_reply(success_append_reply(3, 1, 0, 1))
            .unwrap();
        assert_eq!(f.server.committed(), 1);
    }

    #[tokio::test]
    async fn failed_append_probes_backwards() {
        let mut f = fixture(3);
        let term = make_leader(&mut f);
        // Peer 2 confirms the no-op, so next_index moves to 2.
        f.server
            .handle_append_entries_reply(success_append_reply(2, term.as_u64(), 0, 1))
            .unwrap();
        f.server
            .handle_append_to_log(42, tx_entry(term.as_u64(), 42).deltas)
            .unwrap();
        let next_before = f.server.election.peer_progress(ServerId(2)).unwrap().next_index;
        assert_eq!(next_before, 2);

        f.server
            .handle_append_entries_reply(AppendEntriesReplyFromPeer {
                peer: ServerId(2),
                request_term: term,
                prev_log_index: next_before - 1,
                num_entries: 1,
                outcome: PeerRpcOutcome::Reply(AppendEntriesReply {
                    term,
                    success: false,
                }),
            })
            .unwrap();

        let next_after = f.server.election.peer_progress(ServerId(2)).unwrap().next_index;
        assert_eq!(next_after, next_before - 1);
    }

    #[tokio::test]
    async fn unreachable_peer_goes_into_backoff() {
        let mut f = fixture(3);
        let term = make_leader(&mut f);

        f.server
            .handle_append_entries_reply(AppendEntriesReplyFromPeer {
                peer: ServerId(2),
                request_term: term,
                prev_log_index: 0,
                num_entries: 1,
                outcome: PeerRpcOutcome::Unreachable,
            })
            .unwrap();

        let progress = f.server.election.peer_progress(ServerId(2)).unwrap();
        assert!(progress.in_backoff(Instant::now()));
    }

    // ---------------- term catch-up / step-down ----------------

    #[tokio::test]
    async fn higher_term_in_append_reply_forces_step_down() {
        let mut f = fixture(3);
        // Leader of term 5 after a few lost elections.
        for _ in 0..5 {
            f.server.handle_election_timeout().unwrap();
        }
        f.server.handle_request_vote_reply(granted_reply(2, 5)).unwrap();
        assert_eq!(f.server.mode(), Mode::Leader);

        // A partitioned peer advanced to term 7 through failed elections.
        f.server
            .handle_append_entries_reply(AppendEntriesReplyFromPeer {
                peer: ServerId(3),
                request_term: Term(5),
                prev_log_index: 0,
                num_entries: 0,
                outcome: PeerRpcOutcome::Reply(AppendEntriesReply {
                    term: Term(7),
                    success: false,
                }),
            })
            .unwrap();

        assert_eq!(f.server.mode(), Mode::Follower);
        assert_eq!(f.server.term(), Term(7));
        assert_eq!(f.server.vote(), None);
        assert_eq!(f.server.storage.current_term().unwrap(), Term(7));
    }

    #[tokio::test]
    async fn higher_term_in_vote_reply_forces_step_down() {
        let mut f = fixture(3);
        f.server.handle_election_timeout().unwrap();

        f.server
            .handle_request_vote_reply(RequestVoteReplyFromPeer {
                peer: ServerId(2),
                request_term: Term(1),
                outcome: PeerRpcOutcome::Reply(RequestVoteReply {
                    term: Term(4),
                    vote_granted: false,
                }),
            })
            .unwrap();

        assert_eq!(f.server.mode(), Mode::Follower);
        assert_eq!(f.server.term(), Term(4));
    }

    #[tokio::test]
    async fn step_down_resets_state_machine_and_replays() {
        let mut f = fixture(3);
        let term = make_leader(&mut f);

        f.server
            .handle_append_entries_reply(success_append_reply(2, term.as_u64(), 0, 1))
            .unwrap();
        f.server
            .handle_append_to_log(42, tx_entry(term.as_u64(), 42).deltas)
            .unwrap();
        f.server
            .handle_append_entries_reply(success_append_reply(2, term.as_u64(), 1, 1))
            .unwrap();
        assert_eq!(f.server.applied(), 2);
        assert_eq!(f.graph.lock().unwrap().vertex_count(), 1);

        // A new leader exists in a later term.
        let reply = f.server
            .handle_append_entries(append_request(term.as_u64() + 1, 2, 2, term.as_u64(), vec![], 0))
            .unwrap();
        assert!(reply.success);
        assert_eq!(f.server.mode(), Mode::Follower);

        // The state machine was reset and the committed prefix replayed.
        assert_eq!(f.server.applied(), 2);
        assert_eq!(f.graph.lock().unwrap().vertex_count(), 1);
        assert!(f.graph.lock().unwrap().has_vertex(42));
    }

    // ---------------- safe to commit ----------------

    #[tokio::test]
    async fn safe_to_commit_false_on_follower() {
        let mut f = fixture(3);
        let (tx, rx) = oneshot::channel();
        f.server.handle_safe_to_commit(42, Callback::for_test(tx));
        assert_eq!(rx.await, Ok(false));
    }

    #[tokio::test]
    async fn safe_to_commit_true_once_applied() {
        let mut f = fixture(3);
        let term = make_leader(&mut f);
        f.server
            .handle_append_to_log(42, tx_entry(term.as_u64(), 42).deltas)
            .unwrap();

        let (tx, rx) = oneshot::channel();
        f.server.handle_safe_to_commit(42, Callback::for_test(tx));

        // Majority confirms no-op + entry; apply marks tx 42 safe.
        f.server
            .handle_append_entries_reply(success_append_reply(2, term.as_u64(), 0, 2))
            .unwrap();
        assert_eq!(rx.await, Ok(true));
    }

    #[tokio::test]
    async fn safe_to_commit_unblocks_on_step_down() {
        let mut f = fixture(3);
        let term = make_leader(&mut f);
        f.server
            .handle_append_to_log(77, tx_entry(term.as_u64(), 77).deltas)
            .unwrap();

        let (tx, rx) = oneshot::channel();
        f.server.handle_safe_to_commit(77, Callback::for_test(tx));

        // Before any majority forms, a higher term appears.
        f.server
            .handle_request_vote(vote_request(term.as_u64() + 1, 3, 9, term.as_u64()))
            .unwrap();
        assert_eq!(f.server.mode(), Mode::Follower);
        assert_eq!(rx.await, Ok(false));
    }
}
