//! Typed request/reply pairs exchanged between servers. The coordination
//! layer converts these to and from the wire protos; the Raft server only
//! ever sees these.

use crate::raft::log::{LogEntry, LogIndex, Term};
use crate::raft::peers::ServerId;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

/// Outcome of one outbound RPC attempt, as reported back to the server task
/// by the task that performed the call.
#[derive(Debug)]
pub enum PeerRpcOutcome<R> {
    Reply(R),
    /// Transport failure or timeout. Never propagated to local writers;
    /// feeds the per-peer backoff.
    Unreachable,
}

#[derive(Debug)]
pub struct RequestVoteReplyFromPeer {
    pub peer: ServerId,
    /// Term the request was sent with, to discard replies from elections
    /// that are already over.
    pub request_term: Term,
    pub outcome: PeerRpcOutcome<RequestVoteReply>,
}

#[derive(Debug)]
pub struct AppendEntriesReplyFromPeer {
    pub peer: ServerId,
    pub request_term: Term,
    /// prev_log_index of the request, so a success can advance match_index
    /// without re-deriving what was sent.
    pub prev_log_index: LogIndex,
    pub num_entries: u64,
    pub outcome: PeerRpcOutcome<AppendEntriesReply>,
}
