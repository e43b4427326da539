use crate::delta;
use crate::grpc::raft_rpc_client::RaftRpcClient;
use crate::grpc::{ProtoAppendEntriesReq, ProtoLogEntry, ProtoRequestVoteReq};
use crate::raft::{
    AppendEntriesReply, AppendEntriesRequest, RequestVoteReply, RequestVoteRequest, Term,
};
use tonic::transport::{Channel, Endpoint, Uri};

/// Outbound RPC client for one peer.
///
/// The underlying channel connects lazily and reconnects on demand, so a
/// replica starts up fine while its peers are still down; until a peer is
/// reachable every call fails fast, which is exactly the signal the
/// leader's backoff feeds on.
#[derive(Clone)]
pub struct PeerClient {
    client: RaftRpcClient<Channel>,
}

impl PeerClient {
    pub fn new(uri: Uri) -> Self {
        let channel = Endpoint::from(uri).connect_lazy();
        PeerClient {
            client: RaftRpcClient::new(channel),
        }
    }

    pub async fn request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply, tonic::Status> {
        let proto = ProtoRequestVoteReq {
            term: request.term.as_u64(),
            candidate_id: u32::from(request.candidate_id.as_u16()),
            last_log_index: request.last_log_index,
            last_log_term: request.last_log_term.as_u64(),
        };

        let reply = self.client.request_vote(proto).await?.into_inner();
        Ok(RequestVoteReply {
            term: Term(reply.term),
            vote_granted: reply.vote_granted,
        })
    }

    pub async fn append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, tonic::Status> {
        let entries = request
            .entries
            .iter()
            .map(|entry| ProtoLogEntry {
                term: entry.term.as_u64(),
                deltas: delta::encode_batch(&entry.deltas).to_vec(),
            })
            .collect();

        let proto = ProtoAppendEntriesReq {
            term: request.term.as_u64(),
            leader_id: u32::from(request.leader_id.as_u16()),
            prev_log_index: request.prev_log_index,
            prev_log_term: request.prev_log_term.as_u64(),
            entries,
            leader_commit: request.leader_commit,
        };

        let reply = self.client.append_entries(proto).await?.into_inner();
        Ok(AppendEntriesReply {
            term: Term(reply.term),
            success: reply.success,
        })
    }
}
