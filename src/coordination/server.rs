use crate::actor::WeakActorClient;
use crate::delta;
use crate::grpc::raft_rpc_server::{RaftRpc, RaftRpcServer};
use crate::grpc::{
    ProtoAppendEntriesReply, ProtoAppendEntriesReq, ProtoRequestVoteReply, ProtoRequestVoteReq,
};
use crate::raft::{AppendEntriesRequest, LogEntry, RequestVoteRequest, ServerId, Term};
use crate::coordination::shutdown::RpcServerShutdownSignal;
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Inbound side of the coordination layer. Converts wire messages into the
/// server's typed requests, hands them to the Raft task, and converts the
/// replies back.
pub struct RpcServer {
    logger: slog::Logger,
    local_server: WeakActorClient,
}

impl RpcServer {
    pub fn new(logger: slog::Logger, local_server: WeakActorClient) -> Self {
        RpcServer {
            logger,
            local_server,
        }
    }

    pub async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Raft RPC server listening on {:?}", socket_addr);

        let result = Server::builder()
            .add_service(RaftRpcServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Raft RPC server exited: {:?}", result);
    }

    fn convert_server_id(raw: u32) -> Result<ServerId, Status> {
        u16::try_from(raw)
            .ok()
            .filter(|&id| id > 0)
            .map(ServerId)
            .ok_or_else(|| Status::invalid_argument("server id out of range"))
    }

    fn convert_entries(raw: Vec<crate::grpc::ProtoLogEntry>) -> Result<Vec<LogEntry>, Status> {
        let mut entries = Vec::with_capacity(raw.len());
        for proto_entry in raw {
            let deltas = delta::decode_batch(&proto_entry.deltas)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            entries.push(LogEntry {
                term: Term(proto_entry.term),
                deltas,
            });
        }
        Ok(entries)
    }
}

#[tonic::async_trait]
impl RaftRpc for RpcServer {
    async fn request_vote(
        &self,
        rpc_request: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteReply>, Status> {
        let proto = rpc_request.into_inner();
        slog::debug!(self.logger, "Wire request: {:?}", proto);

        let request = RequestVoteRequest {
            term: Term(proto.term),
            candidate_id: Self::convert_server_id(proto.candidate_id)?,
            last_log_index: proto.last_log_index,
            last_log_term: Term(proto.last_log_term),
        };

        let reply = self
            .local_server
            .request_vote(request)
            .await
            .map_err(|_| Status::unavailable("raft server is shutting down"))?;

        slog::debug!(self.logger, "Wire reply: {:?}", reply);
        Ok(Response::new(ProtoRequestVoteReply {
            term: reply.term.as_u64(),
            vote_granted: reply.vote_granted,
        }))
    }

    async fn append_entries(
        &self,
        rpc_request: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesReply>, Status> {
        let proto = rpc_request.into_inner();
        slog::debug!(
            self.logger,
            "Wire request: AppendEntries(term={}, leader={}, prev={}/{}, entries={}, commit={})",
            proto.term,
            proto.leader_id,
            proto.prev_log_index,
            proto.prev_log_term,
            proto.entries.len(),
            proto.leader_commit
        );

        let request = AppendEntriesRequest {
            term: Term(proto.term),
            leader_id: Self::convert_server_id(proto.leader_id)?,
            prev_log_index: proto.prev_log_index,
            prev_log_term: Term(proto.prev_log_term),
            entries: Self::convert_entries(proto.entries)?,
            leader_commit: proto.leader_commit,
        };

        let reply = self
            .local_server
            .append_entries(request)
            .await
            .map_err(|_| Status::unavailable("raft server is shutting down"))?;

        slog::debug!(self.logger, "Wire reply: {:?}", reply);
        Ok(Response::new(ProtoAppendEntriesReply {
            term: reply.term.as_u64(),
            success: reply.success,
        }))
    }
}
