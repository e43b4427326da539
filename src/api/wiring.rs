use crate::actor::{ActorClient, RaftActor};
use crate::api::client::ConsensusClient;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::coordination::{shutdown_signal, RpcServer};
use crate::delta::DeltaApplier;
use crate::raft::{
    ClusterTracker, InvalidCluster, LogEntryBuffer, MemberInfo, Mode, RaftConfig, RaftServer,
    ReplicationLog, ServerId,
};
use crate::storage::{DurableMetadataStore, StorageError};
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

const EVENT_QUEUE_SIZE: usize = 64;

pub struct ConsensusConfig {
    pub server_id: ServerId,
    /// All cluster members, this server included. The cluster size is fixed
    /// for the lifetime of the deployment.
    pub cluster_members: Vec<MemberInfo>,
    /// Directory for the persistent metadata store.
    pub durability_dir: PathBuf,
    pub options: RaftOptions,
    pub logger: slog::Logger,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("invalid cluster config: {0}")]
    InvalidClusterInfo(#[from] InvalidCluster),
    #[error("illegal raft options: {0}")]
    IllegalOptions(&'static str),
    #[error("metadata store unusable: {0}")]
    Storage(#[from] StorageError),
}

/// Constructs and starts the whole consensus stack: metadata store,
/// replication log, log-entry buffer, the Raft server with its event loop,
/// and the RPC server. Must be called from within a tokio runtime.
///
/// The server recovers its term, vote and log from `durability_dir` and
/// joins the cluster as a follower.
pub fn start_consensus(
    config: ConsensusConfig,
    applier: Box<dyn DeltaApplier>,
) -> Result<ConsensusClient, StartError> {
    let logger = config
        .logger
        .new(slog::o!("server_id" => config.server_id.as_u16()));

    let options = RaftOptionsValidated::try_from(config.options).map_err(StartError::IllegalOptions)?;

    let my_rpc_addr = config
        .cluster_members
        .iter()
        .find(|member| member.id == config.server_id)
        .map(|member| SocketAddr::V4(SocketAddrV4::new(member.ip, member.port)));
    let cluster = ClusterTracker::new(config.server_id, config.cluster_members)?;
    let my_rpc_addr = my_rpc_addr.expect("validated cluster always contains me");

    let storage = DurableMetadataStore::open(&config.durability_dir)?;

    let (actor_client, event_queue) = ActorClient::new(EVENT_QUEUE_SIZE);
    let rlog = Arc::new(ReplicationLog::new());
    let buffer = Arc::new(LogEntryBuffer::new(
        logger.clone(),
        actor_client.weak(),
        rlog.clone(),
    ));
    let (mode_watch, mode) = watch::channel(Mode::Follower);
    let (rpc_shutdown_handle, rpc_shutdown_signal) = shutdown_signal();

    let server = RaftServer::new(RaftConfig {
        logger: logger.clone(),
        cluster,
        storage,
        rlog: rlog.clone(),
        buffer: buffer.clone(),
        applier,
        actor: actor_client.weak(),
        mode_watch,
        rpc_shutdown: rpc_shutdown_handle,
        heartbeat_interval: options.heartbeat_interval,
        election_timeout_min: options.leader_timeout_min,
        election_timeout_max: options.leader_timeout_max,
        replicate_timeout: options.replicate_timeout,
    })?;

    let actor = RaftActor::new(logger.clone(), event_queue, server);
    tokio::task::spawn(actor.run_event_loop());

    let rpc_server = RpcServer::new(logger, actor_client.weak());
    tokio::task::spawn(rpc_server.run(my_rpc_addr, rpc_shutdown_signal));

    Ok(ConsensusClient {
        actor: actor_client,
        buffer,
        rlog,
        mode,
    })
}
