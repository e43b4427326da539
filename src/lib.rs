mod actor;
mod api;
mod coordination;
mod delta;
mod grpc {
    include!("../generated/raft.rs");
}
mod raft;
mod storage;

pub use api::start_consensus;
pub use api::ConsensusClient;
pub use api::ConsensusConfig;
pub use api::RaftOptions;
pub use api::StartError;
pub use delta::DeltaApplier;
pub use delta::DeltaOp;
pub use delta::Gid;
pub use delta::InMemoryGraph;
pub use delta::PropertyValue;
pub use delta::StateDelta;
pub use delta::TransactionId;
pub use raft::InvalidCluster;
pub use raft::LogEntry;
pub use raft::LogIndex;
pub use raft::MemberInfo;
pub use raft::ServerId;
pub use raft::Term;
pub use storage::DurableMetadataStore;
pub use storage::InMemoryMetadataStore;
pub use storage::MetadataStorage;
pub use storage::StorageError;
