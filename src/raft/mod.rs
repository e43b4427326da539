mod election;
mod log;
mod log_entry_buffer;
mod messages;
mod peers;
mod replication_log;
mod server;
mod timers;

pub use election::Mode;
pub use log::LogEntry;
pub use log::LogIndex;
pub use log::RaftLog;
pub use log::Term;
pub use log_entry_buffer::LogEntryBuffer;
pub use messages::AppendEntriesReply;
pub use messages::AppendEntriesReplyFromPeer;
pub use messages::AppendEntriesRequest;
pub use messages::PeerRpcOutcome;
pub use messages::RequestVoteReply;
pub use messages::RequestVoteReplyFromPeer;
pub use messages::RequestVoteRequest;
pub use peers::ClusterTracker;
pub use peers::InvalidCluster;
pub use peers::MemberInfo;
pub use peers::ServerId;
pub use replication_log::ReplicationLog;
pub use server::RaftConfig;
pub use server::RaftServer;
