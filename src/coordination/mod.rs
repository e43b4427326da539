//! Coordination between cluster members: the gRPC server for inbound Raft
//! RPCs and the per-peer clients for outbound ones. Four message kinds
//! travel here, RequestVote and AppendEntries with their replies; every
//! message carries the sender's current term.

mod client;
mod server;
mod shutdown;

pub use client::PeerClient;
pub use server::RpcServer;
pub use shutdown::shutdown_signal;
pub use shutdown::RpcServerShutdownHandle;
pub use shutdown::RpcServerShutdownSignal;
