//! Client-facing surface: configuration, startup wiring and the handle the
//! database layer uses to talk to replication.

mod client;
mod options;
mod wiring;

pub use client::ConsensusClient;
pub use options::RaftOptions;
pub use wiring::start_consensus;
pub use wiring::ConsensusConfig;
pub use wiring::StartError;
