mod applier;

pub use applier::DeltaApplier;
pub use applier::InMemoryGraph;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Transaction ids are handed out by the storage engine's transaction
/// engine; we only ever compare and garbage-collect them.
pub type TransactionId = u64;

/// Global id of a vertex or edge in the graph.
pub type Gid = u64;

/// StateDelta is a single mutation record produced by a local writing
/// transaction. The Raft core treats every delta as opaque except the three
/// transaction markers, which drive the log-entry buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub tx_id: TransactionId,
    pub op: DeltaOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaOp {
    TransactionBegin,
    TransactionCommit,
    TransactionAbort,
    CreateVertex { gid: Gid },
    RemoveVertex { gid: Gid },
    AddLabel { gid: Gid, label: String },
    RemoveLabel { gid: Gid, label: String },
    SetProperty { gid: Gid, key: String, value: PropertyValue },
    CreateEdge { gid: Gid, from: Gid, to: Gid, edge_type: String },
    RemoveEdge { gid: Gid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl StateDelta {
    pub fn begin(tx_id: TransactionId) -> Self {
        StateDelta {
            tx_id,
            op: DeltaOp::TransactionBegin,
        }
    }

    pub fn commit(tx_id: TransactionId) -> Self {
        StateDelta {
            tx_id,
            op: DeltaOp::TransactionCommit,
        }
    }

    pub fn abort(tx_id: TransactionId) -> Self {
        StateDelta {
            tx_id,
            op: DeltaOp::TransactionAbort,
        }
    }
}

/// Encodes a batch of deltas belonging to one transaction for the wire.
pub fn encode_batch(deltas: &[StateDelta]) -> Bytes {
    let encoded = bincode::serialize(deltas).expect("state deltas are always encodable");
    Bytes::from(encoded)
}

/// Decodes a wire batch back into deltas.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<StateDelta>, DecodeError> {
    bincode::deserialize(bytes).map_err(DecodeError)
}

#[derive(Debug, thiserror::Error)]
#[error("malformed state delta batch: {0}")]
pub struct DecodeError(#[source] bincode::Error);
