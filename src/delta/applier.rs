use crate::delta::{DeltaOp, Gid, PropertyValue, StateDelta};
use std::collections::{HashMap, HashSet};

/// DeltaApplier is the graph storage engine's view of replication: committed
/// deltas are handed over in log order, exactly once per log index.
///
/// `apply` must be deterministic and total for any delta sequence that
/// corresponds to a legal interleaving of transactions; applier failures are
/// signalled out-of-band and treated as fatal. `reset` is invoked on every
/// Leader to Follower transition so the state machine returns to empty before
/// the committed prefix is replayed from index 1.
pub trait DeltaApplier: Send {
    fn apply(&mut self, delta: &StateDelta);

    fn reset(&mut self);
}

/// In-memory reference applier. The real database wires its storage engine
/// in here; this one exists for tests, demos and single-process experiments.
#[derive(Default)]
pub struct InMemoryGraph {
    vertices: HashMap<Gid, Vertex>,
    edges: HashMap<Gid, Edge>,
}

#[derive(Default)]
struct Vertex {
    labels: HashSet<String>,
    properties: HashMap<String, PropertyValue>,
}

struct Edge {
    from: Gid,
    to: Gid,
    edge_type: String,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn has_vertex(&self, gid: Gid) -> bool {
        self.vertices.contains_key(&gid)
    }

    pub fn has_label(&self, gid: Gid, label: &str) -> bool {
        self.vertices
            .get(&gid)
            .map(|v| v.labels.contains(label))
            .unwrap_or(false)
    }

    pub fn property(&self, gid: Gid, key: &str) -> Option<&PropertyValue> {
        self.vertices.get(&gid).and_then(|v| v.properties.get(key))
    }

    pub fn edge_type(&self, gid: Gid) -> Option<&str> {
        self.edges.get(&gid).map(|e| e.edge_type.as_str())
    }

    pub fn edge_endpoints(&self, gid: Gid) -> Option<(Gid, Gid)> {
        self.edges.get(&gid).map(|e| (e.from, e.to))
    }
}

impl DeltaApplier for InMemoryGraph {
    fn apply(&mut self, delta: &StateDelta) {
        match &delta.op {
            // Transaction markers carry no state change of their own.
            DeltaOp::TransactionBegin | DeltaOp::TransactionCommit | DeltaOp::TransactionAbort => {}
            DeltaOp::CreateVertex { gid } => {
                self.vertices.insert(*gid, Vertex::default());
            }
            DeltaOp::RemoveVertex { gid } => {
                self.vertices.remove(gid);
            }
            DeltaOp::AddLabel { gid, label } => {
                if let Some(vertex) = self.vertices.get_mut(gid) {
                    vertex.labels.insert(label.clone());
                }
            }
            DeltaOp::RemoveLabel { gid, label } => {
                if let Some(vertex) = self.vertices.get_mut(gid) {
                    vertex.labels.remove(label);
                }
            }
            DeltaOp::SetProperty { gid, key, value } => {
                if let Some(vertex) = self.vertices.get_mut(gid) {
                    vertex.properties.insert(key.clone(), value.clone());
                }
            }
            DeltaOp::CreateEdge {
                gid,
                from,
                to,
                edge_type,
            } => {
                self.edges.insert(
                    *gid,
                    Edge {
                        from: *from,
                        to: *to,
                        edge_type: edge_type.clone(),
                    },
                );
            }
            DeltaOp::RemoveEdge { gid } => {
                self.edges.remove(gid);
            }
        }
    }

    fn reset(&mut self) {
        self.vertices.clear();
        self.edges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(op: DeltaOp) -> StateDelta {
        StateDelta { tx_id: 1, op }
    }

    #[test]
    fn applies_graph_mutations() {
        let mut graph = InMemoryGraph::new();

        graph.apply(&delta(DeltaOp::CreateVertex { gid: 1 }));
        graph.apply(&delta(DeltaOp::CreateVertex { gid: 2 }));
        graph.apply(&delta(DeltaOp::AddLabel {
            gid: 1,
            label: "Person".to_string(),
        }));
        graph.apply(&delta(DeltaOp::SetProperty {
            gid: 1,
            key: "age".to_string(),
            value: PropertyValue::Int(39),
        }));
        graph.apply(&delta(DeltaOp::CreateEdge {
            gid: 10,
            from: 1,
            to: 2,
            edge_type: "KNOWS".to_string(),
        }));

        assert_eq!(graph.vertex_count(), 2);
        assert!(graph.has_label(1, "Person"));
        assert_eq!(graph.property(1, "age"), Some(&PropertyValue::Int(39)));
        assert_eq!(graph.edge_type(10), Some("KNOWS"));
        assert_eq!(graph.edge_endpoints(10), Some((1, 2)));

        graph.apply(&delta(DeltaOp::RemoveEdge { gid: 10 }));
        graph.apply(&delta(DeltaOp::RemoveVertex { gid: 2 }));
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.vertex_count(), 1);
    }

    #[test]
    fn reset_returns_to_empty() {
        let mut graph = InMemoryGraph::new();
        graph.apply(&delta(DeltaOp::CreateVertex { gid: 1 }));
        graph.reset();
        assert_eq!(graph.vertex_count(), 0);
    }
}
