use crate::coordination::PeerClient;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use tonic::codegen::http::uri;

/// Id of a server participating in the replication cluster. Ids are unique
/// integers from 1 to the cluster size.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ServerId(pub u16);

impl ServerId {
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity and connection metadata for one cluster member.
#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub id: ServerId,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// The fixed group of servers running one instance of Raft together.
/// Tracks one lazily-connecting RPC client per peer.
pub struct ClusterTracker {
    me: ServerId,
    peers: HashMap<ServerId, PeerClient>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidCluster {
    #[error("duplicate server id {0} in cluster config")]
    DuplicateServerId(ServerId),
    #[error("server ids must cover 1..={0}, missing {1}")]
    NonContiguousServerIds(u16, ServerId),
    #[error("my server id {0} not in cluster config")]
    MeNotInCluster(ServerId),
    #[error("invalid peer address: {0}")]
    InvalidUri(#[from] uri::InvalidUri),
}

impl ClusterTracker {
    /// Validates the member list (ids must be exactly 1..=N with me among
    /// them) and sets up one lazily-connecting RPC client per peer.
    pub fn new(me: ServerId, members: Vec<MemberInfo>) -> Result<Self, InvalidCluster> {
        let cluster_size = members.len() as u16;
        let mut by_id: HashMap<ServerId, MemberInfo> = HashMap::with_capacity(members.len());
        for member in members {
            if by_id.insert(member.id, member.clone()).is_some() {
                return Err(InvalidCluster::DuplicateServerId(member.id));
            }
        }
        for id in 1..=cluster_size {
            if !by_id.contains_key(&ServerId(id)) {
                return Err(InvalidCluster::NonContiguousServerIds(
                    cluster_size,
                    ServerId(id),
                ));
            }
        }
        if !by_id.contains_key(&me) {
            return Err(InvalidCluster::MeNotInCluster(me));
        }

        let mut peers = HashMap::with_capacity(by_id.len().saturating_sub(1));
        for (id, member) in by_id {
            if id == me {
                continue;
            }
            peers.insert(id, PeerClient::new(Self::peer_uri(&member)?));
        }

        Ok(ClusterTracker { me, peers })
    }

    fn peer_uri(member: &MemberInfo) -> Result<uri::Uri, uri::InvalidUri> {
        uri::Uri::from_maybe_shared(format!("http://{}:{}", member.ip, member.port))
    }

    pub fn me(&self) -> ServerId {
        self.me
    }

    pub fn contains_member(&self, id: ServerId) -> bool {
        id == self.me || self.peers.contains_key(&id)
    }

    pub fn peer_client(&self, id: ServerId) -> Option<&PeerClient> {
        self.peers.get(&id)
    }

    pub fn peer_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.peers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Total number of voting servers, including me.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// True when `votes` (including my own) reaches `⌈(N+1)/2⌉`.
    pub fn has_majority(&self, votes: usize) -> bool {
        votes * 2 > self.cluster_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u16) -> MemberInfo {
        MemberInfo {
            id: ServerId(id),
            ip: Ipv4Addr::LOCALHOST,
            port: 10_000 + id,
        }
    }

    #[tokio::test]
    async fn valid_cluster() {
        let tracker =
            ClusterTracker::new(ServerId(2), vec![member(1), member(2), member(3)]).unwrap();
        assert_eq!(tracker.me(), ServerId(2));
        assert_eq!(tracker.cluster_size(), 3);
        assert_eq!(tracker.peer_ids(), vec![ServerId(1), ServerId(3)]);
        assert!(tracker.contains_member(ServerId(2)));
        assert!(tracker.contains_member(ServerId(3)));
        assert!(!tracker.contains_member(ServerId(4)));
    }

    #[tokio::test]
    async fn single_server_cluster() {
        let tracker = ClusterTracker::new(ServerId(1), vec![member(1)]).unwrap();
        assert_eq!(tracker.cluster_size(), 1);
        assert!(tracker.has_majority(1));
    }

    #[tokio::test]
    async fn majority_thresholds() {
        let tracker =
            ClusterTracker::new(ServerId(1), vec![member(1), member(2), member(3)]).unwrap();
        assert!(!tracker.has_majority(1));
        assert!(tracker.has_majority(2));

        let even = ClusterTracker::new(ServerId(1), vec![member(1), member(2)]).unwrap();
        assert!(!even.has_majority(1));
        assert!(even.has_majority(2));
    }

    #[tokio::test]
    async fn rejects_duplicate_ids() {
        let result = ClusterTracker::new(ServerId(1), vec![member(1), member(1)]);
        assert!(matches!(result, Err(InvalidCluster::DuplicateServerId(_))));
    }

    #[tokio::test]
    async fn rejects_gap_in_ids() {
        let result = ClusterTracker::new(ServerId(1), vec![member(1), member(3)]);
        assert!(matches!(
            result,
            Err(InvalidCluster::NonContiguousServerIds(_, _))
        ));
    }

    #[tokio::test]
    async fn rejects_me_not_in_cluster() {
        let result = ClusterTracker::new(ServerId(5), vec![member(1), member(2), member(3)]);
        assert!(matches!(result, Err(InvalidCluster::MeNotInCluster(_))));
    }
}
