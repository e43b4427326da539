use crate::actor::WeakActorClient;
use crate::raft::log::{LogIndex, Term};
use crate::raft::peers::ServerId;
use crate::raft::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use rand::rngs::SmallRng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Follower,
    Candidate,
    Leader,
}

#[derive(Copy, Clone)]
pub struct ElectionConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
}

/// Mode-dependent volatile state, plus the timers that belong to each mode.
///
/// Every transition swaps the whole per-mode struct, so timers for the old
/// mode are dropped (and their tasks stop) as a side effect of the swap.
/// Transitions not allowed by the protocol panic: they can only be reached
/// through a programming error, never through message reordering.
pub struct ElectionState {
    state: ModeState,
    config: ElectionConfig,
    rng: Arc<Mutex<SmallRng>>,
    actor: WeakActorClient,
}

enum ModeState {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

struct FollowerState {
    known_leader: Option<ServerId>,
    deadline: ElectionTimerHandle,
}

struct CandidateState {
    term: Term,
    /// Peers that granted their vote this term. My own vote is implicit.
    granted: HashSet<ServerId>,
    /// Peers whose reply is still outstanding; retries only go to these.
    pending: HashSet<ServerId>,
    deadline: ElectionTimerHandle,
}

struct LeaderState {
    term: Term,
    peers: HashMap<ServerId, PeerProgress>,
}

/// Leader-side replication progress for one peer.
pub struct PeerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    heartbeat: HeartbeatTimerHandle,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl PeerProgress {
    fn new(next_index: LogIndex, heartbeat: HeartbeatTimerHandle) -> Self {
        PeerProgress {
            next_index,
            match_index: 0,
            heartbeat,
            consecutive_failures: 0,
            backoff_until: None,
        }
    }

    pub fn push_back_heartbeat(&self) {
        self.heartbeat.push_back_heartbeat();
    }

    pub fn record_unreachable(&mut self, base: Duration, now: Instant) {
        let exponent = self.consecutive_failures.min(5);
        self.backoff_until = Some(now + base * 2u32.saturating_pow(exponent));
        self.consecutive_failures += 1;
    }

    pub fn record_reachable(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        matches!(self.backoff_until, Some(until) if now < until)
    }
}

impl ElectionState {
    /// Servers start life as followers with no known leader.
    pub fn new_follower(
        config: ElectionConfig,
        rng: Arc<Mutex<SmallRng>>,
        actor: WeakActorClient,
    ) -> Self {
        let deadline = ElectionTimerHandle::spawn_background_task(
            config.election_timeout_min,
            config.election_timeout_max,
            rng.clone(),
            actor.clone(),
        );
        ElectionState {
            state: ModeState::Follower(FollowerState {
                known_leader: None,
                deadline,
            }),
            config,
            rng,
            actor,
        }
    }

    pub fn mode(&self) -> Mode {
        match &self.state {
            ModeState::Follower(_) => Mode::Follower,
            ModeState::Candidate(_) => Mode::Candidate,
            ModeState::Leader(_) => Mode::Leader,
        }
    }

    pub fn known_leader(&self) -> Option<ServerId> {
        match &self.state {
            ModeState::Follower(fs) => fs.known_leader,
            _ => None,
        }
    }

    /// Pushes the election deadline out; no-op for a leader (it has none).
    pub fn reset_deadline(&self) {
        match &self.state {
            ModeState::Follower(fs) => fs.deadline.reset_deadline(),
            ModeState::Candidate(cs) => cs.deadline.reset_deadline(),
            ModeState::Leader(_) => {}
        }
    }

    /// Follower remembering who the current leader is, for redirects.
    pub fn note_leader(&mut self, leader: ServerId) {
        if let ModeState::Follower(fs) = &mut self.state {
            fs.known_leader = Some(leader);
        }
    }

    /// Valid from any mode; Leader -> Follower is the step-down path.
    pub fn transition_to_follower(&mut self, known_leader: Option<ServerId>) {
        let deadline = self.fresh_deadline();
        self.state = ModeState::Follower(FollowerState {
            known_leader,
            deadline,
        });
    }

    /// Valid from Follower (deadline expired) and from Candidate (election
    /// drawn, trying again in a fresh term).
    pub fn transition_to_candidate(&mut self, term: Term, peers: &[ServerId]) {
        if let ModeState::Leader(_) = self.state {
            panic!("invalid mode transition: Leader -> Candidate");
        }
        let deadline = self.fresh_deadline();
        self.state = ModeState::Candidate(CandidateState {
            term,
            granted: HashSet::new(),
            pending: peers.iter().copied().collect(),
            deadline,
        });
    }

    /// Valid only from Candidate, on winning the majority.
    pub fn transition_to_leader(&mut self, term: Term, peers: &[ServerId], next_index: LogIndex) {
        match self.state {
            ModeState::Candidate(_) => {}
            ModeState::Follower(_) => panic!("invalid mode transition: Follower -> Leader"),
            ModeState::Leader(_) => panic!("invalid mode transition: Leader -> Leader"),
        }

        let mut progress = HashMap::with_capacity(peers.len());
        for &peer in peers {
            // The heartbeat task fires eagerly, so each peer hears from the
            // new leader right away.
            let heartbeat = HeartbeatTimerHandle::spawn_background_task(
                self.config.heartbeat_interval,
                self.actor.clone(),
                peer,
                term,
            );
            progress.insert(peer, PeerProgress::new(next_index, heartbeat));
        }
        self.state = ModeState::Leader(LeaderState { term, peers: progress });
    }

    /// Records a granted vote and returns the total vote count (including
    /// my own); 0 if the election for `term` is no longer open.
    pub fn record_granted_vote(&mut self, term: Term, from: ServerId) -> usize {
        if let ModeState::Candidate(cs) = &mut self.state {
            if cs.term == term {
                cs.pending.remove(&from);
                cs.granted.insert(from);
                return cs.granted.len() + 1;
            }
        }
        0
    }

    pub fn record_denied_vote(&mut self, term: Term, from: ServerId) {
        if let ModeState::Candidate(cs) = &mut self.state {
            if cs.term == term {
                cs.pending.remove(&from);
            }
        }
    }

    /// True while the election for `term` is open and `peer` hasn't replied.
    pub fn vote_still_pending(&self, term: Term, peer: ServerId) -> bool {
        if let ModeState::Candidate(cs) = &self.state {
            return cs.term == term && cs.pending.contains(&peer);
        }
        false
    }

    pub fn leader_term(&self) -> Option<Term> {
        match &self.state {
            ModeState::Leader(ls) => Some(ls.term),
            _ => None,
        }
    }

    pub fn peer_progress(&self, peer: ServerId) -> Option<&PeerProgress> {
        match &self.state {
            ModeState::Leader(ls) => ls.peers.get(&peer),
            _ => None,
        }
    }

    pub fn peer_progress_mut(&mut self, peer: ServerId) -> Option<&mut PeerProgress> {
        match &mut self.state {
            ModeState::Leader(ls) => ls.peers.get_mut(&peer),
            _ => None,
        }
    }

    pub fn match_indexes(&self) -> Vec<LogIndex> {
        match &self.state {
            ModeState::Leader(ls) => ls.peers.values().map(|p| p.match_index).collect(),
            _ => Vec::new(),
        }
    }

    fn fresh_deadline(&self) -> ElectionTimerHandle {
        ElectionTimerHandle::spawn_background_task(
            self.config.election_timeout_min,
            self.config.election_timeout_max,
            self.rng.clone(),
            self.actor.clone(),
        )
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            ModeState::Leader(ls) => write!(f, "Leader(term={})", ls.term),
            ModeState::Candidate(cs) => write!(f, "Candidate(term={})", cs.term),
            ModeState::Follower(FollowerState {
                known_leader: Some(leader),
                ..
            }) => write!(f, "Follower(leader={})", leader),
            ModeState::Follower(_) => write!(f, "Follower(leader=?)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use rand::SeedableRng;

    fn test_election_state() -> (ElectionState, ActorClient) {
        let (client, _rx) = ActorClient::new(16);
        let config = ElectionConfig {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_secs(60),
            election_timeout_max: Duration::from_secs(120),
        };
        let rng = Arc::new(Mutex::new(SmallRng::seed_from_u64(3)));
        let state = ElectionState::new_follower(config, rng, client.weak());
        (state, client)
    }

    #[tokio::test]
    async fn starts_as_follower_without_leader() {
        let (state, _client) = test_election_state();
        assert_eq!(state.mode(), Mode::Follower);
        assert_eq!(state.known_leader(), None);
    }

    #[tokio::test]
    async fn follower_candidate_leader_is_the_happy_path() {
        let (mut state, _client) = test_election_state();
        let peers = [ServerId(2), ServerId(3)];

        state.transition_to_candidate(Term(1), &peers);
        assert_eq!(state.mode(), Mode::Candidate);

        assert_eq!(state.record_granted_vote(Term(1), ServerId(2)), 2);
        state.transition_to_leader(Term(1), &peers, 1);
        assert_eq!(state.mode(), Mode::Leader);
        assert_eq!(state.leader_term(), Some(Term(1)));
        assert_eq!(state.peer_progress(ServerId(2)).unwrap().next_index, 1);
        assert_eq!(state.peer_progress(ServerId(2)).unwrap().match_index, 0);
    }

    #[tokio::test]
    async fn votes_for_stale_term_do_not_count() {
        let (mut state, _client) = test_election_state();
        state.transition_to_candidate(Term(5), &[ServerId(2)]);
        assert_eq!(state.record_granted_vote(Term(4), ServerId(2)), 0);
    }

    #[tokio::test]
    async fn duplicate_votes_count_once() {
        let (mut state, _client) = test_election_state();
        state.transition_to_candidate(Term(1), &[ServerId(2), ServerId(3)]);
        assert_eq!(state.record_granted_vote(Term(1), ServerId(2)), 2);
        assert_eq!(state.record_granted_vote(Term(1), ServerId(2)), 2);
    }

    #[tokio::test]
    async fn vote_pending_bookkeeping() {
        let (mut state, _client) = test_election_state();
        state.transition_to_candidate(Term(1), &[ServerId(2), ServerId(3)]);

        assert!(state.vote_still_pending(Term(1), ServerId(2)));
        state.record_denied_vote(Term(1), ServerId(2));
        assert!(!state.vote_still_pending(Term(1), ServerId(2)));
        assert!(state.vote_still_pending(Term(1), ServerId(3)));
        assert!(!state.vote_still_pending(Term(2), ServerId(3)));
    }

    #[tokio::test]
    async fn step_down_from_any_mode_is_valid() {
        let (mut state, _client) = test_election_state();
        state.transition_to_candidate(Term(1), &[ServerId(2)]);
        state.transition_to_leader(Term(1), &[ServerId(2)], 1);
        state.transition_to_follower(Some(ServerId(2)));
        assert_eq!(state.mode(), Mode::Follower);
        assert_eq!(state.known_leader(), Some(ServerId(2)));
    }

    #[tokio::test]
    #[should_panic(expected = "invalid mode transition: Follower -> Leader")]
    async fn follower_cannot_jump_to_leader() {
        let (mut state, _client) = test_election_state();
        state.transition_to_leader(Term(1), &[ServerId(2)], 1);
    }

    #[tokio::test]
    #[should_panic(expected = "invalid mode transition: Leader -> Candidate")]
    async fn leader_cannot_become_candidate() {
        let (mut state, _client) = test_election_state();
        state.transition_to_candidate(Term(1), &[ServerId(2)]);
        state.transition_to_leader(Term(1), &[ServerId(2)], 1);
        state.transition_to_candidate(Term(2), &[ServerId(2)]);
    }

    #[tokio::test]
    async fn backoff_grows_and_clears() {
        let (mut state, _client) = test_election_state();
        state.transition_to_candidate(Term(1), &[ServerId(2)]);
        state.transition_to_leader(Term(1), &[ServerId(2)], 1);

        let base = Duration::from_millis(50);
        let now = Instant::now();
        let progress = state.peer_progress_mut(ServerId(2)).unwrap();
        assert!(!progress.in_backoff(now));

        progress.record_unreachable(base, now);
        assert!(progress.in_backoff(now));
        assert!(!progress.in_backoff(now + base));

        progress.record_unreachable(base, now);
        // Second failure doubles the wait.
        assert!(progress.in_backoff(now + base));
        assert!(!progress.in_backoff(now + base * 2));

        progress.record_reachable();
        assert!(!progress.in_backoff(now));
    }
}
