use crate::actor::WeakActorClient;
use crate::raft::log::Term;
use crate::raft::peers::ServerId;
use crate::raft::timers::time::{Clock, RealClock};
use rand::rngs::SmallRng;
use rand::Rng;
use std::ops::Range;
use std::sync::{Arc, Mutex, Weak};
use tokio::time::{Duration, Instant};

/// Drives one peer's AppendEntries cadence while this server is leader.
///
/// The background task fires eagerly once on spawn (a newly elected leader
/// must announce itself immediately), then whenever `heartbeat_interval`
/// passes without a proactive send. Dropping the handle stops the task; the
/// handle is owned by the leader-mode state, so losing leadership stops all
/// heartbeats for that term.
pub struct HeartbeatTimerHandle<C: Clock = RealClock> {
    state: Arc<HeartbeatTimerState<C>>,
}

struct HeartbeatTimerState<C: Clock> {
    heartbeat_interval: Duration,
    next_heartbeat_time: SharedOption<Instant>,
    clock: C,
}

impl<C: Clock> HeartbeatTimerState<C> {
    fn push_back_heartbeat(&self) {
        let next = self.clock.now() + self.heartbeat_interval;
        self.next_heartbeat_time.replace(next);
    }
}

impl HeartbeatTimerHandle {
    pub fn spawn_background_task(
        heartbeat_interval: Duration,
        actor: WeakActorClient,
        peer: ServerId,
        term: Term,
    ) -> Self {
        Self::spawn_background_task_with_clock(heartbeat_interval, actor, peer, term, RealClock)
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    fn spawn_background_task_with_clock(
        heartbeat_interval: Duration,
        actor: WeakActorClient,
        peer: ServerId,
        term: Term,
        clock: C,
    ) -> Self {
        let shared_opt = SharedOption::new();
        let state = Arc::new(HeartbeatTimerState {
            heartbeat_interval,
            next_heartbeat_time: shared_opt.clone(),
            clock: clock.clone(),
        });

        tokio::task::spawn(Self::heartbeat_timer_task(
            Arc::downgrade(&state),
            shared_opt,
            actor,
            peer,
            term,
            clock,
        ));

        HeartbeatTimerHandle { state }
    }

    /// Called after a proactive AppendEntries so the peer isn't pinged again
    /// until a full interval has passed.
    pub fn push_back_heartbeat(&self) {
        self.state.push_back_heartbeat();
    }

    async fn heartbeat_timer_task(
        weak_state: Weak<HeartbeatTimerState<C>>,
        next_heartbeat_time: SharedOption<Instant>,
        actor: WeakActorClient,
        peer: ServerId,
        term: Term,
        mut clock: C,
    ) {
        // The SharedOption starts empty, so the first iteration publishes a
        // tick right away.
        loop {
            match next_heartbeat_time.take() {
                Some(wake_time) => {
                    clock.sleep_until(wake_time).await;
                }
                None => {
                    let state = match weak_state.upgrade() {
                        Some(state) => state,
                        // Handle dropped: no longer leader for this term.
                        None => return,
                    };
                    if actor.leader_heartbeat(peer, term).await.is_err() {
                        return;
                    }
                    state.push_back_heartbeat();
                }
            }
        }
    }
}

/// Tracks the election deadline while this server is a follower or
/// candidate.
///
/// Every `reset_deadline` pushes a fresh uniformly random deadline from the
/// configured half-open range. If the deadline passes without another reset,
/// the task publishes an election timeout and exits; dropping the handle
/// (on any mode transition) also ends the task, without a timeout.
pub struct ElectionTimerHandle {
    deadline_queue: flume::Sender<Instant>,
    timeout_range: Range<Duration>,
    rng: Arc<Mutex<SmallRng>>,
}

impl ElectionTimerHandle {
    pub fn spawn_background_task(
        min_timeout: Duration,
        max_timeout: Duration,
        rng: Arc<Mutex<SmallRng>>,
        actor: WeakActorClient,
    ) -> Self {
        let (tx, rx) = flume::unbounded();

        let handle = ElectionTimerHandle {
            deadline_queue: tx,
            timeout_range: min_timeout..max_timeout,
            rng,
        };
        handle.reset_deadline();

        tokio::task::spawn(Self::election_timer_task(rx, actor));

        handle
    }

    pub fn reset_deadline(&self) {
        match self.deadline_queue.try_send(self.random_deadline()) {
            Ok(_) => {}
            // The task already fired its timeout and exited; the pending
            // ElectionTimeout event supersedes this reset.
            Err(flume::TrySendError::Disconnected(_)) => {}
            Err(flume::TrySendError::Full(_)) => {
                unreachable!("election deadline queue is unbounded")
            }
        }
    }

    fn random_deadline(&self) -> Instant {
        let jittered = self
            .rng
            .lock()
            .expect("election rng lock poisoned")
            .gen_range(self.timeout_range.clone());
        Instant::now() + jittered
    }

    async fn election_timer_task(queue: flume::Receiver<Instant>, actor: WeakActorClient) {
        loop {
            match queue.try_recv() {
                Ok(deadline) => {
                    // Heard from a leader (or got a fresh deadline some other
                    // way); sleep towards the new deadline.
                    tokio::time::sleep_until(deadline).await;
                }
                Err(flume::TryRecvError::Empty) => {
                    // Slept all the way to the deadline with no reset: the
                    // leader is quiet, time to start an election.
                    let _ = actor.election_timeout().await;
                    return;
                }
                Err(flume::TryRecvError::Disconnected) => {
                    // Mode changed and the handle was dropped.
                    return;
                }
            }
        }
    }
}

#[derive(Clone, Default)]
struct SharedOption<T> {
    data: Arc<Mutex<Option<T>>>,
}

impl<T> SharedOption<T> {
    fn new() -> Self {
        SharedOption {
            data: Arc::new(Mutex::new(None)),
        }
    }

    fn replace(&self, new_data: T) {
        self.data
            .lock()
            .expect("SharedOption.replace() mutex guard poison")
            .replace(new_data);
    }

    fn take(&self) -> Option<T> {
        self.data
            .lock()
            .expect("SharedOption.take() mutex guard poison")
            .take()
    }
}

pub(crate) mod time {
    use tokio::sync::watch;
    use tokio::time::Instant;

    #[async_trait::async_trait]
    pub trait Clock: Clone {
        fn now(&self) -> Instant;
        async fn sleep_until(&mut self, deadline: Instant);
    }

    #[derive(Copy, Clone)]
    pub struct RealClock;

    #[async_trait::async_trait]
    impl Clock for RealClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            tokio::time::sleep_until(deadline).await;
        }
    }

    #[cfg(test)]
    pub fn mocked_clock() -> (MockClock, MockClockController) {
        let now = Instant::now();
        let (tx, rx) = watch::channel(now);
        let clock = MockClock { current_time: rx };
        let controller = MockClockController { current_time: tx };

        (clock, controller)
    }

    #[cfg(test)]
    #[derive(Clone)]
    pub struct MockClock {
        current_time: watch::Receiver<Instant>,
    }

    #[cfg(test)]
    #[async_trait::async_trait]
    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current_time.borrow()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            loop {
                if *self.current_time.borrow() >= deadline {
                    return;
                }
                self.current_time.changed().await.expect("controller dropped");
            }
        }
    }

    #[cfg(test)]
    pub struct MockClockController {
        current_time: watch::Sender<Instant>,
    }

    #[cfg(test)]
    impl MockClockController {
        /// Advance in increments smaller than whatever granularity the test
        /// observes; one big leap past several deadlines wakes a sleeper
        /// only once.
        pub fn advance(&mut self, duration: tokio::time::Duration) {
            let now = *self.current_time.borrow();
            self.current_time.send(now + duration).expect("clock dropped");
        }
    }
}
