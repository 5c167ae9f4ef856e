use super::state::{Classification, DetectionState, Detection, Transition};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const MIN_RESOLVED_DELAY: Duration = Duration::from_secs(1);

const NOTIFY_CAPACITY: usize = 64;
/// Results kept for subscribers that fell behind
const RESULT_LOG: usize = 8;

/// Finite-state model over {Stopped, Idle, Voting, Resolved}.
///
/// Every transition runs under one lock. Subscribers are notified through a
/// broadcast channel while that lock is held, so notifications are ordered
/// like the transitions themselves and are enqueued before the call returns;
/// subscriber code never runs under the lock.
pub struct DetectionStateMachine {
    shared: Arc<Shared>,
    resolved_delay: Duration,
}

struct Shared {
    inner: Mutex<Inner>,
    notifier: broadcast::Sender<Transition>,
}

struct Inner {
    state: DetectionState,
    always_voting: bool,
    /// Bumped on each entry into Resolved so a stale re-arm timer is ignored
    resolved_epoch: u64,
    seq: u64,
    results: VecDeque<Transition>,
    /// Newest result pushed out of `results`
    evicted_through: u64,
    /// Latest transition out of Voting
    left_voting: u64,
}

impl Shared {
    /// Move to `target` and notify. No-op when already there.
    fn transition(
        &self,
        inner: &mut Inner,
        target: DetectionState,
        detection: Detection,
    ) -> Option<Transition> {
        if inner.state == target {
            return None;
        }

        inner.seq += 1;
        let transition = Transition {
            seq: inner.seq,
            previous: inner.state,
            state: target,
            detection,
            always_voting: inner.always_voting,
            at: Utc::now(),
        };
        inner.state = target;
        if transition.previous == DetectionState::Voting {
            inner.left_voting = transition.seq;
        }
        if target == DetectionState::Resolved {
            if inner.results.len() == RESULT_LOG {
                if let Some(evicted) = inner.results.pop_front() {
                    inner.evicted_through = evicted.seq;
                }
            }
            inner.results.push_back(transition.clone());
        }

        info!(
            "Detection state {} -> {} ({:?}, score {:.3})",
            transition.previous, transition.state, detection.classification, detection.score
        );

        // Err only means nobody is subscribed right now
        if self.notifier.send(transition.clone()).is_err() {
            debug!("No transition subscribers");
        }

        Some(transition)
    }

    fn armed_state(inner: &Inner) -> DetectionState {
        if inner.always_voting {
            DetectionState::Voting
        } else {
            DetectionState::Idle
        }
    }

    fn rearm(&self, epoch: Option<u64>) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if inner.state != DetectionState::Resolved {
            return None;
        }
        if let Some(epoch) = epoch {
            if epoch != inner.resolved_epoch {
                debug!("Ignoring stale re-arm timer");
                return None;
            }
        }
        let target = Self::armed_state(&inner);
        self.transition(&mut inner, target, Detection::none())
    }
}

impl DetectionStateMachine {
    /// New machine in `Stopped`. `resolved_delay` is raised to one second if
    /// shorter.
    pub fn new(resolved_delay: Duration, always_voting: bool) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: DetectionState::Stopped,
                    always_voting,
                    resolved_epoch: 0,
                    seq: 0,
                    results: VecDeque::with_capacity(RESULT_LOG),
                    evicted_through: 0,
                    left_voting: 0,
                }),
                notifier,
            }),
            resolved_delay: resolved_delay.max(MIN_RESOLVED_DELAY),
        }
    }

    pub fn state(&self) -> DetectionState {
        self.shared.inner.lock().state
    }

    pub fn always_voting(&self) -> bool {
        self.shared.inner.lock().always_voting
    }

    /// `(state, always_voting)` read atomically
    pub fn snapshot(&self) -> (DetectionState, bool) {
        let inner = self.shared.inner.lock();
        (inner.state, inner.always_voting)
    }

    pub fn resolved_delay(&self) -> Duration {
        self.resolved_delay
    }

    /// First entry into Resolved after transition `seq`. `None` if there
    /// is none yet or it has already been pushed out of the log.
    pub fn result_after(&self, seq: u64) -> Option<Transition> {
        let inner = self.shared.inner.lock();
        if inner.evicted_through > seq {
            return None;
        }
        inner.results.iter().find(|t| t.seq > seq).cloned()
    }

    /// Whether the machine has left Voting since transition `seq`
    pub fn left_voting_after(&self, seq: u64) -> bool {
        self.shared.inner.lock().left_voting > seq
    }

    /// Receive every executed transition, in order
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.shared.notifier.subscribe()
    }

    /// Stopped/Resolved -> Idle (or Voting in always-voting mode)
    pub fn start(&self) -> Option<Transition> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            DetectionState::Stopped | DetectionState::Resolved => {
                let target = Shared::armed_state(&inner);
                self.shared.transition(&mut inner, target, Detection::none())
            }
            _ => None,
        }
    }

    /// Apply a classification. Events with no rule for the current state are
    /// discarded.
    pub fn feed(&self, detection: Detection) -> Option<Transition> {
        let mut inner = self.shared.inner.lock();
        let target = match (inner.state, detection.classification) {
            (DetectionState::Idle, Classification::Start) if !inner.always_voting => {
                DetectionState::Voting
            }
            (DetectionState::Voting, Classification::Win | Classification::Lose) => {
                DetectionState::Resolved
            }
            _ => return None,
        };

        let transition = self.shared.transition(&mut inner, target, detection)?;
        if transition.state == DetectionState::Resolved {
            inner.resolved_epoch = inner.resolved_epoch.wrapping_add(1);
            self.schedule_rearm(inner.resolved_epoch);
        }
        Some(transition)
    }

    /// Resolved -> Idle (or Voting) immediately
    pub fn reset(&self) -> Option<Transition> {
        self.shared.rearm(None)
    }

    /// Any state -> Stopped
    pub fn stop(&self) -> Option<Transition> {
        let mut inner = self.shared.inner.lock();
        self.shared
            .transition(&mut inner, DetectionState::Stopped, Detection::none())
    }

    /// Toggle always-voting mode. Enabling it while Idle moves straight to
    /// Voting.
    pub fn set_always_voting(&self, enabled: bool) -> Option<Transition> {
        let mut inner = self.shared.inner.lock();
        if inner.always_voting == enabled {
            return None;
        }
        inner.always_voting = enabled;
        info!("Always-voting mode {}", if enabled { "enabled" } else { "disabled" });

        if enabled && inner.state == DetectionState::Idle {
            return self
                .shared
                .transition(&mut inner, DetectionState::Voting, Detection::none());
        }
        None
    }

    fn schedule_rearm(&self, epoch: u64) {
        let delay = self.resolved_delay;
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.rearm(Some(epoch));
                });
                debug!("Automatic re-arm scheduled in {:?}", delay);
            }
            Err(_) => {
                warn!("No async runtime available; automatic re-arm disabled, use reset()");
            }
        }
    }
}
