use crate::camera::FrameSource;
use crate::detection::{Classification, Detection, DetectionStateMachine, Transition};
use crate::matcher::{match_triggers, TriggerMatch, TriggerSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically matches the latest frame against the triggers the current
/// state cares about and feeds the result to the state machine.
pub struct MatchPoller {
    source: Arc<FrameSource>,
    machine: Arc<DetectionStateMachine>,
    triggers: RwLock<Arc<TriggerSet>>,
    interval: Duration,
    polls: AtomicU64,
}

impl MatchPoller {
    pub fn new(
        source: Arc<FrameSource>,
        machine: Arc<DetectionStateMachine>,
        triggers: TriggerSet,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            machine,
            triggers: RwLock::new(Arc::new(triggers)),
            interval,
            polls: AtomicU64::new(0),
        }
    }

    /// Swap the trigger profile. Takes effect on the next poll; a poll in
    /// progress finishes with the set it started with.
    pub fn set_triggers(&self, triggers: TriggerSet) {
        info!("Installing trigger profile with {} triggers", triggers.len());
        *self.triggers.write() = Arc::new(triggers);
    }

    pub fn triggers(&self) -> Arc<TriggerSet> {
        Arc::clone(&self.triggers.read())
    }

    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// One matching pass. Template matching is CPU-bound, so it runs on the
    /// blocking pool and the result is fed to the machine after the join.
    pub async fn poll_once(&self) -> Option<Transition> {
        self.polls.fetch_add(1, Ordering::Relaxed);

        let (state, always_voting) = self.machine.snapshot();
        let kinds = state.active_triggers(always_voting);
        if kinds.is_empty() {
            return None;
        }

        let frame = self.source.latest_frame()?;
        let triggers = self.triggers();
        let frame_id = frame.id;
        let detection = match tokio::task::spawn_blocking(move || {
            classify(&match_triggers(&frame, triggers.select(kinds)))
        })
        .await
        {
            Ok(detection) => detection,
            Err(e) => {
                warn!("Matching task for frame {} failed: {}", frame_id, e);
                return None;
            }
        };
        if detection.classification == Classification::None {
            return None;
        }

        debug!(
            "Frame {} classified as {:?} (score {:.3}) in {}",
            frame_id, detection.classification, detection.score, state
        );
        self.machine.feed(detection)
    }

    /// Poll until `cancel` fires. Missed ticks are skipped, not replayed.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Match poller running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // A pass in flight is abandoned on cancel
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.poll_once() => {}
                    }
                }
            }
        }

        info!("Match poller stopped after {} polls", self.poll_count());
    }
}

/// Highest-scoring matched trigger wins; ties go to the first evaluated
pub fn classify(results: &[TriggerMatch]) -> Detection {
    results
        .iter()
        .filter(|r| r.matched)
        .fold(None::<&TriggerMatch>, |best, candidate| match best {
            Some(best) if best.score >= candidate.score => Some(best),
            _ => Some(candidate),
        })
        .map(|best| Detection::new(best.kind.into(), best.score))
        .unwrap_or_else(Detection::none)
}
