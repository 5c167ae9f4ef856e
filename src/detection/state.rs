use crate::matcher::TriggerKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Game phase as seen by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionState {
    Stopped,
    Idle,
    Voting,
    Resolved,
}

impl DetectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionState::Stopped => "stopped",
            DetectionState::Idle => "idle",
            DetectionState::Voting => "voting",
            DetectionState::Resolved => "resolved",
        }
    }

    /// Trigger kinds worth evaluating in this state
    pub fn active_triggers(&self, always_voting: bool) -> &'static [TriggerKind] {
        match self {
            DetectionState::Idle if !always_voting => &[TriggerKind::Start],
            DetectionState::Voting => &[TriggerKind::Win, TriggerKind::Lose],
            _ => &[],
        }
    }
}

impl fmt::Display for DetectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of feeding one frame through the active triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    None,
    Start,
    Win,
    Lose,
}

impl From<TriggerKind> for Classification {
    fn from(kind: TriggerKind) -> Self {
        match kind {
            TriggerKind::Start => Classification::Start,
            TriggerKind::Win => Classification::Win,
            TriggerKind::Lose => Classification::Lose,
        }
    }
}

/// A classification together with the score that produced it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub classification: Classification,
    pub score: f32,
}

impl Detection {
    pub fn new(classification: Classification, score: f32) -> Self {
        Self {
            classification,
            score,
        }
    }

    pub fn none() -> Self {
        Self::new(Classification::None, 0.0)
    }
}

impl From<Classification> for Detection {
    /// Manual classifications carry full confidence
    fn from(classification: Classification) -> Self {
        let score = if classification == Classification::None {
            0.0
        } else {
            1.0
        };
        Self::new(classification, score)
    }
}

/// An executed state change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Position in the machine's transition order, starting at 1
    pub seq: u64,
    pub previous: DetectionState,
    pub state: DetectionState,
    pub detection: Detection,
    pub always_voting: bool,
    pub at: DateTime<Utc>,
}

impl Transition {
    pub fn classification(&self) -> Classification {
        self.detection.classification
    }
}
