use crate::config::PredictionConfig;
use crate::detection::Classification;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Service limits applied before a request is sent
pub const MAX_TITLE_CHARS: usize = 45;
pub const MAX_OUTCOME_CHARS: usize = 25;
pub const MIN_WINDOW_SECONDS: u32 = 30;
pub const MAX_WINDOW_SECONDS: u32 = 1800;

/// Local view of the prediction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    #[default]
    None,
    Created,
    Locked,
    Failed,
    Canceled,
    Resolved,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::None => "none",
            PredictionStatus::Created => "created",
            PredictionStatus::Locked => "locked",
            PredictionStatus::Failed => "failed",
            PredictionStatus::Canceled => "canceled",
            PredictionStatus::Resolved => "resolved",
        }
    }

    /// Map a remote status string
    pub fn from_remote(status: &str) -> Self {
        match status {
            "ACTIVE" => PredictionStatus::Created,
            "LOCKED" => PredictionStatus::Locked,
            "RESOLVED" => PredictionStatus::Resolved,
            "CANCELED" => PredictionStatus::Canceled,
            _ => PredictionStatus::None,
        }
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prediction opened on the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionHandle {
    pub id: String,
    /// Outcome ids in request order: win first, lose second
    pub outcome_ids: Vec<String>,
    pub status: PredictionStatus,
}

/// Index of the winning outcome for a result classification
pub fn outcome_index(classification: Classification) -> Option<usize> {
    match classification {
        Classification::Win => Some(0),
        Classification::Lose => Some(1),
        _ => None,
    }
}

/// Title, outcome labels and window, already clamped to service limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionRequest {
    pub title: String,
    pub outcomes: [String; 2],
    pub window_seconds: u32,
}

impl PredictionRequest {
    pub fn new(title: &str, win_label: &str, lose_label: &str, window_seconds: u32) -> Self {
        Self {
            title: truncate_chars(title, MAX_TITLE_CHARS),
            outcomes: [
                truncate_chars(win_label, MAX_OUTCOME_CHARS),
                truncate_chars(lose_label, MAX_OUTCOME_CHARS),
            ],
            window_seconds: window_seconds.clamp(MIN_WINDOW_SECONDS, MAX_WINDOW_SECONDS),
        }
    }

    pub fn from_config(config: &PredictionConfig) -> Self {
        Self::new(
            &config.title,
            &config.win_label,
            &config.lose_label,
            config.duration_seconds,
        )
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.trim().chars().take(max).collect()
}

// Wire format

#[derive(Debug, Serialize)]
pub(crate) struct CreatePredictionBody<'a> {
    pub broadcaster_id: &'a str,
    pub title: &'a str,
    pub outcomes: Vec<OutcomeTitle<'a>>,
    pub prediction_window: u32,
}

#[derive(Debug, Serialize)]
pub(crate) struct OutcomeTitle<'a> {
    pub title: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct EndPredictionBody<'a> {
    pub broadcaster_id: &'a str,
    pub id: &'a str,
    pub status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winning_outcome_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PredictionEnvelope {
    pub data: Vec<PredictionData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PredictionData {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub outcomes: Vec<OutcomeData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OutcomeData {
    pub id: String,
}

impl From<PredictionData> for PredictionHandle {
    fn from(data: PredictionData) -> Self {
        Self {
            id: data.id,
            outcome_ids: data.outcomes.into_iter().map(|o| o.id).collect(),
            status: PredictionStatus::from_remote(&data.status),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceErrorBody {
    pub message: Option<String>,
}
