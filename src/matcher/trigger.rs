use super::ncc::match_gray;
use super::roi::Roi;
use crate::config::TriggerConfig;
use crate::error::MatchError;
use crate::frame::Frame;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Named detection rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Start,
    Win,
    Lose,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Start => "start",
            TriggerKind::Win => "win",
            TriggerKind::Lose => "lose",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A region, a reference image and a threshold. Without a reference or with
/// a zero-area region the trigger is inert and never matches.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub roi: Roi,
    pub reference: Option<Arc<GrayImage>>,
    pub threshold: f32,
}

impl Trigger {
    pub fn new(kind: TriggerKind, roi: Roi, reference: Option<GrayImage>, threshold: f32) -> Self {
        Self {
            kind,
            roi,
            reference: reference.map(Arc::new),
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Build a trigger from configuration, loading the reference image from
    /// disk. An unreadable reference leaves the trigger inert.
    pub fn from_config(config: &TriggerConfig) -> Self {
        let reference = match &config.reference {
            Some(path) => match load_reference(path) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!("Trigger '{}' is inert: {}", config.kind, e);
                    None
                }
            },
            None => None,
        };

        Self::new(config.kind, config.roi, reference, config.threshold)
    }

    pub fn is_inert(&self) -> bool {
        self.reference.is_none() || self.roi.area() == 0
    }
}

fn load_reference(path: &str) -> Result<GrayImage, MatchError> {
    let image = image::open(path).map_err(|e| MatchError::ReferenceLoad {
        path: path.to_string(),
        details: e.to_string(),
    })?;
    debug!(
        "Loaded reference image {} ({}x{})",
        path,
        image.width(),
        image.height()
    );
    Ok(image.to_luma8())
}

/// Score and verdict for one trigger on one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerMatch {
    pub kind: TriggerKind,
    pub score: f32,
    pub matched: bool,
}

/// Evaluate several triggers against one frame, converting it to grayscale
/// only once.
pub fn match_triggers<'a, I>(frame: &Frame, triggers: I) -> Vec<TriggerMatch>
where
    I: IntoIterator<Item = &'a Trigger>,
{
    let triggers: Vec<&Trigger> = triggers.into_iter().collect();
    if triggers.is_empty() {
        return Vec::new();
    }

    let gray = if frame.is_empty() {
        None
    } else {
        Some(frame.to_gray())
    };

    triggers
        .into_iter()
        .map(|trigger| {
            let score = match (&gray, trigger.is_inert()) {
                (Some(gray), false) => match_gray(gray, trigger.roi, trigger.reference.as_deref()),
                _ => 0.0,
            };
            TriggerMatch {
                kind: trigger.kind,
                score,
                matched: !trigger.is_inert() && score >= trigger.threshold,
            }
        })
        .collect()
}

/// The active trigger profile
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    triggers: Vec<Trigger>,
}

impl TriggerSet {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    pub fn from_config(configs: &[TriggerConfig]) -> Self {
        Self::new(configs.iter().map(Trigger::from_config).collect())
    }

    pub fn get(&self, kind: TriggerKind) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.kind == kind)
    }

    /// Triggers of the given kinds, in the order requested
    pub fn select<'a>(&'a self, kinds: &'a [TriggerKind]) -> impl Iterator<Item = &'a Trigger> + 'a {
        kinds.iter().filter_map(move |kind| self.get(*kind))
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
