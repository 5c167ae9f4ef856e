//! Single-template normalized correlation matching over regions of interest.
//!
//! Everything in here is pure computation: no shared state, no I/O once a
//! reference image has been loaded.

mod ncc;
mod roi;
mod trigger;

pub use ncc::{is_matched, match_gray, match_score};
pub use roi::{ClippedRoi, Roi};
pub use trigger::{match_triggers, Trigger, TriggerKind, TriggerMatch, TriggerSet};
