pub mod app;
pub mod auth;
pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod frame;
pub mod frame_slot;
pub mod history;
pub mod keyboard_input;
pub mod matcher;
pub mod prediction;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::{ActionOrchestrator, ComponentState, CuewatchApp, MatchPoller, ShutdownReason};
pub use auth::{CredentialManager, FileTokenStore, MemoryTokenStore, TokenStore};
pub use camera::{CaptureDevice, FrameReader, FrameSource, FrameSourceBuilder};
pub use config::CuewatchConfig;
pub use detection::{Classification, Detection, DetectionState, DetectionStateMachine, Transition};
pub use error::{CuewatchError, Result};
pub use events::{CuewatchEvent, EventBus, EventFilter, EventReceiver, OperatorCommand};
pub use frame::Frame;
pub use history::{HistoryRecord, HistorySink, MemoryHistorySink, TracingHistorySink};
pub use matcher::{match_triggers, Trigger, TriggerKind, TriggerSet};
pub use prediction::{PredictionClient, PredictionHandle, PredictionRequest, PredictionStatus};
