mod machine;
mod state;


pub use machine::{DetectionStateMachine, MIN_RESOLVED_DELAY};
pub use state::{Classification, DetectionState, Detection, Transition};
