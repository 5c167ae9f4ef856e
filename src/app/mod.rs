mod actions;
mod orchestrator;
mod poller;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use actions::ActionOrchestrator;
pub use orchestrator::CuewatchApp;
pub use poller::{classify, MatchPoller};
pub use types::{ComponentState, ShutdownReason};
