mod client;
mod types;

pub use client::PredictionClient;
pub use types::{
    outcome_index, PredictionHandle, PredictionRequest, PredictionStatus, MAX_OUTCOME_CHARS,
    MAX_TITLE_CHARS, MAX_WINDOW_SECONDS, MIN_WINDOW_SECONDS,
};
