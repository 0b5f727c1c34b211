//! Streaming simulator: generate → score → retain → checkpoint.
//!
//! - `generator`: traffic profiles and the per-tick sample source
//! - `history`: capacity-bounded sample buffer
//! - `state`: lifecycle state machine and status counters
//! - `runner`: the tick loop and its external handle

pub mod generator;
pub mod history;
mod runner;
pub mod state;

use thiserror::Error;

use crate::detector::DetectorError;
use crate::store::StorageError;

pub use generator::{generate_dataset, TrafficGenerator, TrafficProfile};
pub use history::HistoryBuffer;
pub use runner::{Simulator, SimulatorHandle, TickOutcome};
pub use state::{SimulatorState, SimulatorStatus};

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: SimulatorState,
        to: SimulatorState,
    },
    #[error("Invalid simulator config: {0}")]
    Config(String),
    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Generation failed: {0}")]
    Generation(String),
}
