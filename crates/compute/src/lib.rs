pub mod algorithms;
pub mod detector;
pub mod pipeline;
pub mod simulator;
pub mod store;

pub use detector::{Detector, DetectorError, Evaluation, FittedModel, TrainSummary};
pub use pipeline::{AnomalyCategory, AnomalyClassification};
pub use simulator::{
    generate_dataset, HistoryBuffer, Simulator, SimulatorError, SimulatorHandle, SimulatorState,
    SimulatorStatus, TrafficGenerator, TrafficProfile,
};
pub use store::{HistoryStore, JsonFileStore, StorageError};
