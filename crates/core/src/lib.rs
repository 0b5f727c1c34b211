pub mod config;
pub mod error;
pub mod sample;

pub use config::{Config, DetectorConfig, ScalingMode, SimulatorConfig};
pub use error::*;
pub use sample::*;
