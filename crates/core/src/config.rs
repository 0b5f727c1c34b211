use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

/// Parse a profiled env var, falling back to `default` when unset or unparsable.
fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub detector: DetectorConfig,
    pub simulator: SimulatorConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `FLOWWATCH_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("FLOWWATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            detector: DetectorConfig::from_env_profiled(p),
            simulator: SimulatorConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.detector.validate()?;
        self.simulator.validate()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  detector:   trees={}, max_samples={}, contamination={}, scaling={}, seed={}",
            self.detector.trees,
            self.detector.max_samples,
            self.detector.contamination,
            self.detector.scaling,
            self.detector.seed
        );
        tracing::info!(
            "  model:      path={}",
            self.detector
                .model_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        );
        tracing::info!(
            "  simulator:  tick={}ms, save_interval={}ms, anomaly_probability={}, capacity={}",
            self.simulator.tick_interval_ms,
            self.simulator.save_interval_ms,
            self.simulator.anomaly_probability,
            self.simulator.history_capacity
        );
        tracing::info!("  data_file:  {}", self.simulator.data_file.display());
    }
}

// ── Scaling mode ──────────────────────────────────────────────

/// How scoring batches are standardized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// Refit mean/std on every scoring batch. Scores are not comparable
    /// across batches of different composition; a single-sample batch
    /// always standardizes to the origin.
    #[default]
    PerBatch,
    /// Reuse the statistics captured at the last fit.
    Frozen,
}

impl FromStr for ScalingMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per_batch" | "per-batch" | "batch" => Ok(ScalingMode::PerBatch),
            "frozen" | "fit" => Ok(ScalingMode::Frozen),
            other => Err(CoreError::Config(format!("unknown scaling mode '{}'", other))),
        }
    }
}

impl std::fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingMode::PerBatch => write!(f, "per_batch"),
            ScalingMode::Frozen => write!(f, "frozen"),
        }
    }
}

// ── Detector ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Number of isolation trees in the ensemble.
    pub trees: usize,
    /// Sub-sample size per tree (capped at the batch size).
    pub max_samples: usize,
    /// Expected anomalous fraction, sets the decision threshold.
    pub contamination: f64,
    pub seed: u64,
    pub scaling: ScalingMode,
    /// Where to snapshot the fitted model, if anywhere.
    pub model_path: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            trees: 500,
            max_samples: 256,
            contamination: 0.4,
            seed: 42,
            scaling: ScalingMode::PerBatch,
            model_path: None,
        }
    }
}

impl DetectorConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            trees: profiled_env_parse(p, "DETECTOR_TREES", d.trees),
            max_samples: profiled_env_parse(p, "DETECTOR_MAX_SAMPLES", d.max_samples),
            contamination: profiled_env_parse(p, "DETECTOR_CONTAMINATION", d.contamination),
            seed: profiled_env_parse(p, "DETECTOR_SEED", d.seed),
            scaling: profiled_env_parse(p, "DETECTOR_SCALING", d.scaling),
            model_path: profiled_env_opt(p, "DETECTOR_MODEL_PATH").map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.trees == 0 {
            return Err(CoreError::Config("detector.trees must be at least 1".into()));
        }
        if self.max_samples == 0 {
            return Err(CoreError::Config("detector.max_samples must be at least 1".into()));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(CoreError::Config(format!(
                "detector.contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        Ok(())
    }
}

// ── Simulator ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Pause between ticks.
    pub tick_interval_ms: u64,
    /// Minimum time between history flushes.
    pub save_interval_ms: u64,
    pub anomaly_probability: f64,
    pub history_capacity: usize,
    /// Pause after a failed tick.
    pub error_backoff_ms: u64,
    pub data_file: PathBuf,
    /// Fixed generator seed; entropy-seeded when unset.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            save_interval_ms: 5000,
            anomaly_probability: 0.2,
            history_capacity: 1000,
            error_backoff_ms: 1000,
            data_file: PathBuf::from("data/synthetic_traffic_data.json"),
            seed: None,
        }
    }
}

impl SimulatorConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            tick_interval_ms: profiled_env_parse(p, "SIM_TICK_MS", d.tick_interval_ms),
            save_interval_ms: profiled_env_parse(p, "SIM_SAVE_INTERVAL_MS", d.save_interval_ms),
            anomaly_probability: profiled_env_parse(
                p,
                "SIM_ANOMALY_PROBABILITY",
                d.anomaly_probability,
            ),
            history_capacity: profiled_env_parse(p, "SIM_HISTORY_CAPACITY", d.history_capacity),
            error_backoff_ms: profiled_env_parse(p, "SIM_ERROR_BACKOFF_MS", d.error_backoff_ms),
            data_file: PathBuf::from(profiled_env_or(
                p,
                "SIM_DATA_FILE",
                "data/synthetic_traffic_data.json",
            )),
            seed: profiled_env_opt(p, "SIM_SEED").and_then(|v| v.parse().ok()),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.anomaly_probability) {
            return Err(CoreError::Config(format!(
                "simulator.anomaly_probability must be in [0, 1], got {}",
                self.anomaly_probability
            )));
        }
        if self.history_capacity == 0 {
            return Err(CoreError::Config("simulator.history_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
