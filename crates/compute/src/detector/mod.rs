//! Scoring service: detect / analyze / train over a shared model.
//!
//! The fitted model sits behind `RwLock<Arc<FittedModel>>`. Scoring clones the
//! `Arc` under a brief read lock and works on that snapshot; `train` builds
//! the replacement without holding any lock and swaps it in under the write
//! lock. A scoring call therefore sees either the old model or the new one,
//! never a mix, and never blocks on a fit in progress.

mod model;
mod snapshot;

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use flowwatch_core::{
    DetectorConfig, RawTrafficSample, ScalingMode, TrafficSample, ValidationError,
};

use crate::pipeline::classify::{classify, AnomalyClassification};
use crate::pipeline::preprocess::standardize;
use crate::store::StorageError;

pub use model::{seed_samples, FittedModel};
pub use snapshot::{ModelSnapshot, SNAPSHOT_VERSION};

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Model state error: {0}")]
    ModelState(String),
    #[error("Invalid detector config: {0}")]
    Config(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Acknowledgement returned by [`Detector::train`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    pub samples: usize,
    pub trees: usize,
    pub threshold: f64,
}

/// Outcome of scoring a single sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub is_anomaly: bool,
    /// Present only when `is_anomaly`.
    pub classification: Option<AnomalyClassification>,
}

pub struct Detector {
    config: DetectorConfig,
    model: RwLock<Arc<FittedModel>>,
}

impl Detector {
    /// Build a detector fitted on the built-in seed samples.
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        config
            .validate()
            .map_err(|e| DetectorError::Config(e.to_string()))?;
        let model = FittedModel::fit(&seed_samples()?, &config)?;
        info!(
            trees = model.forest.tree_count(),
            threshold = model.threshold,
            scaling = %config.scaling,
            "detector seeded"
        );
        let detector = Self::with_model(config, model);
        detector.persist_current();
        Ok(detector)
    }

    /// Wrap an already fitted model.
    pub fn with_model(config: DetectorConfig, model: FittedModel) -> Self {
        Self {
            config,
            model: RwLock::new(Arc::new(model)),
        }
    }

    /// Restore a detector from a snapshot written by an earlier run.
    pub fn from_snapshot(config: DetectorConfig, path: &Path) -> Result<Self, DetectorError> {
        config
            .validate()
            .map_err(|e| DetectorError::Config(e.to_string()))?;
        let snapshot = ModelSnapshot::load(path)?.ok_or_else(|| {
            DetectorError::ModelState(format!("no model snapshot at {}", path.display()))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DetectorError::ModelState(format!(
                "snapshot version {} is not supported (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        snapshot.model.check()?;
        info!(
            path = %path.display(),
            trained_on = snapshot.model.trained_on,
            threshold = snapshot.model.threshold,
            "detector restored from snapshot"
        );
        Ok(Self::with_model(config, snapshot.model))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn scaling_mode(&self) -> ScalingMode {
        self.config.scaling
    }

    /// The model scoring calls currently use.
    pub fn current_model(&self) -> Result<Arc<FittedModel>, DetectorError> {
        self.model
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|e| DetectorError::LockPoisoned(format!("model read lock: {}", e)))
    }

    pub fn threshold(&self) -> Result<f64, DetectorError> {
        Ok(self.current_model()?.threshold)
    }

    /// Raw anomaly scores, one per sample, in input order.
    pub fn score(&self, samples: &[TrafficSample]) -> Result<Vec<f64>, DetectorError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.current_model()?;
        Ok(score_with(&model, self.config.scaling, samples))
    }

    /// Anomaly flags, one per sample, in input order.
    pub fn detect(&self, samples: &[TrafficSample]) -> Result<Vec<bool>, DetectorError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.current_model()?;
        let flags = score_with(&model, self.config.scaling, samples)
            .into_iter()
            .map(|s| s > model.threshold)
            .collect();
        Ok(flags)
    }

    /// Validate untyped payloads, then [`detect`](Self::detect). The whole
    /// batch is rejected on the first invalid record.
    pub fn detect_raw(&self, raw: Vec<RawTrafficSample>) -> Result<Vec<bool>, DetectorError> {
        let samples = validate_all(raw)?;
        self.detect(&samples)
    }

    /// Score a single sample on its own.
    pub fn anomaly_score(&self, sample: &TrafficSample) -> Result<f64, DetectorError> {
        let model = self.current_model()?;
        score_with(&model, self.config.scaling, std::slice::from_ref(sample))
            .first()
            .copied()
            .ok_or_else(|| DetectorError::ModelState("model returned no score".to_string()))
    }

    /// Classify a sample already believed anomalous.
    pub fn analyze(&self, sample: &TrafficSample) -> Result<AnomalyClassification, DetectorError> {
        let score = self.anomaly_score(sample)?;
        Ok(classify(sample, score))
    }

    /// Score, threshold and (if flagged) classify one sample in a single pass.
    pub fn evaluate(&self, sample: &TrafficSample) -> Result<Evaluation, DetectorError> {
        let model = self.current_model()?;
        let score = score_with(&model, self.config.scaling, std::slice::from_ref(sample))
            .first()
            .copied()
            .ok_or_else(|| DetectorError::ModelState("model returned no score".to_string()))?;
        let is_anomaly = score > model.threshold;
        let classification = is_anomaly.then(|| classify(sample, score));
        Ok(Evaluation {
            score,
            is_anomaly,
            classification,
        })
    }

    /// Replace the model with one fitted on `samples`. Nothing of the old
    /// model carries over.
    pub fn train(&self, samples: &[TrafficSample]) -> Result<TrainSummary, DetectorError> {
        if samples.is_empty() {
            return Err(ValidationError::new("samples", "training batch is empty").into());
        }

        let model = Arc::new(FittedModel::fit(samples, &self.config)?);
        let summary = TrainSummary {
            samples: model.trained_on,
            trees: model.forest.tree_count(),
            threshold: model.threshold,
        };

        {
            let mut guard = self
                .model
                .write()
                .map_err(|e| DetectorError::LockPoisoned(format!("model write lock: {}", e)))?;
            *guard = model;
        }

        info!(
            samples = summary.samples,
            trees = summary.trees,
            threshold = summary.threshold,
            "detector retrained"
        );
        self.persist_current();
        Ok(summary)
    }

    /// Validate payloads, then [`train`](Self::train).
    pub fn train_raw(&self, raw: Vec<RawTrafficSample>) -> Result<TrainSummary, DetectorError> {
        let samples = validate_all(raw)?;
        self.train(&samples)
    }

    /// Write the current model to the configured snapshot path, if any.
    /// Failures are logged only.
    fn persist_current(&self) {
        let Some(path) = self.config.model_path.as_deref() else {
            return;
        };
        let result = self
            .current_model()
            .and_then(|model| ModelSnapshot::new(&model).save(path).map_err(DetectorError::from));
        match result {
            Ok(()) => debug!(path = %path.display(), "model snapshot written"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write model snapshot"),
        }
    }
}

fn score_with(model: &FittedModel, mode: ScalingMode, samples: &[TrafficSample]) -> Vec<f64> {
    let standardized = standardize(samples, mode, &model.scaling);
    model.forest.score(&standardized)
}

fn validate_all(raw: Vec<RawTrafficSample>) -> Result<Vec<TrafficSample>, ValidationError> {
    raw.into_iter().map(TrafficSample::try_from).collect()
}
