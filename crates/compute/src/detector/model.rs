use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowwatch_core::{DetectorConfig, TrafficSample, ValidationError};

use crate::algorithms::isolation_forest::{contamination_threshold, ForestParams, IsolationForest};
use crate::pipeline::preprocess::{fit_transform, ScalingTransform};

use super::DetectorError;

/// Everything a scoring call needs, replaced as one unit on `train`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub forest: IsolationForest,
    /// Standardization statistics of the training batch.
    pub scaling: ScalingTransform,
    /// Scores strictly above this are anomalous.
    pub threshold: f64,
    pub contamination: f64,
    pub trained_on: usize,
    pub fitted_at: DateTime<Utc>,
}

impl FittedModel {
    /// Fit scaling, forest and threshold on `samples`.
    pub fn fit(samples: &[TrafficSample], config: &DetectorConfig) -> Result<Self, DetectorError> {
        let (standardized, scaling) = fit_transform(samples);
        let scaling = scaling.ok_or_else(|| {
            DetectorError::ModelState("cannot fit a model on an empty batch".to_string())
        })?;

        let params = ForestParams {
            trees: config.trees,
            max_samples: config.max_samples,
            seed: config.seed,
        };
        let forest = IsolationForest::fit(&standardized, &params).ok_or_else(|| {
            DetectorError::ModelState("isolation forest received no points".to_string())
        })?;

        let training_scores = forest.score(&standardized);
        let threshold = contamination_threshold(&training_scores, config.contamination);

        Ok(Self {
            forest,
            scaling,
            threshold,
            contamination: config.contamination,
            trained_on: samples.len(),
            fitted_at: Utc::now(),
        })
    }

    /// Reject a model that would panic or score NaN, e.g. a hand-edited or
    /// truncated snapshot.
    pub fn check(&self) -> Result<(), DetectorError> {
        self.forest.check().map_err(DetectorError::ModelState)?;
        let scaling_ok = self.scaling.means.iter().all(|m| m.is_finite())
            && self.scaling.scales.iter().all(|s| s.is_finite() && *s > 0.0);
        if !scaling_ok {
            return Err(DetectorError::ModelState(
                "scaling statistics must be finite with positive spread".to_string(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(DetectorError::ModelState("threshold is not finite".to_string()));
        }
        Ok(())
    }
}

/// The samples every detector is seeded with, so it never starts unfitted.
pub fn seed_samples() -> Result<Vec<TrafficSample>, ValidationError> {
    let now = Utc::now();
    [
        (100, 60.0, 0.5, 8),
        (250, 30.0, 0.8, 9),
        (150, 55.0, 0.6, 13),
        (300, 25.0, 0.9, 17),
        (80, 65.0, 0.3, 22),
    ]
    .into_iter()
    .map(|(vc, speed, cong, tod)| TrafficSample::new(vc, speed, cong, tod, now))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig {
            trees: 50,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn seed_data_is_complete() {
        let samples = seed_samples().unwrap();
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0].features(), [100.0, 60.0, 0.5, 8.0]);
        assert_eq!(samples[4].features(), [80.0, 65.0, 0.3, 22.0]);
    }

    #[test]
    fn seed_fit_flags_contamination_share() {
        let samples = seed_samples().unwrap();
        let model = FittedModel::fit(&samples, &config()).unwrap();
        let (standardized, _) = fit_transform(&samples);
        let flagged = model
            .forest
            .score(&standardized)
            .into_iter()
            .filter(|s| *s > model.threshold)
            .count();
        assert!(flagged <= 2, "flagged {} of 5", flagged);
        assert_eq!(model.trained_on, 5);
    }

    #[test]
    fn fitted_model_passes_check() {
        let model = FittedModel::fit(&seed_samples().unwrap(), &config()).unwrap();
        assert!(model.check().is_ok());
    }

    #[test]
    fn zero_spread_scaling_fails_check() {
        let mut model = FittedModel::fit(&seed_samples().unwrap(), &config()).unwrap();
        model.scaling.scales[2] = 0.0;
        assert!(matches!(model.check(), Err(DetectorError::ModelState(_))));
    }

    #[test]
    fn empty_batch_is_model_state_error() {
        let err = FittedModel::fit(&[], &config()).unwrap_err();
        assert!(matches!(err, DetectorError::ModelState(_)));
    }
}
