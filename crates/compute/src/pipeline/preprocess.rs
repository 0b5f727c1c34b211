//! Feature standardization.
//!
//! Projects samples to their fixed-order feature vectors and rescales each
//! column to zero mean and unit (population) standard deviation. Columns
//! with no spread are centered but left unscaled.
//!
//! In [`ScalingMode::PerBatch`] the transform is refit on every call from the
//! batch itself, so the same sample standardizes differently depending on what
//! it is scored alongside, and a single-sample batch always maps to the
//! origin. [`ScalingMode::Frozen`] reuses the statistics captured at fit time.

use serde::{Deserialize, Serialize};

use flowwatch_core::{FeatureVector, ScalingMode, TrafficSample, FEATURE_DIM};

/// Spread below this is treated as zero.
const MIN_SCALE: f64 = 10.0 * f64::EPSILON;

/// Per-column center and spread, fitted from one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingTransform {
    pub means: FeatureVector,
    /// Divisors actually applied; 1.0 for constant columns.
    pub scales: FeatureVector,
}

impl ScalingTransform {
    /// Fit column statistics. Returns `None` for an empty batch.
    pub fn fit(features: &[FeatureVector]) -> Option<Self> {
        if features.is_empty() {
            return None;
        }
        let n = features.len() as f64;

        let mut means = [0.0; FEATURE_DIM];
        for fv in features {
            for i in 0..FEATURE_DIM {
                means[i] += fv[i];
            }
        }
        for m in &mut means {
            *m /= n;
        }

        let mut variance = [0.0; FEATURE_DIM];
        for fv in features {
            for i in 0..FEATURE_DIM {
                let diff = fv[i] - means[i];
                variance[i] += diff * diff;
            }
        }

        let mut scales = [1.0; FEATURE_DIM];
        for i in 0..FEATURE_DIM {
            let std = (variance[i] / n).sqrt();
            if std >= MIN_SCALE {
                scales[i] = std;
            }
        }

        Some(Self { means, scales })
    }

    pub fn transform_one(&self, fv: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_DIM];
        for i in 0..FEATURE_DIM {
            out[i] = (fv[i] - self.means[i]) / self.scales[i];
        }
        out
    }

    pub fn transform(&self, features: &[FeatureVector]) -> Vec<FeatureVector> {
        features.iter().map(|fv| self.transform_one(fv)).collect()
    }
}

/// Project samples to feature vectors, in input order.
pub fn project(samples: &[TrafficSample]) -> Vec<FeatureVector> {
    samples.iter().map(TrafficSample::features).collect()
}

/// Refit on `samples` and standardize them.
///
/// Returns the standardized matrix together with the transform it was built
/// with. Empty input yields an empty matrix and no transform.
pub fn fit_transform(samples: &[TrafficSample]) -> (Vec<FeatureVector>, Option<ScalingTransform>) {
    let features = project(samples);
    match ScalingTransform::fit(&features) {
        Some(transform) => (transform.transform(&features), Some(transform)),
        None => (Vec::new(), None),
    }
}

/// Standardize a scoring batch according to `mode`.
///
/// `fitted` is the transform captured at the last model fit; it is only
/// consulted in [`ScalingMode::Frozen`].
pub fn standardize(
    samples: &[TrafficSample],
    mode: ScalingMode,
    fitted: &ScalingTransform,
) -> Vec<FeatureVector> {
    match mode {
        ScalingMode::PerBatch => fit_transform(samples).0,
        ScalingMode::Frozen => fitted.transform(&project(samples)),
    }
}
