//! Scoring pipeline stages around the isolation forest.
//!
//! - **preprocess**: projection to feature vectors and standardization.
//! - **classify**: rule-based category, severity and description for
//!   samples the detector flags.

pub mod classify;
pub mod preprocess;

pub use classify::{classify, AnomalyCategory, AnomalyClassification, SeverityTier};
pub use preprocess::{fit_transform, standardize, ScalingTransform};
