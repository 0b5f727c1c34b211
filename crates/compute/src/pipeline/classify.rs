//! Rule-based labelling of flagged samples.
//!
//! Rules are evaluated top to bottom and the first match wins, so a sample
//! with both high volume and low speed is reported as high volume.

use serde::{Deserialize, Serialize};

use flowwatch_core::TrafficSample;

/// Vehicle count above which volume is considered abnormal.
pub const HIGH_VOLUME_VEHICLES: u32 = 150;
/// Speed (km/h) below which traffic is considered congested.
pub const CONGESTED_SPEED_KMH: f64 = 40.0;
/// Speed (km/h) above which traffic is considered speeding.
pub const SPEEDING_SPEED_KMH: f64 = 60.0;
/// Congestion level above which congestion is considered severe.
pub const SEVERE_CONGESTION_LEVEL: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    HighTrafficVolume,
    TrafficCongestion,
    SpeedingViolation,
    SevereCongestion,
    UnusualPattern,
}

impl AnomalyCategory {
    /// Pick the category for a sample. Depends only on the sample's fields.
    pub fn of(sample: &TrafficSample) -> Self {
        if sample.vehicle_count() > HIGH_VOLUME_VEHICLES {
            AnomalyCategory::HighTrafficVolume
        } else if sample.average_speed() < CONGESTED_SPEED_KMH {
            AnomalyCategory::TrafficCongestion
        } else if sample.average_speed() > SPEEDING_SPEED_KMH {
            AnomalyCategory::SpeedingViolation
        } else if sample.congestion_level() > SEVERE_CONGESTION_LEVEL {
            AnomalyCategory::SevereCongestion
        } else {
            AnomalyCategory::UnusualPattern
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyCategory::HighTrafficVolume => "high_traffic_volume",
            AnomalyCategory::TrafficCongestion => "traffic_congestion",
            AnomalyCategory::SpeedingViolation => "speeding_violation",
            AnomalyCategory::SevereCongestion => "severe_congestion",
            AnomalyCategory::UnusualPattern => "unusual_pattern",
        }
    }
}

impl std::fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse severity bucket used in descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityTier {
    Low,
    Moderate,
    High,
}

impl SeverityTier {
    pub fn from_severity(severity: f64) -> Self {
        if severity > 0.7 {
            SeverityTier::High
        } else if severity > 0.4 {
            SeverityTier::Moderate
        } else {
            SeverityTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityTier::Low => "low",
            SeverityTier::Moderate => "moderate",
            SeverityTier::High => "high",
        }
    }

    fn capitalized(&self) -> &'static str {
        match self {
            SeverityTier::Low => "Low",
            SeverityTier::Moderate => "Moderate",
            SeverityTier::High => "High",
        }
    }
}

/// Label and explanation for a flagged sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyClassification {
    pub category: AnomalyCategory,
    /// `clamp(score / 2, 0, 1)`.
    pub severity: f64,
    pub description: String,
}

/// Map an anomaly score to a severity in `[0, 1]`.
pub fn severity_from_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    (score / 2.0).clamp(0.0, 1.0)
}

/// Classify a sample given its anomaly score. Pure and deterministic.
pub fn classify(sample: &TrafficSample, score: f64) -> AnomalyClassification {
    let category = AnomalyCategory::of(sample);
    let severity = severity_from_score(score);
    let tier = SeverityTier::from_severity(severity);
    AnomalyClassification {
        category,
        severity,
        description: describe(category, tier, sample),
    }
}

fn describe(category: AnomalyCategory, tier: SeverityTier, sample: &TrafficSample) -> String {
    match category {
        AnomalyCategory::HighTrafficVolume => format!(
            "Unusually {} traffic volume detected with {} vehicles",
            tier.as_str(),
            sample.vehicle_count()
        ),
        AnomalyCategory::TrafficCongestion => format!(
            "{} congestion detected with average speed of {:.1}km/h",
            tier.capitalized(),
            sample.average_speed()
        ),
        AnomalyCategory::SpeedingViolation => format!(
            "{} speed violation detected with average speed of {:.1}km/h",
            tier.capitalized(),
            sample.average_speed()
        ),
        AnomalyCategory::SevereCongestion => format!(
            "{} severe congestion detected with congestion level {:.2}",
            tier.capitalized(),
            sample.congestion_level()
        ),
        AnomalyCategory::UnusualPattern => format!(
            "{} anomaly detected in traffic pattern",
            tier.capitalized()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(vc: u32, speed: f64, cong: f64) -> TrafficSample {
        TrafficSample::new(vc, speed, cong, 12, Utc::now()).unwrap()
    }

    #[test]
    fn volume_rule_fires_first() {
        let s = sample(500, 20.0, 0.9);
        assert_eq!(AnomalyCategory::of(&s), AnomalyCategory::HighTrafficVolume);
    }

    #[test]
    fn rules_in_order() {
        assert_eq!(AnomalyCategory::of(&sample(100, 30.0, 0.9)), AnomalyCategory::TrafficCongestion);
        assert_eq!(AnomalyCategory::of(&sample(30, 95.0, 0.9)), AnomalyCategory::SpeedingViolation);
        assert_eq!(AnomalyCategory::of(&sample(100, 50.0, 0.65)), AnomalyCategory::SevereCongestion);
        assert_eq!(AnomalyCategory::of(&sample(100, 50.0, 0.5)), AnomalyCategory::UnusualPattern);
    }

    #[test]
    fn boundaries_are_exclusive() {
        assert_eq!(AnomalyCategory::of(&sample(150, 40.0, 0.6)), AnomalyCategory::UnusualPattern);
        assert_eq!(AnomalyCategory::of(&sample(151, 50.0, 0.5)), AnomalyCategory::HighTrafficVolume);
        assert_eq!(AnomalyCategory::of(&sample(100, 60.0, 0.5)), AnomalyCategory::UnusualPattern);
    }

    #[test]
    fn severity_is_clamped() {
        assert_eq!(severity_from_score(0.5), 0.25);
        assert_eq!(severity_from_score(5.0), 1.0);
        assert_eq!(severity_from_score(-1.0), 0.0);
        assert_eq!(severity_from_score(f64::NAN), 0.0);
    }

    #[test]
    fn tiers() {
        assert_eq!(SeverityTier::from_severity(0.71), SeverityTier::High);
        assert_eq!(SeverityTier::from_severity(0.7), SeverityTier::Moderate);
        assert_eq!(SeverityTier::from_severity(0.41), SeverityTier::Moderate);
        assert_eq!(SeverityTier::from_severity(0.4), SeverityTier::Low);
    }

    #[test]
    fn descriptions_interpolate_fields() {
        let c = classify(&sample(212, 28.0, 0.8), 0.9);
        assert_eq!(c.category, AnomalyCategory::HighTrafficVolume);
        assert_eq!(c.severity, 0.45);
        assert_eq!(c.description, "Unusually moderate traffic volume detected with 212 vehicles");

        let c = classify(&sample(90, 12.34, 0.95), 0.3);
        assert_eq!(c.description, "Low congestion detected with average speed of 12.3km/h");

        let c = classify(&sample(100, 55.0, 0.66), 1.8);
        assert_eq!(c.description, "High severe congestion detected with congestion level 0.66");
    }

    #[test]
    fn classification_is_reproducible() {
        let s = sample(40, 101.5, 0.2);
        assert_eq!(classify(&s, 0.62), classify(&s, 0.62));
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&AnomalyCategory::HighTrafficVolume).unwrap();
        assert_eq!(json, "\"high_traffic_volume\"");
    }
}
