use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::ValidationError;

/// Number of scoring features projected from a sample.
pub const FEATURE_DIM: usize = 4;

/// Feature names in projection order.
pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "vehicle_count",
    "average_speed",
    "congestion_level",
    "time_of_day",
];

/// Fixed-order numeric projection of a sample:
/// `[vehicle_count, average_speed, congestion_level, time_of_day]`.
pub type FeatureVector = [f64; FEATURE_DIM];

/// One traffic measurement. Always valid once constructed: every path in
/// (`new`, `TryFrom<RawTrafficSample>`, deserialization) runs the same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTrafficSample")]
pub struct TrafficSample {
    vehicle_count: u32,
    average_speed: f64,
    congestion_level: f64,
    time_of_day: u8,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
}

impl TrafficSample {
    /// The timestamp is truncated to microseconds, the precision it is
    /// written with, so a sample survives a file round-trip unchanged.
    pub fn new(
        vehicle_count: u32,
        average_speed: f64,
        congestion_level: f64,
        time_of_day: u8,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        check_speed(average_speed)?;
        check_congestion(congestion_level)?;
        if time_of_day > 23 {
            return Err(ValidationError::new("time_of_day", "must be in [0, 23]"));
        }
        Ok(Self {
            vehicle_count,
            average_speed,
            congestion_level,
            time_of_day,
            timestamp: timestamp.trunc_subsecs(6),
        })
    }

    pub fn vehicle_count(&self) -> u32 {
        self.vehicle_count
    }

    /// Average speed in km/h.
    pub fn average_speed(&self) -> f64 {
        self.average_speed
    }

    pub fn congestion_level(&self) -> f64 {
        self.congestion_level
    }

    pub fn time_of_day(&self) -> u8 {
        self.time_of_day
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Project to the scoring feature vector.
    pub fn features(&self) -> FeatureVector {
        [
            self.vehicle_count as f64,
            self.average_speed,
            self.congestion_level,
            self.time_of_day as f64,
        ]
    }
}

/// Untyped request payload, as it arrives from outside the engine.
///
/// Every field is optional so that a missing key surfaces as a
/// [`ValidationError`] naming the field instead of a generic parse failure.
/// A missing timestamp defaults to the time of validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTrafficSample {
    #[serde(default)]
    pub vehicle_count: Option<f64>,
    #[serde(default)]
    pub average_speed: Option<f64>,
    #[serde(default)]
    pub congestion_level: Option<f64>,
    #[serde(default)]
    pub time_of_day: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TryFrom<RawTrafficSample> for TrafficSample {
    type Error = ValidationError;

    fn try_from(raw: RawTrafficSample) -> Result<Self, Self::Error> {
        let vehicle_count = require("vehicle_count", raw.vehicle_count)?;
        let average_speed = require("average_speed", raw.average_speed)?;
        let congestion_level = require("congestion_level", raw.congestion_level)?;
        let time_of_day = require("time_of_day", raw.time_of_day)?;

        if vehicle_count.fract() != 0.0 || vehicle_count < 0.0 || vehicle_count > u32::MAX as f64 {
            return Err(ValidationError::new(
                "vehicle_count",
                "must be a non-negative integer",
            ));
        }
        if time_of_day.fract() != 0.0 || !(0.0..=23.0).contains(&time_of_day) {
            return Err(ValidationError::new(
                "time_of_day",
                "must be an integer in [0, 23]",
            ));
        }

        let timestamp = match raw.timestamp.as_deref() {
            Some(text) => parse_timestamp(text)?,
            None => Utc::now(),
        };

        TrafficSample::new(
            vehicle_count as u32,
            average_speed,
            congestion_level,
            time_of_day as u8,
            timestamp,
        )
    }
}

impl From<&TrafficSample> for RawTrafficSample {
    fn from(sample: &TrafficSample) -> Self {
        Self {
            vehicle_count: Some(sample.vehicle_count as f64),
            average_speed: Some(sample.average_speed),
            congestion_level: Some(sample.congestion_level),
            time_of_day: Some(sample.time_of_day as f64),
            timestamp: Some(format_timestamp(&sample.timestamp)),
        }
    }
}

/// ISO-8601 text used on disk. Microsecond precision, `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 text, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ValidationError::new("timestamp", "not an ISO-8601 timestamp"))
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_timestamp(ts))
}

fn require(field: &'static str, value: Option<f64>) -> Result<f64, ValidationError> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        Some(_) => Err(ValidationError::new(field, "must be a finite number")),
        None => Err(ValidationError::new(field, "missing")),
    }
}

fn check_speed(v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() || v < 0.0 {
        return Err(ValidationError::new("average_speed", "must be a non-negative number"));
    }
    Ok(())
}

fn check_congestion(v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(ValidationError::new("congestion_level", "must be in [0, 1]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(vc: f64, speed: f64, cong: f64, tod: f64) -> RawTrafficSample {
        RawTrafficSample {
            vehicle_count: Some(vc),
            average_speed: Some(speed),
            congestion_level: Some(cong),
            time_of_day: Some(tod),
            timestamp: None,
        }
    }

    #[test]
    fn features_follow_fixed_order() {
        let s = TrafficSample::try_from(raw(120.0, 55.5, 0.4, 8.0)).unwrap();
        assert_eq!(s.features(), [120.0, 55.5, 0.4, 8.0]);
    }

    #[test]
    fn float_time_of_day_is_accepted_when_integral() {
        let s = TrafficSample::try_from(raw(500.0, 20.0, 0.9, 12.0)).unwrap();
        assert_eq!(s.time_of_day(), 12);
    }

    #[test]
    fn missing_field_is_named() {
        let mut r = raw(100.0, 60.0, 0.5, 8.0);
        r.average_speed = None;
        let err = TrafficSample::try_from(r).unwrap_err();
        assert_eq!(err.field, "average_speed");
        assert_eq!(err.reason, "missing");
    }

    #[test]
    fn out_of_range_values_rejected() {
        assert!(TrafficSample::try_from(raw(-1.0, 60.0, 0.5, 8.0)).is_err());
        assert!(TrafficSample::try_from(raw(10.5, 60.0, 0.5, 8.0)).is_err());
        assert!(TrafficSample::try_from(raw(10.0, -3.0, 0.5, 8.0)).is_err());
        assert!(TrafficSample::try_from(raw(10.0, 60.0, 1.5, 8.0)).is_err());
        assert!(TrafficSample::try_from(raw(10.0, 60.0, 0.5, 24.0)).is_err());
        assert!(TrafficSample::try_from(raw(10.0, f64::NAN, 0.5, 8.0)).is_err());
    }

    #[test]
    fn json_payload_without_field_fails_validation() {
        let json = r#"{"vehicle_count": 100, "average_speed": 60.0, "time_of_day": 8}"#;
        let err = serde_json::from_str::<TrafficSample>(json).unwrap_err();
        assert!(err.to_string().contains("congestion_level"));
    }

    #[test]
    fn naive_timestamp_is_read_as_utc() {
        let ts = parse_timestamp("2024-03-01T08:15:30.123456").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T08:15:30.123456Z");
    }

    #[test]
    fn timestamp_is_kept_at_microsecond_precision() {
        let ts = parse_timestamp("2024-03-01T08:15:30.123456789Z").unwrap();
        let s = TrafficSample::new(10, 50.0, 0.5, 8, ts).unwrap();
        assert_eq!(format_timestamp(&s.timestamp()), "2024-03-01T08:15:30.123456Z");
        let back: TrafficSample = serde_json::from_str(&serde_json::to_string(&s).unwrap()).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn json_roundtrip_keeps_timestamp_text() {
        let json = r#"{"vehicle_count":90,"average_speed":48.25,"congestion_level":0.55,"time_of_day":17,"timestamp":"2024-03-01T08:15:30.123456Z"}"#;
        let sample: TrafficSample = serde_json::from_str(json).unwrap();
        assert_eq!(serde_json::to_string(&sample).unwrap(), json);
    }
}
