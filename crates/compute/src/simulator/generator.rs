//! Synthetic traffic generation.
//!
//! Each profile draws every field independently and uniformly from a fixed
//! range; nothing is carried between draws.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use flowwatch_core::{TrafficSample, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficProfile {
    Normal,
    HighVolume,
    Congestion,
    Speeding,
}

/// Inclusive generation bounds for one profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileRanges {
    pub vehicle_count: (u32, u32),
    pub average_speed: (f64, f64),
    pub congestion_level: (f64, f64),
}

const TIME_OF_DAY: (u8, u8) = (0, 23);

impl TrafficProfile {
    /// Anomalous profiles, drawn uniformly when a tick goes anomalous.
    pub const ANOMALIES: [TrafficProfile; 3] = [
        TrafficProfile::HighVolume,
        TrafficProfile::Congestion,
        TrafficProfile::Speeding,
    ];

    pub fn is_anomalous(&self) -> bool {
        !matches!(self, TrafficProfile::Normal)
    }

    pub fn ranges(&self) -> ProfileRanges {
        match self {
            TrafficProfile::Normal => ProfileRanges {
                vehicle_count: (50, 150),
                average_speed: (40.0, 70.0),
                congestion_level: (0.3, 0.7),
            },
            TrafficProfile::HighVolume => ProfileRanges {
                vehicle_count: (151, 250),
                average_speed: (20.0, 35.0),
                congestion_level: (0.7, 0.9),
            },
            TrafficProfile::Congestion => ProfileRanges {
                vehicle_count: (80, 150),
                average_speed: (5.0, 19.0),
                congestion_level: (0.8, 1.0),
            },
            TrafficProfile::Speeding => ProfileRanges {
                vehicle_count: (20, 50),
                average_speed: (81.0, 120.0),
                congestion_level: (0.1, 0.3),
            },
        }
    }

    /// Draw one sample from this profile.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        timestamp: DateTime<Utc>,
    ) -> Result<TrafficSample, ValidationError> {
        let r = self.ranges();
        TrafficSample::new(
            rng.gen_range(r.vehicle_count.0..=r.vehicle_count.1),
            rng.gen_range(r.average_speed.0..=r.average_speed.1),
            rng.gen_range(r.congestion_level.0..=r.congestion_level.1),
            rng.gen_range(TIME_OF_DAY.0..=TIME_OF_DAY.1),
            timestamp,
        )
    }

    /// Whether `sample` lies within this profile's bounds.
    pub fn contains(&self, sample: &TrafficSample) -> bool {
        let r = self.ranges();
        (r.vehicle_count.0..=r.vehicle_count.1).contains(&sample.vehicle_count())
            && (r.average_speed.0..=r.average_speed.1).contains(&sample.average_speed())
            && (r.congestion_level.0..=r.congestion_level.1).contains(&sample.congestion_level())
            && (TIME_OF_DAY.0..=TIME_OF_DAY.1).contains(&sample.time_of_day())
    }
}

/// Per-tick sample source for the simulator.
#[derive(Debug, Clone)]
pub struct TrafficGenerator {
    anomaly_probability: f64,
    rng: StdRng,
}

impl TrafficGenerator {
    /// Entropy-seeded unless `seed` is given.
    pub fn new(anomaly_probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            anomaly_probability,
            rng,
        }
    }

    pub fn anomaly_probability(&self) -> f64 {
        self.anomaly_probability
    }

    /// Decide this tick's profile with an independent probability draw.
    pub fn pick_profile(&mut self) -> TrafficProfile {
        if self.rng.gen::<f64>() < self.anomaly_probability {
            pick_anomaly(&mut self.rng)
        } else {
            TrafficProfile::Normal
        }
    }

    /// Draw the next sample, timestamped now.
    pub fn next_sample(&mut self) -> Result<(TrafficProfile, TrafficSample), ValidationError> {
        let profile = self.pick_profile();
        let sample = profile.generate(&mut self.rng, Utc::now())?;
        Ok((profile, sample))
    }
}

fn pick_anomaly<R: Rng + ?Sized>(rng: &mut R) -> TrafficProfile {
    TrafficProfile::ANOMALIES
        .choose(rng)
        .copied()
        .unwrap_or(TrafficProfile::HighVolume)
}

/// `normal` normal samples plus `anomalies` anomalous ones, shuffled.
pub fn generate_dataset<R: Rng + ?Sized>(
    normal: usize,
    anomalies: usize,
    rng: &mut R,
) -> Result<Vec<TrafficSample>, ValidationError> {
    let now = Utc::now();
    let mut data = Vec::with_capacity(normal + anomalies);
    for _ in 0..normal {
        data.push(TrafficProfile::Normal.generate(rng, now)?);
    }
    for _ in 0..anomalies {
        let profile = pick_anomaly(rng);
        data.push(profile.generate(rng, now)?);
    }
    data.shuffle(rng);
    Ok(data)
}
