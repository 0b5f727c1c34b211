//! End-to-end scenarios through the public API: seeding, batch detection,
//! classification, retraining, and a simulator run with checkpoint reload.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;

use flowwatch_compute::detector::seed_samples;
use flowwatch_compute::{
    generate_dataset, AnomalyCategory, Detector, DetectorError, JsonFileStore, Simulator,
    SimulatorState, TrafficProfile,
};
use flowwatch_core::{DetectorConfig, RawTrafficSample, ScalingMode, SimulatorConfig, TrafficSample};

fn detector_config(scaling: ScalingMode) -> DetectorConfig {
    DetectorConfig {
        trees: 100,
        scaling,
        ..DetectorConfig::default()
    }
}

#[test]
fn seeded_detector_scores_its_seed_samples() {
    let detector = Detector::new(detector_config(ScalingMode::PerBatch)).unwrap();
    let flags = detector.detect(&seed_samples().unwrap()).unwrap();
    assert_eq!(flags.len(), 5);
    assert!(flags.iter().filter(|f| **f).count() <= 2);
}

#[test]
fn detect_is_order_preserving_and_empty_safe() {
    let detector = Detector::new(detector_config(ScalingMode::Frozen)).unwrap();
    assert!(detector.detect(&[]).unwrap().is_empty());

    let mut rng = StdRng::seed_from_u64(5);
    let batch = generate_dataset(30, 6, &mut rng).unwrap();
    let flags = detector.detect(&batch).unwrap();
    let scores = detector.score(&batch).unwrap();
    assert_eq!(flags.len(), batch.len());

    let threshold = detector.threshold().unwrap();
    for (flag, score) in flags.iter().zip(&scores) {
        assert_eq!(*flag, *score > threshold);
    }

    let reversed: Vec<_> = batch.iter().rev().cloned().collect();
    let mut rev_flags = detector.detect(&reversed).unwrap();
    rev_flags.reverse();
    assert_eq!(rev_flags, flags);
}

#[test]
fn high_volume_rule_fires_first() {
    let detector = Detector::new(detector_config(ScalingMode::PerBatch)).unwrap();
    let sample = TrafficSample::new(500, 20.0, 0.9, 12, Utc::now()).unwrap();
    let c = detector.analyze(&sample).unwrap();
    assert_eq!(c.category, AnomalyCategory::HighTrafficVolume);
    assert!(c.description.contains("500 vehicles"));
}

#[test]
fn malformed_payload_never_reaches_the_model() {
    let detector = Detector::new(detector_config(ScalingMode::PerBatch)).unwrap();
    let payload = r#"[
        {"vehicle_count": 120, "average_speed": 55.0, "congestion_level": 0.4, "time_of_day": 9},
        {"vehicle_count": 120, "average_speed": 55.0, "time_of_day": 9}
    ]"#;
    let raw: Vec<RawTrafficSample> = serde_json::from_str(payload).unwrap();
    match detector.detect_raw(raw) {
        Err(DetectorError::Validation(e)) => assert_eq!(e.field, "congestion_level"),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn retraining_on_mixed_population_flags_anomalies() {
    let detector = Detector::new(detector_config(ScalingMode::Frozen)).unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    let training = generate_dataset(50, 10, &mut rng).unwrap();

    let summary = detector.train(&training).unwrap();
    assert_eq!(summary.samples, 60);
    assert_eq!(summary.trees, 100);

    let flags = detector.detect(&training).unwrap();
    let flagged = flags.iter().filter(|f| **f).count();
    // Contamination 0.4 of 60 training points.
    assert!((18..=24).contains(&flagged), "flagged {}", flagged);

    let anomalous: Vec<_> = training
        .iter()
        .zip(&flags)
        .filter(|(s, _)| !TrafficProfile::Normal.contains(s))
        .collect();
    let caught = anomalous.iter().filter(|(_, f)| **f).count();
    assert!(caught * 2 >= anomalous.len(), "caught {} of {}", caught, anomalous.len());
}

#[tokio::test]
async fn simulator_run_persists_and_reloads() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("synthetic_traffic_data.json");
    let detector = Arc::new(Detector::new(detector_config(ScalingMode::PerBatch)).unwrap());

    let config = SimulatorConfig {
        tick_interval_ms: 5,
        save_interval_ms: 20,
        error_backoff_ms: 5,
        anomaly_probability: 0.2,
        data_file: path.clone(),
        seed: Some(23),
        ..SimulatorConfig::default()
    };

    let sim = Simulator::new(
        config.clone(),
        Arc::clone(&detector),
        Arc::new(JsonFileStore::new(&path)),
    )
    .await
    .unwrap();
    let (handle, join) = sim.spawn().unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.stop().unwrap();
    let sim = join.await.unwrap();

    assert_eq!(handle.state(), SimulatorState::Idle);
    let status = sim.status();
    assert!(status.ticks > 0);
    assert!(status.flushes >= 1);
    assert_eq!(status.tick_failures, 0);

    let reloaded = Simulator::new(config, detector, Arc::new(JsonFileStore::new(&path)))
        .await
        .unwrap();
    assert_eq!(reloaded.history().to_vec(), sim.history().to_vec());

    let text = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    let first = &value[0];
    for field in ["vehicle_count", "average_speed", "congestion_level", "time_of_day", "timestamp"] {
        assert!(first.get(field).is_some(), "missing {}", field);
    }
}
