//! flowwatch-worker: runs the streaming simulator and offline detector jobs.
//!
//! Subcommands:
//! - `run`      start the generate → score → checkpoint loop until Ctrl-C
//! - `generate` write a shuffled synthetic dataset to a JSON file
//! - `detect`   score a JSON array of samples and print one verdict per record
//! - `train`    refit the detector on a JSON array of samples

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use flowwatch_compute::{generate_dataset, Detector, JsonFileStore, Simulator};
use flowwatch_core::config::load_dotenv;
use flowwatch_core::{Config, RawTrafficSample, ScalingMode, TrafficSample};

// ── CLI ─────────────────────────────────────────────────────────────

/// Traffic anomaly detection worker.
#[derive(Parser, Debug)]
#[command(name = "flowwatch-worker", version, about)]
struct Cli {
    /// Config profile; keys are looked up as `{PROFILE}_{KEY}` first.
    #[arg(long, global = true, env = "FLOWWATCH_PROFILE")]
    profile: Option<String>,

    #[command(flatten)]
    detector: DetectorArgs,

    #[command(subcommand)]
    command: Command,
}

/// Detector overrides shared by every subcommand.
#[derive(Args, Debug)]
struct DetectorArgs {
    /// Number of isolation trees.
    #[arg(long, global = true)]
    trees: Option<usize>,

    /// Expected anomalous fraction, in (0, 0.5].
    #[arg(long, global = true)]
    contamination: Option<f64>,

    /// How scoring batches are standardized (per_batch | frozen).
    #[arg(long, global = true)]
    scaling: Option<ScalingMode>,

    /// JSON model snapshot to restore from and write to.
    #[arg(long, global = true)]
    model_path: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the streaming simulator until interrupted.
    Run {
        /// Milliseconds between ticks.
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Milliseconds between history checkpoints.
        #[arg(long)]
        save_interval_ms: Option<u64>,

        /// Chance that a tick draws an anomalous profile.
        #[arg(long)]
        anomaly_probability: Option<f64>,

        /// History checkpoint file.
        #[arg(long)]
        data_file: Option<PathBuf>,

        /// Generator seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Stop on its own after this many seconds.
        #[arg(long, env = "FLOWWATCH_RUN_SECS")]
        duration_secs: Option<u64>,
    },
    /// Write a synthetic dataset.
    Generate {
        /// Number of normal samples.
        #[arg(long, env = "FLOWWATCH_GEN_NORMAL", default_value_t = 50)]
        normal: usize,

        /// Number of anomalous samples.
        #[arg(long, env = "FLOWWATCH_GEN_ANOMALIES", default_value_t = 10)]
        anomalies: usize,

        /// Output file (defaults to the simulator data file).
        #[arg(long, short)]
        output: Option<PathBuf>,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Score samples from a JSON file.
    Detect {
        #[arg(long, short)]
        input: PathBuf,
    },
    /// Refit the detector on samples from a JSON file.
    Train {
        #[arg(long, short)]
        input: PathBuf,
    },
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = Config::for_profile(cli.profile.as_deref().unwrap_or_default());
    apply_detector_overrides(&mut config, &cli.detector);

    match cli.command {
        Command::Run {
            tick_ms,
            save_interval_ms,
            anomaly_probability,
            data_file,
            seed,
            duration_secs,
        } => {
            let sim = &mut config.simulator;
            if let Some(v) = tick_ms {
                sim.tick_interval_ms = v;
            }
            if let Some(v) = save_interval_ms {
                sim.save_interval_ms = v;
            }
            if let Some(v) = anomaly_probability {
                sim.anomaly_probability = v;
            }
            if let Some(v) = data_file {
                sim.data_file = v;
            }
            if seed.is_some() {
                sim.seed = seed;
            }
            config.validate()?;
            config.log_summary();
            run_simulator(config, duration_secs.map(Duration::from_secs)).await
        }
        Command::Generate {
            normal,
            anomalies,
            output,
            seed,
        } => {
            let output = output.unwrap_or_else(|| config.simulator.data_file.clone());
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let data = generate_dataset(normal, anomalies, &mut rng)?;
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&output, serde_json::to_vec_pretty(&data)?)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(path = %output.display(), records = data.len(), "synthetic dataset written");
            Ok(())
        }
        Command::Detect { input } => {
            config.validate()?;
            let detector = build_detector(&config)?;
            let samples = read_samples(&input)?;
            let scores = detector.score(&samples)?;
            let flags = detector.detect(&samples)?;

            for (i, ((sample, score), flagged)) in samples.iter().zip(scores).zip(flags).enumerate() {
                let mut verdict = serde_json::json!({
                    "index": i,
                    "is_anomaly": flagged,
                    "score": score,
                });
                if flagged {
                    let c = detector.analyze(sample)?;
                    verdict["category"] = serde_json::json!(c.category);
                    verdict["severity"] = serde_json::json!(c.severity);
                    verdict["description"] = serde_json::json!(c.description);
                }
                println!("{}", verdict);
            }
            Ok(())
        }
        Command::Train { input } => {
            config.validate()?;
            let detector = build_detector(&config)?;
            let samples = read_samples(&input)?;
            let summary = detector.train(&samples)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if config.detector.model_path.is_none() {
                warn!("no model path configured, the retrained model is not kept");
            }
            Ok(())
        }
    }
}

fn apply_detector_overrides(config: &mut Config, args: &DetectorArgs) {
    let d = &mut config.detector;
    if let Some(v) = args.trees {
        d.trees = v;
    }
    if let Some(v) = args.contamination {
        d.contamination = v;
    }
    if let Some(v) = args.scaling {
        d.scaling = v;
    }
    if let Some(v) = &args.model_path {
        d.model_path = Some(v.clone());
    }
}

/// Restore from the snapshot when one exists, otherwise seed a fresh model.
fn build_detector(config: &Config) -> anyhow::Result<Detector> {
    let detector_config = config.detector.clone();
    if let Some(path) = detector_config.model_path.clone() {
        if path.exists() {
            return Ok(Detector::from_snapshot(detector_config, &path)?);
        }
    }
    Ok(Detector::new(detector_config)?)
}

/// Read a JSON array of samples, validating every record.
fn read_samples(path: &Path) -> anyhow::Result<Vec<TrafficSample>> {
    let json = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: Vec<RawTrafficSample> = serde_json::from_slice(&json)
        .with_context(|| format!("parsing {}", path.display()))?;
    raw.into_iter()
        .enumerate()
        .map(|(i, r)| {
            TrafficSample::try_from(r).with_context(|| format!("record {} is invalid", i))
        })
        .collect()
}

async fn run_simulator(config: Config, duration: Option<Duration>) -> anyhow::Result<()> {
    let detector = Arc::new(build_detector(&config)?);
    let store = Arc::new(JsonFileStore::new(&config.simulator.data_file));
    let simulator = Simulator::new(config.simulator.clone(), detector, store).await?;

    let (handle, join) = simulator.spawn()?;
    info!("flowwatch-worker running, press Ctrl-C to stop");

    match duration {
        Some(d) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = tokio::time::sleep(d) => info!(secs = d.as_secs(), "run duration elapsed"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
        }
    }

    handle.stop()?;
    let simulator = join.await?;
    let status = simulator.status();
    info!(
        ticks = status.ticks,
        anomalies = status.anomalies_flagged,
        flushes = status.flushes,
        flush_failures = status.flush_failures,
        tick_failures = status.tick_failures,
        history = status.history_len,
        "flowwatch-worker exited cleanly"
    );
    Ok(())
}
