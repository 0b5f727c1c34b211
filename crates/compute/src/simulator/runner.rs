use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowwatch_core::{SimulatorConfig, TrafficSample};

use crate::detector::{Detector, Evaluation};
use crate::store::HistoryStore;

use super::generator::{TrafficGenerator, TrafficProfile};
use super::history::HistoryBuffer;
use super::state::{Control, SimulatorState, SimulatorStatus};
use super::SimulatorError;

/// What one tick produced.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub profile: TrafficProfile,
    pub sample: TrafficSample,
    pub evaluation: Evaluation,
    /// Whether the tick ended with a successful checkpoint.
    pub flushed: bool,
}

/// Drives the generate → score → retain → checkpoint loop.
///
/// A single task owns the simulator; ticks never overlap. The stop signal is
/// observed between ticks only, so shutdown waits for at most one tick body
/// plus the final checkpoint.
pub struct Simulator {
    config: SimulatorConfig,
    detector: Arc<Detector>,
    store: Arc<dyn HistoryStore>,
    generator: TrafficGenerator,
    history: HistoryBuffer,
    control: Arc<Control>,
    last_flush: Instant,
}

impl Simulator {
    /// Build an idle simulator, hydrating history from `store` when a
    /// checkpoint exists. An unreadable checkpoint is logged and ignored.
    pub async fn new(
        config: SimulatorConfig,
        detector: Arc<Detector>,
        store: Arc<dyn HistoryStore>,
    ) -> Result<Self, SimulatorError> {
        config
            .validate()
            .map_err(|e| SimulatorError::Config(e.to_string()))?;

        let history = match store.load().await {
            Ok(Some(samples)) => {
                info!(
                    location = %store.location(),
                    samples = samples.len(),
                    "history hydrated from checkpoint"
                );
                HistoryBuffer::from_samples(samples, config.history_capacity)
            }
            Ok(None) => HistoryBuffer::new(config.history_capacity),
            Err(e) => {
                warn!(
                    location = %store.location(),
                    error = %e,
                    "failed to load history checkpoint, starting empty"
                );
                HistoryBuffer::new(config.history_capacity)
            }
        };

        let control = Arc::new(Control::new());
        let history_len = history.len();
        control.update_status(|s| s.history_len = history_len);

        Ok(Self {
            generator: TrafficGenerator::new(config.anomaly_probability, config.seed),
            config,
            detector,
            store,
            history,
            control,
            last_flush: Instant::now(),
        })
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn state(&self) -> SimulatorState {
        self.control.state()
    }

    pub fn status(&self) -> SimulatorStatus {
        self.control.status()
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// One iteration: generate, score, retain, and checkpoint if due.
    ///
    /// A failed checkpoint is returned as an error after the sample has been
    /// retained; the flush timer is only reset on success.
    pub async fn tick(&mut self) -> Result<TickOutcome, SimulatorError> {
        let started = Instant::now();

        let (profile, sample) = self
            .generator
            .next_sample()
            .map_err(|e| SimulatorError::Generation(e.to_string()))?;
        let evaluation = self.detector.evaluate(&sample)?;

        if let Some(c) = &evaluation.classification {
            warn!(
                category = %c.category,
                severity = c.severity,
                score = evaluation.score,
                "Anomaly detected! {}",
                c.description
            );
        }

        self.history.push(sample.clone());
        let history_len = self.history.len();
        let flagged = evaluation.is_anomaly;
        self.control
            .update_status(|s| s.record_tick(started.elapsed(), flagged, history_len));

        debug!(
            profile = ?profile,
            score = evaluation.score,
            anomaly = flagged,
            history = history_len,
            "tick"
        );

        let flushed = if self.last_flush.elapsed() >= self.save_interval() {
            self.flush().await?;
            true
        } else {
            false
        };

        Ok(TickOutcome {
            profile,
            sample,
            evaluation,
            flushed,
        })
    }

    /// Write the whole history to the store.
    pub async fn flush(&mut self) -> Result<(), SimulatorError> {
        let samples = self.history.to_vec();
        match self.store.save(&samples).await {
            Ok(()) => {
                self.last_flush = Instant::now();
                self.control.update_status(|s| s.record_flush(true));
                debug!(samples = samples.len(), "history checkpoint flushed");
                Ok(())
            }
            Err(e) => {
                self.control.update_status(|s| s.record_flush(false));
                Err(e.into())
            }
        }
    }

    /// Run the loop on the current task until a handle calls `stop`.
    pub async fn run(&mut self) -> Result<(), SimulatorError> {
        self.control
            .transition(SimulatorState::Idle, SimulatorState::Running)?;
        self.run_loop().await;
        Ok(())
    }

    /// Start the loop on a Tokio task. The join handle yields the simulator
    /// back once it has returned to idle. Must be called inside a runtime.
    pub fn spawn(mut self) -> Result<(SimulatorHandle, JoinHandle<Simulator>), SimulatorError> {
        self.control
            .transition(SimulatorState::Idle, SimulatorState::Running)?;
        let handle = self.handle();
        let join = tokio::spawn(async move {
            self.run_loop().await;
            self
        });
        Ok((handle, join))
    }

    async fn run_loop(&mut self) {
        info!(
            tick_ms = self.config.tick_interval_ms,
            save_interval_ms = self.config.save_interval_ms,
            anomaly_probability = self.generator.anomaly_probability(),
            location = %self.store.location(),
            "simulator started"
        );

        while self.control.state() == SimulatorState::Running {
            let pause = match self.tick().await {
                Ok(_) => Duration::from_millis(self.config.tick_interval_ms),
                Err(e) => {
                    error!(error = %e, "simulator tick failed, backing off");
                    self.control.update_status(|s| s.tick_failures += 1);
                    Duration::from_millis(self.config.error_backoff_ms)
                }
            };
            self.pause(pause).await;
        }

        match self.flush().await {
            Ok(()) => info!(samples = self.history.len(), "final checkpoint written"),
            Err(e) => error!(error = %e, "final checkpoint failed"),
        }

        if let Err(e) = self
            .control
            .transition(SimulatorState::Stopping, SimulatorState::Idle)
        {
            warn!(error = %e, "unexpected state at shutdown");
        }
        info!("simulator stopped");
    }

    /// Sleep between ticks, cut short by a stop request.
    ///
    /// The waiter is registered before the state is read, and `stop` sets the
    /// state before calling `notify_waiters`, so a stop is either seen here or
    /// wakes the sleep. No wake-up is ever stored for a later run.
    async fn pause(&self, duration: Duration) {
        let stopped = self.control.wake.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();
        if self.control.state() != SimulatorState::Running {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = stopped => {}
        }
    }

    fn save_interval(&self) -> Duration {
        Duration::from_millis(self.config.save_interval_ms)
    }
}

/// Cloneable control surface for a running simulator.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    control: Arc<Control>,
}

impl SimulatorHandle {
    pub fn state(&self) -> SimulatorState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SimulatorState::Running
    }

    pub fn status(&self) -> SimulatorStatus {
        self.control.status()
    }

    /// Request a stop. The loop finishes its current tick, writes a final
    /// checkpoint and returns to idle.
    pub fn stop(&self) -> Result<(), SimulatorError> {
        self.control
            .transition(SimulatorState::Running, SimulatorState::Stopping)?;
        self.control.wake.notify_waiters();
        info!("simulator stop requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use flowwatch_core::DetectorConfig;

    use crate::store::{JsonFileStore, StorageError};

    #[derive(Default)]
    struct MemoryStore {
        saves: Mutex<Vec<Vec<TrafficSample>>>,
        fail: AtomicBool,
    }

    impl MemoryStore {
        fn failing() -> Self {
            let s = Self::default();
            s.fail.store(true, Ordering::SeqCst);
            s
        }

        fn saves(&self) -> Vec<Vec<TrafficSample>> {
            self.saves.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HistoryStore for MemoryStore {
        async fn load(&self) -> Result<Option<Vec<TrafficSample>>, StorageError> {
            Ok(None)
        }

        async fn save(&self, samples: &[TrafficSample]) -> Result<(), StorageError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.saves.lock().unwrap().push(samples.to_vec());
            Ok(())
        }

        fn location(&self) -> String {
            "memory".to_string()
        }
    }

    fn detector() -> Arc<Detector> {
        Arc::new(
            Detector::new(DetectorConfig {
                trees: 30,
                ..DetectorConfig::default()
            })
            .unwrap(),
        )
    }

    fn config() -> SimulatorConfig {
        SimulatorConfig {
            tick_interval_ms: 5,
            save_interval_ms: 3_600_000,
            error_backoff_ms: 5,
            seed: Some(11),
            ..SimulatorConfig::default()
        }
    }

    #[tokio::test]
    async fn burst_keeps_most_recent_thousand() {
        let store = Arc::new(MemoryStore::default());
        let mut sim = Simulator::new(config(), detector(), store).await.unwrap();

        let mut produced = Vec::new();
        for _ in 0..1500 {
            produced.push(sim.tick().await.unwrap().sample);
        }

        assert_eq!(sim.history().len(), 1000);
        assert_eq!(sim.history().to_vec(), produced[500..].to_vec());
        assert_eq!(sim.status().ticks, 1500);
    }

    #[tokio::test]
    async fn zero_probability_yields_normal_history() {
        let mut c = config();
        c.anomaly_probability = 0.0;
        let mut sim = Simulator::new(c, detector(), Arc::new(MemoryStore::default()))
            .await
            .unwrap();

        for _ in 0..100 {
            let outcome = sim.tick().await.unwrap();
            assert_eq!(outcome.profile, TrafficProfile::Normal);
        }
        assert_eq!(sim.history().len(), 100);
        assert!(sim.history().iter().all(|s| TrafficProfile::Normal.contains(s)));
    }

    #[tokio::test]
    async fn due_flush_happens_inside_tick() {
        let mut c = config();
        c.save_interval_ms = 0;
        let store = Arc::new(MemoryStore::default());
        let mut sim = Simulator::new(c, detector(), store.clone()).await.unwrap();

        assert!(sim.tick().await.unwrap().flushed);
        assert!(sim.tick().await.unwrap().flushed);
        let saves = store.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].len(), 2);
    }

    #[tokio::test]
    async fn stop_flushes_exactly_once_and_returns_to_idle() {
        let store = Arc::new(MemoryStore::default());
        let sim = Simulator::new(config(), detector(), store.clone()).await.unwrap();

        let (handle, join) = sim.spawn().unwrap();
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.stop().unwrap();
        let sim = join.await.unwrap();

        assert_eq!(sim.state(), SimulatorState::Idle);
        let status = handle.status();
        assert_eq!(status.state, SimulatorState::Idle);
        assert_eq!(status.flushes, 1);

        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].len() as u64, status.ticks);
        assert_eq!(saves[0], sim.history().to_vec());

        assert!(matches!(
            handle.stop(),
            Err(SimulatorError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn restart_after_early_stop_keeps_tick_pacing() {
        let store = Arc::new(MemoryStore::default());
        let mut c = config();
        c.tick_interval_ms = 2_000;
        let sim = Simulator::new(c, detector(), store.clone()).await.unwrap();

        // Stop before the spawned task is ever polled.
        let (handle, join) = sim.spawn().unwrap();
        handle.stop().unwrap();
        let sim = join.await.unwrap();
        assert_eq!(sim.status().ticks, 0);
        assert_eq!(sim.state(), SimulatorState::Idle);

        let (handle, join) = sim.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.status().ticks, 1);
        assert!(handle.is_running());

        handle.stop().unwrap();
        let sim = join.await.unwrap();
        assert_eq!(sim.status().ticks, 1);
        assert_eq!(store.saves().len(), 2);
    }

    #[tokio::test]
    async fn stop_during_pause_ends_run_promptly() {
        let mut c = config();
        c.tick_interval_ms = 60_000;
        let sim = Simulator::new(c, detector(), Arc::new(MemoryStore::default()))
            .await
            .unwrap();

        let (handle, join) = sim.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().unwrap();
        let sim = tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sim.status().ticks, 1);
    }

    #[tokio::test]
    async fn storage_failures_do_not_end_the_loop() {
        let mut c = config();
        c.save_interval_ms = 0;
        let store = Arc::new(MemoryStore::failing());
        let sim = Simulator::new(c, detector(), store.clone()).await.unwrap();

        let (handle, join) = sim.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let status = handle.status();
        assert!(handle.is_running());
        assert!(status.tick_failures >= 2, "{:?}", status);
        assert!(status.ticks >= 2);

        handle.stop().unwrap();
        let sim = join.await.unwrap();
        let status = sim.status();
        assert_eq!(status.state, SimulatorState::Idle);
        assert_eq!(status.flushes, 0);
        assert!(status.flush_failures > status.tick_failures);
        assert!(store.saves().is_empty());
    }

    #[tokio::test]
    async fn stop_while_idle_is_rejected() {
        let sim = Simulator::new(config(), detector(), Arc::new(MemoryStore::default()))
            .await
            .unwrap();
        assert!(matches!(
            sim.handle().stop(),
            Err(SimulatorError::InvalidTransition {
                from: SimulatorState::Idle,
                to: SimulatorState::Stopping
            })
        ));
    }

    #[tokio::test]
    async fn checkpoint_reloads_on_fresh_construction() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data/traffic.json");

        let mut first = Simulator::new(config(), detector(), Arc::new(JsonFileStore::new(&path)))
            .await
            .unwrap();
        for _ in 0..25 {
            first.tick().await.unwrap();
        }
        first.flush().await.unwrap();

        let second = Simulator::new(config(), detector(), Arc::new(JsonFileStore::new(&path)))
            .await
            .unwrap();
        assert_eq!(second.history().to_vec(), first.history().to_vec());
        assert_eq!(second.status().history_len, 25);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("traffic.json");
        std::fs::write(&path, "not json").unwrap();

        let sim = Simulator::new(config(), detector(), Arc::new(JsonFileStore::new(&path)))
            .await
            .unwrap();
        assert!(sim.history().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut c = config();
        c.history_capacity = 0;
        let err = Simulator::new(c, detector(), Arc::new(MemoryStore::default())).await;
        assert!(matches!(err, Err(SimulatorError::Config(_))));
    }
}
