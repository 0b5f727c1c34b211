use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use super::SimulatorError;

/// Lifecycle of a simulator. `Stopping` always passes back through `Idle`
/// before the loop can run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SimulatorState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl SimulatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SimulatorState::Running,
            2 => SimulatorState::Stopping,
            _ => SimulatorState::Idle,
        }
    }
}

impl std::fmt::Display for SimulatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulatorState::Idle => write!(f, "idle"),
            SimulatorState::Running => write!(f, "running"),
            SimulatorState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Operational counters, readable from outside the loop.
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorStatus {
    pub state: SimulatorState,
    pub ticks: u64,
    pub anomalies_flagged: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub tick_failures: u64,
    pub history_len: usize,
    pub last_flush: Option<DateTime<Utc>>,
    /// Rolling mean of successful tick bodies.
    pub avg_tick_duration: Duration,
}

impl Default for SimulatorStatus {
    fn default() -> Self {
        Self {
            state: SimulatorState::Idle,
            ticks: 0,
            anomalies_flagged: 0,
            flushes: 0,
            flush_failures: 0,
            tick_failures: 0,
            history_len: 0,
            last_flush: None,
            avg_tick_duration: Duration::ZERO,
        }
    }
}

impl SimulatorStatus {
    pub fn record_tick(&mut self, duration: Duration, flagged: bool, history_len: usize) {
        self.ticks += 1;
        if flagged {
            self.anomalies_flagged += 1;
        }
        self.history_len = history_len;

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_tick_duration = if self.ticks == 1 {
            duration
        } else {
            let prev = self.avg_tick_duration.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / self.ticks as f64) as u64)
        };
    }

    pub fn record_flush(&mut self, ok: bool) {
        if ok {
            self.flushes += 1;
            self.last_flush = Some(Utc::now());
        } else {
            self.flush_failures += 1;
        }
    }
}

/// State shared between the loop and its handles.
#[derive(Debug)]
pub(super) struct Control {
    state: AtomicU8,
    pub(super) wake: Notify,
    status: RwLock<SimulatorStatus>,
}

impl Control {
    pub(super) fn new() -> Self {
        Self {
            state: AtomicU8::new(SimulatorState::Idle as u8),
            wake: Notify::new(),
            status: RwLock::new(SimulatorStatus::default()),
        }
    }

    pub(super) fn state(&self) -> SimulatorState {
        SimulatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn transition(
        &self,
        from: SimulatorState,
        to: SimulatorState,
    ) -> Result<(), SimulatorError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| SimulatorError::InvalidTransition {
                from: SimulatorState::from_u8(actual),
                to,
            })
    }

    /// Apply `f` to the status. A poisoned lock is recovered, since the
    /// counters stay meaningful after a panicked writer.
    pub(super) fn update_status(&self, f: impl FnOnce(&mut SimulatorStatus)) {
        let mut guard = match self.status.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    pub(super) fn status(&self) -> SimulatorStatus {
        let mut status = match self.status.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        status.state = self.state();
        status
    }
}
