//! Utilization-driven backpressure signal.
//!
//! A weighted score over queue/memory/CPU/IO utilization and error rate maps
//! to an ordinal level. Two dampers keep the level from flapping: a cooldown
//! after each change and a stabilization window during which differing
//! proposals are ignored.

use crate::clock::Clock;
use crate::config::BackpressureConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// Ordinal overload signal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl BackpressureLevel {
    /// Position in the admission-factor table.
    pub fn index(self) -> usize {
        match self {
            Self::None => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One sampling round of the inputs, each normalized to `0..=1`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    pub queue: f64,
    pub memory: f64,
    pub cpu: f64,
    pub io: f64,
    pub error_rate: f64,
}

/// Source of memory/CPU/IO utilization. Actual collectors are the embedding
/// binary's concern; the pipeline only consumes normalized readings.
pub trait ResourceProbe: Send + Sync + std::fmt::Debug {
    fn memory(&self) -> f64;
    fn cpu(&self) -> f64;
    fn io(&self) -> f64;
}

/// Probe reporting constant zeros; the default when no collector is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl ResourceProbe for NullProbe {
    fn memory(&self) -> f64 {
        0.0
    }
    fn cpu(&self) -> f64 {
        0.0
    }
    fn io(&self) -> f64 {
        0.0
    }
}

/// Settable probe for tests and static deployments.
#[derive(Debug, Default)]
pub struct ManualProbe {
    values: Mutex<(f64, f64, f64)>,
}

impl ManualProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, memory: f64, cpu: f64, io: f64) {
        *self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            (memory, cpu, io);
    }
}

impl ResourceProbe for ManualProbe {
    fn memory(&self) -> f64 {
        self.values.lock().unwrap_or_else(|p| p.into_inner()).0
    }
    fn cpu(&self) -> f64 {
        self.values.lock().unwrap_or_else(|p| p.into_inner()).1
    }
    fn io(&self) -> f64 {
        self.values.lock().unwrap_or_else(|p| p.into_inner()).2
    }
}

type LevelCallback = Box<dyn Fn(BackpressureLevel, BackpressureLevel) + Send + Sync>;

struct MonitorState {
    level: BackpressureLevel,
    /// Clock millis of the last accepted transition.
    last_change: Option<u64>,
    last_score: f64,
}

/// Computes the level from samples and owns the damping state.
pub struct BackpressureMonitor {
    config: BackpressureConfig,
    clock: std::sync::Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    callbacks: Mutex<Vec<LevelCallback>>,
}

impl std::fmt::Debug for BackpressureMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureMonitor")
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}

impl BackpressureMonitor {
    pub fn new(config: BackpressureConfig, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(MonitorState {
                level: BackpressureLevel::None,
                last_change: None,
                last_score: 0.0,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a level-change callback. Callbacks run synchronously inside
    /// the monitor lock and must not call back into the monitor.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(BackpressureLevel, BackpressureLevel) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
    }

    pub fn level(&self) -> BackpressureLevel {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .level
    }

    pub fn last_score(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last_score
    }

    /// Admission factor the rate limiter multiplies into its effective rate.
    pub fn admission_factor(&self) -> f64 {
        self.config.admission_factors[self.level().index()]
    }

    /// Weighted score of one sample.
    pub fn score(&self, sample: &LoadSample) -> f64 {
        let w = &self.config.weights;
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        w.queue * clamp(sample.queue)
            + w.memory * clamp(sample.memory)
            + w.cpu * clamp(sample.cpu)
            + w.io * clamp(sample.io)
            + w.error_rate * clamp(sample.error_rate)
    }

    fn level_for_score(&self, score: f64) -> BackpressureLevel {
        let t = &self.config.thresholds;
        if score >= t[3] {
            BackpressureLevel::Critical
        } else if score >= t[2] {
            BackpressureLevel::High
        } else if score >= t[1] {
            BackpressureLevel::Medium
        } else if score >= t[0] {
            BackpressureLevel::Low
        } else {
            BackpressureLevel::None
        }
    }

    /// Feed one sample; returns the (possibly unchanged) current level.
    pub fn observe(&self, sample: &LoadSample) -> BackpressureLevel {
        let score = self.score(sample);
        let proposal = self.level_for_score(score);
        let now = self.clock.now_millis();

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.last_score = score;

        if proposal == state.level {
            return state.level;
        }

        if let Some(changed_at) = state.last_change {
            let since = now.saturating_sub(changed_at);
            // Stabilization: differing proposals are ignored wholesale.
            if since < self.config.stabilize().as_millis() as u64 {
                return state.level;
            }
            // Cooldown: decreases additionally wait out the cooldown.
            if proposal < state.level && since < self.config.cooldown().as_millis() as u64 {
                return state.level;
            }
        }

        let old = state.level;
        state.level = proposal;
        state.last_change = Some(now);
        tracing::info!(%old, new = %proposal, score, "backpressure level changed");
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for callback in callbacks.iter() {
            callback(old, proposal);
        }
        proposal
    }
}
