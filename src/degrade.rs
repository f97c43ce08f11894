//! Graceful degradation of optional features under backpressure.
//!
//! The controller listens for level changes and switches optional stages off
//! as pressure climbs. Restoration is deliberately slow: the level has to
//! drop, stay down for the restore delay, and the system must have been
//! degraded for a minimum time before anything is switched back on.

use crate::backpressure::BackpressureLevel;
use crate::clock::Clock;
use crate::config::DegradeConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Optional pipeline features the controller may switch off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Deduplication,
    DetailedMetrics,
    VerboseLogging,
    Compression,
    HealthCheckVerbosity,
    BatchOptimization,
}

struct ControllerState {
    level: BackpressureLevel,
    /// When the first feature was disabled, clock millis.
    degraded_since: Option<u64>,
    /// When the level last decreased, clock millis.
    last_decrease: Option<u64>,
}

/// Toggles features in response to backpressure level changes.
pub struct DegradationController {
    config: DegradeConfig,
    clock: Arc<dyn Clock>,
    /// Hot-path snapshot: the set of currently disabled features.
    disabled: ArcSwap<HashSet<Feature>>,
    state: Mutex<ControllerState>,
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController")
            .field("disabled", &self.disabled.load())
            .finish_non_exhaustive()
    }
}

impl DegradationController {
    pub fn new(config: DegradeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            disabled: ArcSwap::from_pointee(HashSet::new()),
            state: Mutex::new(ControllerState {
                level: BackpressureLevel::None,
                degraded_since: None,
                last_decrease: None,
            }),
        }
    }

    /// Lock-free read used on the hot path.
    pub fn is_enabled(&self, feature: Feature) -> bool {
        !self.disabled.load().contains(&feature)
    }

    pub fn disabled_features(&self) -> HashSet<Feature> {
        self.disabled.load().as_ref().clone()
    }

    /// Level-change notification, wired as a backpressure callback.
    pub fn on_level_change(&self, old: BackpressureLevel, new: BackpressureLevel) {
        if !self.config.enabled {
            return;
        }
        let now = self.clock.now_millis();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.level = new;
        if new < old {
            state.last_decrease = Some(now);
            // Re-enabling waits for tick(); shedding is immediate, restoring
            // is damped.
            return;
        }

        let mut disabled = self.disabled.load().as_ref().clone();
        let mut shed = Vec::new();
        for (&feature, &threshold) in &self.config.disable_at {
            if new >= threshold && disabled.insert(feature) {
                shed.push(feature);
            }
        }
        if !shed.is_empty() {
            if state.degraded_since.is_none() {
                state.degraded_since = Some(now);
            }
            tracing::warn!(level = %new, features = ?shed, "degrading optional features");
            self.disabled.store(Arc::new(disabled));
        }
    }

    /// Periodic restoration check; called from the backpressure sampler.
    pub fn tick(&self) {
        if !self.config.enabled {
            return;
        }
        let now = self.clock.now_millis();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let degraded_since = match state.degraded_since {
            Some(t) => t,
            None => return,
        };
        let last_decrease = match state.last_decrease {
            Some(t) => t,
            None => return,
        };
        if now.saturating_sub(last_decrease) < self.config.restore_delay().as_millis() as u64 {
            return;
        }
        if now.saturating_sub(degraded_since) < self.config.min_degraded_time().as_millis() as u64
        {
            return;
        }

        let level = state.level;
        let mut disabled = self.disabled.load().as_ref().clone();
        let mut restored = Vec::new();
        disabled.retain(|feature| {
            let threshold = self
                .config
                .disable_at
                .get(feature)
                .copied()
                .unwrap_or(BackpressureLevel::Low);
            if level < threshold {
                restored.push(*feature);
                false
            } else {
                true
            }
        });
        if !restored.is_empty() {
            tracing::info!(level = %level, features = ?restored, "restoring degraded features");
            if disabled.is_empty() {
                state.degraded_since = None;
            }
            self.disabled.store(Arc::new(disabled));
        }
    }
}
