//! Per-sink circuit breaker.
//!
//! Three states: closed (pass), open (fail fast), half-open (bounded
//! probes). The mutex is held only for the admission pre-check and the
//! post-call record; the guarded operation itself runs unlocked, so
//! concurrent sends to a healthy sink proceed in parallel.

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::{PipelineError, SinkError};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

type TransitionCallback = Box<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

struct BreakerInner {
    state: BreakerState,
    /// Consecutive-failure counter while closed; successes decrement, floor 0.
    failures: usize,
    half_open_in_flight: usize,
    half_open_successes: usize,
    opened_at: u64,
    half_open_since: u64,
}

enum Admission {
    /// Closed state; no probe bookkeeping.
    Pass,
    /// Half-open probe; decrement in-flight on completion.
    Probe,
}

/// Failure isolation for one sink.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    on_transition: Option<TransitionCallback>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                half_open_in_flight: 0,
                half_open_successes: 0,
                opened_at: 0,
                half_open_since: 0,
            }),
            on_transition: None,
        }
    }

    /// Install a transition callback. It runs synchronously inside the
    /// breaker lock and must not call back into the breaker.
    pub fn with_transition_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, BreakerState, BreakerState) + Send + Sync + 'static,
    {
        self.on_transition = Some(Box::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    pub fn failures(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .failures
    }

    /// Run `operation` under the breaker.
    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let admission = self.admit()?;
        let result = operation.await;
        self.record(&admission, result.is_ok());
        result.map_err(PipelineError::Sink)
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        let now = self.clock.now_millis();
        match to {
            BreakerState::Open => {
                inner.opened_at = now;
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                tracing::warn!(sink = %self.name, failures = inner.failures, "circuit breaker → open");
            }
            BreakerState::HalfOpen => {
                inner.half_open_since = now;
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                tracing::info!(sink = %self.name, "circuit breaker → half-open");
            }
            BreakerState::Closed => {
                inner.failures = 0;
                tracing::info!(sink = %self.name, "circuit breaker → closed");
            }
        }
        if let Some(callback) = &self.on_transition {
            callback(&self.name, from, to);
        }
    }

    fn admit(&self) -> Result<Admission, PipelineError> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = self.clock.now_millis();
        let timeout = self.config.timeout().as_millis() as u64;

        match inner.state {
            BreakerState::Closed => Ok(Admission::Pass),
            BreakerState::Open => {
                if now.saturating_sub(inner.opened_at) >= timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(Admission::Probe)
                } else {
                    Err(PipelineError::BreakerOpen { failures: inner.failures })
                }
            }
            BreakerState::HalfOpen => {
                // A half-open window with no verdict (probes lost to
                // cancellation) would wedge forever; force it back open.
                if now.saturating_sub(inner.half_open_since) >= timeout.saturating_mul(2) {
                    self.transition(&mut inner, BreakerState::Open);
                    return Err(PipelineError::BreakerOpen { failures: inner.failures });
                }
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(PipelineError::BreakerOpen { failures: inner.failures });
                }
                inner.half_open_in_flight += 1;
                Ok(Admission::Probe)
            }
        }
    }

    fn record(&self, admission: &Admission, success: bool) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Admission::Probe = admission {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match (inner.state, success) {
            (BreakerState::Closed, true) => {
                inner.failures = inner.failures.saturating_sub(1);
            }
            (BreakerState::Closed, false) => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            (BreakerState::HalfOpen, true) => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            (BreakerState::HalfOpen, false) => {
                self.transition(&mut inner, BreakerState::Open);
            }
            // Verdicts landing after the state already moved on.
            (BreakerState::Open, _) => {}
        }
    }
}
