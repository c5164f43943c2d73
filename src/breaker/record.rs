//! Per-engine circuit state and rolling outcome window.
//!
//! Everything here is synchronous and clock-injected so transitions can be
//! tested without a runtime. The owning [`CircuitBreaker`](super::CircuitBreaker)
//! serializes access behind a mutex.

use super::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls are attempted.
    Closed,
    /// Failing, calls are rejected without being attempted.
    Open,
    /// Probing recovery, calls are attempted and counted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// A state change produced by a record update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
}

/// Outcomes within a time window, capped at a maximum sample count.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    span: Duration,
    max_samples: usize,
    samples: VecDeque<Sample>,
}

impl RollingWindow {
    pub fn new(span: Duration, max_samples: usize) -> Self {
        Self {
            span,
            max_samples: max_samples.max(1),
            samples: VecDeque::with_capacity(max_samples.min(1024)),
        }
    }

    pub fn record(&mut self, success: bool, now: Instant) {
        self.prune(now);
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { at: now, success });
    }

    /// Drop samples older than the window span.
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > self.span {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.samples.iter().filter(|s| !s.success).count()
    }

    /// Failure fraction in [0, 1]; zero for an empty window.
    pub fn failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.samples.len() as f64
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Mutable breaker state for one engine.
#[derive(Debug, Clone)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub window: RollingWindow,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_state_change: Instant,
}

impl CircuitRecord {
    pub fn new(config: &BreakerConfig, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            window: RollingWindow::new(config.window, config.max_window_samples),
            last_failure: None,
            last_success: None,
            last_state_change: now,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        match to {
            CircuitState::HalfOpen => {
                // Half-open starts a fresh probe: a single failure must not
                // reopen the circuit on stale counts.
                self.failure_count = 0;
                self.success_count = 0;
                self.window.clear();
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open => {}
        }
        Some(Transition { from, to })
    }

    /// Time left before an open circuit may be probed.
    pub fn remaining_open(&self, recovery: Duration, now: Instant) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        Some(recovery.saturating_sub(now.saturating_duration_since(self.last_state_change)))
    }

    /// OPEN → HALF_OPEN once the recovery timeout has elapsed.
    pub fn poll_recovery(&mut self, recovery: Duration, now: Instant) -> Option<Transition> {
        if self.state == CircuitState::Open
            && now.saturating_duration_since(self.last_state_change) >= recovery
        {
            return self.transition(CircuitState::HalfOpen, now);
        }
        None
    }

    pub fn on_success(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        self.last_success = Some(now);
        self.window.record(true, now);
        self.success_count += 1;
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen if self.success_count >= config.success_threshold => {
                let t = self.transition(CircuitState::Closed, now);
                self.window.clear();
                t
            }
            _ => None,
        }
    }

    pub fn on_failure(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        self.last_failure = Some(now);
        self.window.record(false, now);
        self.failure_count += 1;
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen if self.should_open(config) => {
                self.transition(CircuitState::Open, now)
            }
            _ => None,
        }
    }

    /// Either trigger opens the circuit: the raw failure count reaching the
    /// threshold, or the window failure rate exceeding the configured rate
    /// once enough samples exist.
    fn should_open(&self, config: &BreakerConfig) -> bool {
        if self.failure_count >= config.failure_threshold {
            return true;
        }
        self.window.len() >= config.minimum_samples
            && self.window.failure_rate() > config.failure_rate_threshold
    }

    /// Back to a pristine CLOSED record.
    pub fn reset(&mut self, now: Instant) -> Option<Transition> {
        let t = self.transition(CircuitState::Closed, now);
        self.failure_count = 0;
        self.success_count = 0;
        self.total_requests = 0;
        self.window.clear();
        self.last_failure = None;
        self.last_success = None;
        t
    }
}
