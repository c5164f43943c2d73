//! Per-engine circuit breaker with ordered fallbacks.
//!
//! A [`CircuitBreaker`] wraps calls to one engine. Failures open the circuit;
//! while open, calls are rejected without being attempted and a recovery
//! timer moves the circuit to half-open. Every failure, including a
//! rejection, is offered to the registered [`FallbackStrategy`]s before the
//! error reaches the caller.
//!
//! State changes, outcomes and fallback results are published synchronously
//! through [`CircuitBreaker::observers`].

pub mod fallback;
pub mod record;

pub use fallback::{
    CachedResultFallback, CallContext, DegradedResponseFallback, FallbackStrategy, RetryFallback,
};
pub use record::{CircuitRecord, CircuitState, RollingWindow, Transition};

use crate::errors::{EngineError, ErrorClass};
use crate::observe::{Event, Observers};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Thresholds and timers for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Failures that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
    /// Upper bound on one wrapped call, independent of the call's own limits.
    pub call_timeout: Duration,
    /// Span of the rolling outcome window.
    pub window: Duration,
    pub max_window_samples: usize,
    /// Samples required before the failure rate is considered.
    pub minimum_samples: usize,
    pub failure_rate_threshold: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(630),
            window: Duration::from_secs(60),
            max_window_samples: 100,
            minimum_samples: 10,
            failure_rate_threshold: 0.5,
        }
    }
}

/// Kinds of [`BreakerEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerEventKind {
    RequestSuccess,
    RequestFailure,
    RequestBlocked,
    StateChanged,
    FallbackSuccess,
    FallbackExhausted,
}

/// Something observable that happened inside a breaker.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    RequestSuccess {
        engine: String,
        duration: Duration,
    },
    RequestFailure {
        engine: String,
        class: ErrorClass,
        error: String,
    },
    RequestBlocked {
        engine: String,
        retry_after: Option<Duration>,
    },
    StateChanged {
        engine: String,
        from: CircuitState,
        to: CircuitState,
    },
    FallbackSuccess {
        engine: String,
        strategy: String,
    },
    FallbackExhausted {
        engine: String,
        error: String,
    },
}

impl Event for BreakerEvent {
    type Kind = BreakerEventKind;

    fn kind(&self) -> BreakerEventKind {
        match self {
            BreakerEvent::RequestSuccess { .. } => BreakerEventKind::RequestSuccess,
            BreakerEvent::RequestFailure { .. } => BreakerEventKind::RequestFailure,
            BreakerEvent::RequestBlocked { .. } => BreakerEventKind::RequestBlocked,
            BreakerEvent::StateChanged { .. } => BreakerEventKind::StateChanged,
            BreakerEvent::FallbackSuccess { .. } => BreakerEventKind::FallbackSuccess,
            BreakerEvent::FallbackExhausted { .. } => BreakerEventKind::FallbackExhausted,
        }
    }
}

/// Point-in-time view of a breaker, for display and monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub engine: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub window_samples: usize,
    pub window_failure_rate: f64,
    #[serde(with = "duration_ms_opt")]
    pub time_until_half_open: Option<Duration>,
}

mod duration_ms_opt {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

enum Admission {
    Allowed,
    Rejected { retry_after: Option<Duration> },
}

/// State shared with the recovery timer task.
struct BreakerCore {
    engine: String,
    config: BreakerConfig,
    record: Mutex<CircuitRecord>,
    observers: Observers<BreakerEvent>,
    recovery_timer: Mutex<Option<JoinHandle<()>>>,
    reset_generation: watch::Sender<u64>,
}

impl BreakerCore {
    fn record(&self) -> std::sync::MutexGuard<'_, CircuitRecord> {
        self.record.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publish a transition. Must be called without the record lock held.
    fn announce(&self, transition: Transition) {
        info!(
            engine = %self.engine,
            from = %transition.from,
            to = %transition.to,
            "circuit state changed"
        );
        self.observers.emit(&BreakerEvent::StateChanged {
            engine: self.engine.clone(),
            from: transition.from,
            to: transition.to,
        });
    }

    fn poll_recovery(&self) {
        let transition = self
            .record()
            .poll_recovery(self.config.recovery_timeout, Instant::now());
        if let Some(t) = transition {
            self.announce(t);
        }
    }

    fn cancel_recovery_timer(&self) {
        if let Some(handle) = self
            .recovery_timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

fn schedule_recovery(core: &Arc<BreakerCore>) {
    // Outside a runtime the lazy check in `admit` still performs recovery.
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let weak: Weak<BreakerCore> = Arc::downgrade(core);
    let delay = core.config.recovery_timeout;
    let handle = runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(core) = weak.upgrade() {
            core.poll_recovery();
        }
    });
    let previous = core
        .recovery_timer
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .replace(handle);
    if let Some(previous) = previous {
        previous.abort();
    }
}

/// Circuit breaker guarding calls that produce `T`.
pub struct CircuitBreaker<T> {
    core: Arc<BreakerCore>,
    fallbacks: RwLock<Vec<Arc<dyn FallbackStrategy<T>>>>,
}

impl<T> std::fmt::Debug for CircuitBreaker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("engine", &self.core.engine)
            .field("state", &self.core.record().state)
            .finish()
    }
}

impl<T> Drop for CircuitBreaker<T> {
    fn drop(&mut self) {
        self.core.cancel_recovery_timer();
    }
}

impl<T: Send + 'static> CircuitBreaker<T> {
    pub fn new(engine: impl Into<String>, config: BreakerConfig) -> Self {
        let now = Instant::now();
        let (reset_generation, _) = watch::channel(0);
        Self {
            core: Arc::new(BreakerCore {
                engine: engine.into(),
                record: Mutex::new(CircuitRecord::new(&config, now)),
                config,
                observers: Observers::new(),
                recovery_timer: Mutex::new(None),
                reset_generation,
            }),
            fallbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &str {
        &self.core.engine
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.core.config
    }

    /// Event registry for this breaker.
    pub fn observers(&self) -> &Observers<BreakerEvent> {
        &self.core.observers
    }

    /// Register a fallback, keeping the list in ascending priority order.
    /// Strategies with equal priority run in registration order.
    pub fn add_fallback(&self, strategy: Arc<dyn FallbackStrategy<T>>) {
        let mut fallbacks = self.fallbacks.write().unwrap_or_else(|p| p.into_inner());
        let position = fallbacks
            .iter()
            .position(|f| f.priority() > strategy.priority())
            .unwrap_or(fallbacks.len());
        fallbacks.insert(position, strategy);
    }

    pub fn state(&self) -> CircuitState {
        self.core.record().state
    }

    pub fn health(&self) -> BreakerHealth {
        let now = Instant::now();
        let mut record = self.core.record();
        record.window.prune(now);
        BreakerHealth {
            engine: self.core.engine.clone(),
            state: record.state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            total_requests: record.total_requests,
            window_samples: record.window.len(),
            window_failure_rate: record.window.failure_rate(),
            time_until_half_open: record.remaining_open(self.core.config.recovery_timeout, now),
        }
    }

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let (admission, transition) = {
            let mut record = self.core.record();
            let transition = record.poll_recovery(self.core.config.recovery_timeout, now);
            record.total_requests += 1;
            let admission = match record.state {
                CircuitState::Open => Admission::Rejected {
                    retry_after: record.remaining_open(self.core.config.recovery_timeout, now),
                },
                CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed,
            };
            (admission, transition)
        };
        if let Some(t) = transition {
            self.core.announce(t);
        }
        admission
    }

    fn record_success(&self, duration: Duration) {
        let transition = self
            .core
            .record()
            .on_success(&self.core.config, Instant::now());
        debug!(engine = %self.core.engine, ?duration, "breaker call succeeded");
        self.core.observers.emit(&BreakerEvent::RequestSuccess {
            engine: self.core.engine.clone(),
            duration,
        });
        if let Some(t) = transition {
            self.core.announce(t);
        }
    }

    fn record_failure(&self, error: &EngineError) {
        let transition = self
            .core
            .record()
            .on_failure(&self.core.config, Instant::now());
        warn!(engine = %self.core.engine, error = %error, "breaker call failed");
        self.core.observers.emit(&BreakerEvent::RequestFailure {
            engine: self.core.engine.clone(),
            class: error.class(),
            error: error.to_string(),
        });
        if let Some(t) = transition {
            if t.to == CircuitState::Open {
                schedule_recovery(&self.core);
            }
            self.core.announce(t);
        }
    }

    /// Run `op` through the breaker.
    ///
    /// `op` is not invoked while the circuit is open. A call that does not
    /// settle within the configured call timeout fails with
    /// [`EngineError::CallTimeout`], and the future is dropped. A
    /// concurrent [`reset`](Self::reset) fails the call with
    /// [`EngineError::Reset`], which bypasses fallbacks.
    pub async fn call<F, Fut>(&self, ctx: &CallContext, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let error = match self.admit() {
            Admission::Rejected { retry_after } => {
                debug!(engine = %self.core.engine, ?retry_after, "call blocked by open circuit");
                self.core.observers.emit(&BreakerEvent::RequestBlocked {
                    engine: self.core.engine.clone(),
                    retry_after,
                });
                EngineError::BreakerOpen {
                    engine: self.core.engine.clone(),
                    retry_after,
                }
            }
            Admission::Allowed => {
                let mut reset_rx = self.core.reset_generation.subscribe();
                let started = Instant::now();
                let call_timeout = self.core.config.call_timeout;
                let outcome = tokio::select! {
                    result = tokio::time::timeout(call_timeout, op()) => match result {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::CallTimeout {
                            engine: self.core.engine.clone(),
                            after: call_timeout,
                        }),
                    },
                    _ = reset_rx.changed() => {
                        return Err(EngineError::Reset {
                            engine: self.core.engine.clone(),
                        });
                    }
                };
                match outcome {
                    Ok(value) => {
                        self.record_success(started.elapsed());
                        for strategy in self.snapshot_fallbacks() {
                            strategy.observe_success(ctx, &value);
                        }
                        return Ok(value);
                    }
                    Err(error) => {
                        self.record_failure(&error);
                        error
                    }
                }
            }
        };
        self.run_fallbacks(ctx, error).await
    }

    fn snapshot_fallbacks(&self) -> Vec<Arc<dyn FallbackStrategy<T>>> {
        self.fallbacks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn run_fallbacks(&self, ctx: &CallContext, error: EngineError) -> Result<T, EngineError> {
        for strategy in self.snapshot_fallbacks() {
            if !strategy.can_handle(&error, ctx) {
                continue;
            }
            match strategy.attempt(&error, ctx).await {
                Ok(value) => {
                    info!(engine = %self.core.engine, strategy = strategy.name(), "fallback succeeded");
                    self.core.observers.emit(&BreakerEvent::FallbackSuccess {
                        engine: self.core.engine.clone(),
                        strategy: strategy.name().to_string(),
                    });
                    return Ok(value);
                }
                Err(e) => {
                    debug!(engine = %self.core.engine, strategy = strategy.name(), error = %e, "fallback failed");
                }
            }
        }
        self.core.observers.emit(&BreakerEvent::FallbackExhausted {
            engine: self.core.engine.clone(),
            error: error.to_string(),
        });
        Err(error)
    }

    /// Clear all counters, return to CLOSED, and fail in-flight calls.
    pub fn reset(&self) {
        self.core.cancel_recovery_timer();
        let transition = self.core.record().reset(Instant::now());
        self.core.reset_generation.send_modify(|generation| *generation += 1);
        info!(engine = %self.core.engine, "circuit breaker reset");
        if let Some(t) = transition {
            self.core.announce(t);
        }
    }

    /// Reset, then detach every observer.
    pub fn shutdown(&self) {
        self.reset();
        self.core.cancel_recovery_timer();
        self.core.observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RunnerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> EngineError {
        EngineError::Runner(RunnerError::NonZeroExit {
            code: 2,
            stdout: String::new(),
            stderr: "boom".into(),
        })
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            ..BreakerConfig::default()
        }
    }

    async fn fail_n(breaker: &CircuitBreaker<String>, n: usize) {
        for _ in 0..n {
            let _ = breaker
                .call(&CallContext::new(), || async { Err::<String, _>(failing()) })
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_blocks_without_invoking() {
        let breaker = CircuitBreaker::new("codex", config());
        fail_n(&breaker, 3).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let err = breaker
            .call(&CallContext::new(), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BreakerOpen { .. }));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open() {
        let breaker = CircuitBreaker::new("claude", config());
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        breaker.observers().on(BreakerEventKind::StateChanged, move |event| {
            if let BreakerEvent::StateChanged { to, .. } = event {
                sink.lock().unwrap().push(*to);
            }
        });

        fail_n(&breaker, 3).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let seen_state = Arc::new(Mutex::new(None));
        let probe = seen_state.clone();
        let health_breaker = &breaker;
        breaker
            .call(&CallContext::new(), || async move {
                *probe.lock().unwrap() = Some(health_breaker.state());
                Ok("ok".to_string())
            })
            .await
            .unwrap();
        assert_eq!(*seen_state.lock().unwrap(), Some(CircuitState::HalfOpen));

        breaker
            .call(&CallContext::new(), || async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(
            *states.lock().unwrap(),
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("gemini", config());
        let err = breaker
            .call(&CallContext::new(), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("late".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CallTimeout { .. }));
        assert_eq!(breaker.health().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallbacks_tried_in_priority_order() {
        let breaker = CircuitBreaker::new("codex", config());
        breaker.add_fallback(Arc::new(DegradedResponseFallback::new(90, |_, _| {
            "degraded".to_string()
        })));
        let cached = Arc::new(CachedResultFallback::new(10, 16));
        breaker.add_fallback(cached.clone());

        let ctx = CallContext::new().with_request_id("r1");
        breaker
            .call(&ctx, || async { Ok("fresh".to_string()) })
            .await
            .unwrap();

        let strategies = Arc::new(Mutex::new(Vec::new()));
        let sink = strategies.clone();
        breaker.observers().on(BreakerEventKind::FallbackSuccess, move |event| {
            if let BreakerEvent::FallbackSuccess { strategy, .. } = event {
                sink.lock().unwrap().push(strategy.clone());
            }
        });

        let value = breaker
            .call(&ctx, || async { Err(failing()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");

        let value = breaker
            .call(&CallContext::new(), || async { Err(failing()) })
            .await
            .unwrap();
        assert_eq!(value, "degraded");
        assert_eq!(
            *strategies.lock().unwrap(),
            vec!["cached-result".to_string(), "degraded-response".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejection_reaches_fallbacks() {
        let breaker = CircuitBreaker::new("codex", config());
        breaker.add_fallback(Arc::new(
            DegradedResponseFallback::new(1, |_, _| "cooldown".to_string())
                .only_for(vec![ErrorClass::BreakerOpen]),
        ));
        fail_n(&breaker, 3).await;
        let value = breaker
            .call(&CallContext::new(), || async { Ok("unused".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "cooldown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_fallbacks_propagate_original_error() {
        let breaker = CircuitBreaker::new("codex", config());
        let exhausted = Arc::new(AtomicU32::new(0));
        let counter = exhausted.clone();
        breaker.observers().on(BreakerEventKind::FallbackExhausted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let err = breaker
            .call(&CallContext::new(), || async { Err::<String, _>(failing()) })
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Execution);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_in_flight_calls() {
        let breaker = Arc::new(CircuitBreaker::<String>::new("claude", config()));
        let in_flight = breaker.clone();
        let task = tokio::spawn(async move {
            in_flight
                .call(&CallContext::new(), || async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok("done".to_string())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        breaker.reset();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Reset { .. }));
        assert_eq!(breaker.health().total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_detaches_observers_and_closes() {
        let breaker = CircuitBreaker::new("gemini", config());
        breaker.observers().on_any(|_| {});
        fail_n(&breaker, 3).await;
        breaker.shutdown();
        assert!(breaker.observers().is_empty());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_time_until_half_open() {
        let breaker = CircuitBreaker::new("gemini", config());
        fail_n(&breaker, 3).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let health = breaker.health();
        assert_eq!(health.state, CircuitState::Open);
        assert_eq!(health.time_until_half_open, Some(Duration::from_secs(20)));
        assert_eq!(health.window_failure_rate, 1.0);
    }
}
