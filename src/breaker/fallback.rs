//! Fallback strategies tried when a breaker-wrapped call fails.

use crate::errors::{EngineError, ErrorClass};
use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Per-call context handed to the breaker and forwarded to fallbacks.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Identifies "the same request" across calls, for cached fallbacks.
    pub request_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A way of producing a substitute result after a failure.
///
/// Strategies are consulted in ascending [`priority`](Self::priority) order.
/// The first whose [`attempt`](Self::attempt) succeeds supplies the result.
#[async_trait]
pub trait FallbackStrategy<T>: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> u32;

    /// Whether this strategy applies to `error` at all.
    fn can_handle(&self, error: &EngineError, ctx: &CallContext) -> bool;

    async fn attempt(&self, error: &EngineError, ctx: &CallContext) -> Result<T, EngineError>;

    /// Called after every successful primary call.
    fn observe_success(&self, _ctx: &CallContext, _value: &T) {}
}

/// Replays the last successful result recorded for the same request id.
pub struct CachedResultFallback<T> {
    priority: u32,
    capacity: usize,
    results: Mutex<IndexMap<String, T>>,
}

impl<T: Clone> CachedResultFallback<T> {
    pub fn new(priority: u32, capacity: usize) -> Self {
        Self {
            priority,
            capacity: capacity.max(1),
            results: Mutex::new(IndexMap::new()),
        }
    }

    /// Seed a result directly.
    pub fn remember(&self, request_id: impl Into<String>, value: T) {
        let mut results = self.results.lock().unwrap_or_else(|p| p.into_inner());
        let key = request_id.into();
        results.shift_remove(&key);
        results.insert(key, value);
        while results.len() > self.capacity {
            results.shift_remove_index(0);
        }
    }

    fn lookup(&self, request_id: &str) -> Option<T> {
        self.results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(request_id)
            .cloned()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> FallbackStrategy<T> for CachedResultFallback<T> {
    fn name(&self) -> &str {
        "cached-result"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_handle(&self, _error: &EngineError, ctx: &CallContext) -> bool {
        ctx.request_id
            .as_deref()
            .is_some_and(|id| self.lookup(id).is_some())
    }

    async fn attempt(&self, _error: &EngineError, ctx: &CallContext) -> Result<T, EngineError> {
        ctx.request_id
            .as_deref()
            .and_then(|id| self.lookup(id))
            .ok_or_else(|| EngineError::FallbackFailed {
                strategy: "cached-result".into(),
                reason: "no cached result for request".into(),
            })
    }

    fn observe_success(&self, ctx: &CallContext, value: &T) {
        if let Some(id) = &ctx.request_id {
            self.remember(id.clone(), value.clone());
        }
    }
}

type DegradedFn<T> = Arc<dyn Fn(&EngineError, &CallContext) -> T + Send + Sync>;

/// Produces a canned degraded response.
///
/// Not installed by default. Callers that prefer a placeholder over a
/// failure attach it to an engine's breaker, usually restricted to
/// [`ErrorClass::BreakerOpen`] so only a cooling-down engine is papered
/// over:
///
/// ```ignore
/// invoker.breaker("codex").add_fallback(Arc::new(
///     DegradedResponseFallback::new(90, |_, _| placeholder()).only_for(vec![ErrorClass::BreakerOpen]),
/// ));
/// ```
///
/// See [`EngineInvoker::breaker`](crate::engines::EngineInvoker::breaker).
pub struct DegradedResponseFallback<T> {
    priority: u32,
    classes: Option<Vec<ErrorClass>>,
    respond: DegradedFn<T>,
}

impl<T> DegradedResponseFallback<T> {
    pub fn new<F>(priority: u32, respond: F) -> Self
    where
        F: Fn(&EngineError, &CallContext) -> T + Send + Sync + 'static,
    {
        Self {
            priority,
            classes: None,
            respond: Arc::new(respond),
        }
    }

    /// Restrict the fallback to the given error classes.
    pub fn only_for(mut self, classes: Vec<ErrorClass>) -> Self {
        self.classes = Some(classes);
        self
    }
}

#[async_trait]
impl<T: Send + Sync> FallbackStrategy<T> for DegradedResponseFallback<T> {
    fn name(&self) -> &str {
        "degraded-response"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_handle(&self, error: &EngineError, _ctx: &CallContext) -> bool {
        match &self.classes {
            Some(classes) => classes.contains(&error.class()),
            None => true,
        }
    }

    async fn attempt(&self, error: &EngineError, ctx: &CallContext) -> Result<T, EngineError> {
        Ok((self.respond)(error, ctx))
    }
}

type AlternateFn<T> = Arc<dyn Fn(CallContext) -> BoxFuture<'static, Result<T, EngineError>> + Send + Sync>;

/// Bounded retries of a caller-supplied alternate operation.
///
/// Not installed by default. The alternate is any `'static` future factory,
/// for example a second binary or endpoint for the same engine, attached
/// through [`CircuitBreaker::add_fallback`](super::CircuitBreaker::add_fallback).
///
/// Not used for breaker-open or validation errors: retrying either cannot
/// change the outcome.
pub struct RetryFallback<T> {
    priority: u32,
    max_attempts: u32,
    backoff: Duration,
    attempt_timeout: Option<Duration>,
    alternate: AlternateFn<T>,
}

impl<T> RetryFallback<T> {
    pub fn new<F>(priority: u32, max_attempts: u32, alternate: F) -> Self
    where
        F: Fn(CallContext) -> BoxFuture<'static, Result<T, EngineError>> + Send + Sync + 'static,
    {
        Self {
            priority,
            max_attempts: max_attempts.max(1),
            backoff: Duration::from_secs(1),
            attempt_timeout: None,
            alternate: Arc::new(alternate),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bound each retry attempt independently of the alternate's own limits.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> FallbackStrategy<T> for RetryFallback<T> {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_handle(&self, error: &EngineError, _ctx: &CallContext) -> bool {
        error.is_retryable()
    }

    async fn attempt(&self, _error: &EngineError, ctx: &CallContext) -> Result<T, EngineError> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff * (attempt - 1)).await;
            }
            let fut = (self.alternate)(ctx.clone());
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::FallbackFailed {
                        strategy: "retry".into(),
                        reason: format!("attempt {} timed out after {:?}", attempt, limit),
                    }),
                },
                None => fut.await,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(attempt, max = self.max_attempts, error = %e, "retry attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| EngineError::FallbackFailed {
            strategy: "retry".into(),
            reason: "no attempts were made".into(),
        }))
    }
}
