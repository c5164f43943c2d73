//! Runs one engine execution through the concurrency gate, the engine's
//! circuit breaker and the process runner, in that order.

use super::{EngineRegistry, EngineSpec};
use crate::breaker::{
    BreakerConfig, BreakerHealth, CachedResultFallback, CallContext, CircuitBreaker,
};
use crate::errors::{EngineError, RunnerError};
use crate::gate::ConcurrencyGate;
use crate::runner::{ProcessRunner, ResourceLimits};
use crate::stream::EngineSink;
use crate::stream::classify::{extract_answer, extract_error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Priority of the replay-last-result fallback every engine breaker carries.
const CACHED_FALLBACK_PRIORITY: u32 = 10;
const CACHED_FALLBACK_CAPACITY: usize = 64;

/// One engine invocation, immutable once submitted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub engine: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub working_dir: PathBuf,
    pub limits: ResourceLimits,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(engine: impl Into<String>, prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: engine.into(),
            prompt: prompt.into(),
            system_prompt: None,
            working_dir: working_dir.into(),
            limits: ResourceLimits::default(),
            session_id: None,
            request_id: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Prompt as delivered to the engine: context first, then the task.
    pub fn full_prompt(&self) -> String {
        match &self.system_prompt {
            Some(system) if !system.trim().is_empty() => format!("{}\n\n{}", system.trim_end(), self.prompt),
            _ => self.prompt.clone(),
        }
    }
}

/// Outcome of one [`ExecutionRequest`]. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub engine: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub command: String,
    pub working_dir: PathBuf,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Owns the shared execution path for every engine.
///
/// The gate is global; breakers are created lazily, one per engine id, and
/// live as long as the invoker.
pub struct EngineInvoker {
    registry: Arc<EngineRegistry>,
    runner: ProcessRunner,
    gate: ConcurrencyGate,
    breaker_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker<ExecutionResult>>>>,
}

impl std::fmt::Debug for EngineInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInvoker")
            .field("gate", &self.gate)
            .field("breaker_config", &self.breaker_config)
            .finish()
    }
}

impl EngineInvoker {
    pub fn new(
        registry: Arc<EngineRegistry>,
        runner: ProcessRunner,
        gate: ConcurrencyGate,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            registry,
            runner,
            gate,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// The breaker guarding `engine`, created on first use.
    ///
    /// Every breaker starts with a [`CachedResultFallback`]; further
    /// strategies such as
    /// [`DegradedResponseFallback`](crate::breaker::DegradedResponseFallback)
    /// can be added to the returned breaker and apply to later executions.
    pub fn breaker(&self, engine: &str) -> Arc<CircuitBreaker<ExecutionResult>> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(engine.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(engine, self.breaker_config.clone());
                breaker.add_fallback(Arc::new(CachedResultFallback::new(
                    CACHED_FALLBACK_PRIORITY,
                    CACHED_FALLBACK_CAPACITY,
                )));
                Arc::new(breaker)
            })
            .clone()
    }

    /// Health of every breaker created so far, sorted by engine id.
    pub fn health(&self) -> Vec<BreakerHealth> {
        let breakers: Vec<_> = self
            .breakers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut health: Vec<_> = breakers.iter().map(|b| b.health()).collect();
        health.sort_by(|a, b| a.engine.cmp(&b.engine));
        health
    }

    /// Run `request` to a result. Failures become unsuccessful results; the
    /// caller decides what a failure means for the analysis as a whole.
    pub async fn execute(&self, request: &ExecutionRequest, sink: Option<EngineSink>) -> ExecutionResult {
        let Some(spec) = self.registry.get(&request.engine) else {
            let error = EngineError::UnknownEngine(request.engine.clone());
            return failed_result(request, request.engine.clone(), &error, Duration::ZERO);
        };

        let slot = self.gate.acquire().await;
        let started = Instant::now();
        if let Some(sink) = &sink {
            sink.start();
        }
        let breaker = self.breaker(&request.engine);
        let ctx = call_context(request);
        let outcome = breaker
            .call(&ctx, || self.run_once(spec, request, sink.as_ref()))
            .await;
        slot.release();
        let duration = started.elapsed();

        match outcome {
            Ok(result) => {
                if let Some(sink) = &sink {
                    sink.finish(None);
                }
                info!(engine = %request.engine, duration_ms = duration.as_millis() as u64, "engine succeeded");
                result
            }
            Err(error) => {
                warn!(engine = %request.engine, error = %error, "engine failed");
                let result = failed_result(request, spec.display_command(), &error, duration);
                if let Some(sink) = &sink {
                    sink.finish(result.error.as_deref());
                }
                result
            }
        }
    }

    async fn run_once(
        &self,
        spec: &EngineSpec,
        request: &ExecutionRequest,
        sink: Option<&EngineSink>,
    ) -> Result<ExecutionResult, EngineError> {
        let mut run = spec.run_request(&request.full_prompt(), &request.working_dir, request.limits.clone());
        if let Some(sink) = sink {
            run = run.with_callback(sink.callback());
        }
        debug!(engine = %spec.id, command = %spec.display_command(), "invoking engine");

        let output = match self.runner.run(run).await {
            Ok(output) => output,
            Err(RunnerError::NonZeroExit { code, stdout, stderr }) => {
                // Prefer the engine's own account of the failure over the bare code.
                if let Some(message) = extract_error(spec.convention, &stdout) {
                    debug!(engine = %spec.id, code, stderr_bytes = stderr.len(), "engine reported failure");
                    return Err(EngineError::Reported {
                        engine: spec.id.clone(),
                        message,
                    });
                }
                return Err(RunnerError::NonZeroExit { code, stdout, stderr }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let answer = extract_answer(spec.convention, &output.stdout);
        if answer.trim().is_empty()
            && let Some(message) = extract_error(spec.convention, &output.stdout)
        {
            return Err(EngineError::Reported {
                engine: spec.id.clone(),
                message,
            });
        }

        Ok(ExecutionResult {
            engine: spec.id.clone(),
            success: true,
            output: answer,
            error: None,
            duration: output.duration,
            exit_code: Some(output.exit_code),
            command: spec.display_command(),
            working_dir: output.working_dir,
        })
    }
}

fn call_context(request: &ExecutionRequest) -> CallContext {
    let request_id = request.request_id.clone().unwrap_or_else(|| {
        crate::cache::key::cache_key(&serde_json::json!({
            "engine": request.engine,
            "prompt": request.full_prompt(),
        }))
    });
    let mut ctx = CallContext::new()
        .with_request_id(request_id)
        .with_metadata("engine", request.engine.clone());
    if let Some(session) = &request.session_id {
        ctx = ctx.with_metadata("session_id", session.clone());
    }
    ctx
}

fn failed_result(request: &ExecutionRequest, command: String, error: &EngineError, duration: Duration) -> ExecutionResult {
    let exit_code = match error {
        EngineError::Runner(e) => e.exit_code(),
        _ => None,
    };
    ExecutionResult {
        engine: request.engine.clone(),
        success: false,
        output: String::new(),
        error: Some(describe(error)),
        duration,
        exit_code,
        command,
        working_dir: request.working_dir.clone(),
    }
}

/// Error text for a failed execution, with the tail of stderr when the
/// process exited on its own.
fn describe(error: &EngineError) -> String {
    match error {
        EngineError::Runner(RunnerError::NonZeroExit { stderr, .. }) => {
            match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(last) => format!("{}: {}", error, last.trim()),
                None => error.to_string(),
            }
        }
        other => other.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::analysis::AnalysisType;
    use crate::breaker::{CircuitState, DegradedResponseFallback};
    use crate::errors::ErrorClass;
    use crate::engines::PromptDelivery;
    use crate::stream::{OutputConvention, StreamEventType, StreamPipeline, ThrottleBuffer};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn plain(id: &str, command: String) -> EngineSpec {
        EngineSpec {
            id: id.into(),
            display_name: id.into(),
            command,
            args: Vec::new(),
            delivery: PromptDelivery::Stdin,
            convention: OutputConvention::PlainText,
        }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
            max_memory_mb: None,
            max_cpu_secs: None,
        }
    }

    fn invoker(specs: Vec<EngineSpec>, config: BreakerConfig) -> EngineInvoker {
        EngineInvoker::new(
            Arc::new(EngineRegistry::new(specs)),
            ProcessRunner::new(),
            ConcurrencyGate::new(2),
            config,
        )
    }

    #[tokio::test]
    async fn test_successful_execution_returns_answer() {
        let dir = tempfile::tempdir().unwrap();
        let echo = script(dir.path(), "echo-engine", "cat");
        let invoker = invoker(vec![plain("echo", echo)], BreakerConfig::default());
        let request = ExecutionRequest::new("echo", "look at this", dir.path())
            .with_system_prompt("You are a critic.")
            .with_limits(limits());

        let result = invoker.execute(&request, None).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, "You are a critic.\n\nlook at this");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(invoker.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_becomes_unsuccessful_result() {
        let dir = tempfile::tempdir().unwrap();
        let bad = script(dir.path(), "bad-engine", "echo 'quota exhausted' >&2\nexit 2");
        let invoker = invoker(vec![plain("bad", bad)], BreakerConfig::default());
        let request = ExecutionRequest::new("bad", "x", dir.path()).with_limits(limits());

        let result = invoker.execute(&request, None).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(2));
        assert!(result.error.unwrap().contains("quota exhausted"));
        assert_eq!(invoker.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_engine_is_rejected_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = invoker(Vec::new(), BreakerConfig::default());
        let result = invoker.execute(&ExecutionRequest::new("ghost", "x", dir.path()), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("ghost"));
        assert!(invoker.health().is_empty());
    }

    #[tokio::test]
    async fn test_reported_error_with_clean_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let gemini = script(
            dir.path(),
            "gemini",
            r#"cat > /dev/null
echo '{"error":{"message":"API key not valid"}}'"#,
        );
        let invoker = invoker(vec![EngineSpec::gemini().with_command(gemini)], BreakerConfig::default());
        let request = ExecutionRequest::new("gemini", "x", dir.path()).with_limits(limits());

        let result = invoker.execute(&request, None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("API key not valid"));
    }

    #[tokio::test]
    async fn test_repeated_failures_open_the_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("calls");
        let bad = script(
            dir.path(),
            "flaky",
            &format!("echo x >> {}\nexit 1", marker.display()),
        );
        let config = BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        };
        let invoker = invoker(vec![plain("flaky", bad)], config);
        let request = ExecutionRequest::new("flaky", "x", dir.path()).with_limits(limits());

        for _ in 0..3 {
            assert!(!invoker.execute(&request, None).await.success);
        }
        assert_eq!(invoker.breaker("flaky").state(), CircuitState::Open);
        let spawned = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(spawned, 2, "the open breaker must not spawn the engine");
    }

    #[tokio::test]
    async fn test_added_degraded_fallback_answers_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let bad = script(dir.path(), "down", "exit 1");
        let config = BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        };
        let invoker = invoker(vec![plain("down", bad)], config);
        invoker.breaker("down").add_fallback(Arc::new(
            DegradedResponseFallback::new(90, |_, ctx| ExecutionResult {
                engine: ctx.metadata.get("engine").cloned().unwrap_or_default(),
                success: false,
                output: String::new(),
                error: Some("engine cooling down".into()),
                duration: Duration::ZERO,
                exit_code: None,
                command: String::new(),
                working_dir: PathBuf::new(),
            })
            .only_for(vec![ErrorClass::BreakerOpen]),
        ));
        let request = ExecutionRequest::new("down", "x", dir.path()).with_limits(limits());

        let first = invoker.execute(&request, None).await;
        assert!(!first.success);
        assert_ne!(first.error.as_deref(), Some("engine cooling down"));
        assert_eq!(invoker.breaker("down").state(), CircuitState::Open);

        let degraded = invoker.execute(&request, None).await;
        assert_eq!(degraded.engine, "down");
        assert_eq!(degraded.error.as_deref(), Some("engine cooling down"));
    }

    #[tokio::test]
    async fn test_open_breaker_replays_last_success_for_same_request() {
        let dir = tempfile::tempdir().unwrap();
        let toggle = dir.path().join("broken");
        let engine = script(
            dir.path(),
            "toggle",
            &format!("if [ -e {} ]; then exit 1; fi\necho fresh", toggle.display()),
        );
        let config = BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        };
        let invoker = invoker(vec![plain("toggle", engine)], config);
        let request = ExecutionRequest::new("toggle", "x", dir.path())
            .with_request_id("req-1")
            .with_limits(limits());

        assert_eq!(invoker.execute(&request, None).await.output, "fresh");
        std::fs::write(&toggle, "").unwrap();
        let replayed = invoker.execute(&request, None).await;
        assert!(replayed.success);
        assert_eq!(replayed.output, "fresh");

        let other = ExecutionRequest::new("toggle", "x", dir.path())
            .with_request_id("req-2")
            .with_limits(limits());
        assert!(!invoker.execute(&other, None).await.success);
    }

    #[tokio::test]
    async fn test_sink_receives_start_text_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let claude = script(
            dir.path(),
            "claude",
            r#"cat > /dev/null
echo '{"type":"system","subtype":"init"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Reading the code"}]}}'
echo '{"type":"result","subtype":"success","result":"The code looks fine","is_error":false}'"#,
        );
        let invoker = invoker(vec![EngineSpec::claude().with_command(claude)], BreakerConfig::default());
        let pipeline = StreamPipeline::new(ThrottleBuffer::new(Duration::from_secs(60), 100));
        let mut subscription = pipeline.open_session("s1", AnalysisType::Code);
        let sink = pipeline.sink("s1", "claude", EngineSpec::claude().convention);

        let request = ExecutionRequest::new("claude", "x", dir.path())
            .with_session("s1")
            .with_limits(limits());
        let result = invoker.execute(&request, Some(sink)).await;
        assert!(result.success);
        assert_eq!(result.output, "The code looks fine");

        let mut kinds = Vec::new();
        while let Ok(event) = subscription.events.try_recv() {
            kinds.push((event.kind, event.content));
        }
        assert_eq!(kinds.first().map(|k| k.0), Some(StreamEventType::Start));
        assert!(kinds.contains(&(StreamEventType::Progress, "Reading the code".to_string())));
        assert_eq!(kinds.last().map(|k| k.0), Some(StreamEventType::Complete));
    }

    #[test]
    fn test_display_command_hides_positional_prompt() {
        let request = ExecutionRequest::new("codex", "secret prompt", "/tmp");
        let spec = EngineSpec::codex();
        let result = failed_result(
            &request,
            spec.display_command(),
            &EngineError::Unavailable("codex".into()),
            Duration::ZERO,
        );
        assert_eq!(result.command, "codex exec --json <prompt>");
        assert!(!result.command.contains("secret"));
    }
}
