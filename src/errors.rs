//! Typed error hierarchy for the critique orchestrator.
//!
//! Four enums cover the layers an execution passes through:
//! - `RunnerError`: validation, resource-limit and execution failures of one process
//! - `EngineError`: runner failures plus synthetic breaker errors, as seen by a circuit breaker
//! - `CacheError`: response cache write failures
//! - `OrchestratorError`: façade-level failures surfaced to the caller

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::runner::StreamKind;

/// Coarse classification used by fallback strategies and the façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any process was spawned. Never retried.
    Validation,
    /// Process killed for exceeding a timeout or resource ceiling.
    ResourceLimit,
    /// Process ran and exited unsuccessfully (or could not be driven).
    Execution,
    /// Synthetic rejection by an open circuit breaker.
    BreakerOpen,
    /// The awaiting call was abandoned (breaker timeout or reset).
    Cancelled,
}

/// Errors from a single process execution.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Command must not be empty")]
    EmptyCommand,

    #[error("Argument {index} contains a null byte")]
    NullByte { index: usize },

    #[error("Invalid working directory {path}: {reason}")]
    InvalidWorkingDir { path: std::path::PathBuf, reason: String },

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while driving process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output on {stream} exceeded {limit} bytes")]
    BufferExceeded { stream: StreamKind, limit: usize },

    #[error("Process memory {observed_mb} MB exceeded limit of {limit_mb} MB")]
    MemoryExceeded { limit_mb: u64, observed_mb: u64 },

    #[error("Process CPU time exceeded limit of {limit_secs}s")]
    CpuTimeExceeded { limit_secs: u64 },

    #[error("Process timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Process exited with non-zero code {code}")]
    NonZeroExit {
        code: i32,
        stdout: String,
        stderr: String,
    },
}

impl RunnerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RunnerError::EmptyCommand
            | RunnerError::NullByte { .. }
            | RunnerError::InvalidWorkingDir { .. } => ErrorClass::Validation,
            RunnerError::BufferExceeded { .. }
            | RunnerError::MemoryExceeded { .. }
            | RunnerError::CpuTimeExceeded { .. }
            | RunnerError::Timeout { .. } => ErrorClass::ResourceLimit,
            RunnerError::SpawnFailed { .. }
            | RunnerError::Io(_)
            | RunnerError::NonZeroExit { .. } => ErrorClass::Execution,
        }
    }

    /// Exit code when the process ran to completion unsuccessfully.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunnerError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors as observed through a circuit breaker.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Circuit breaker open for engine {engine}")]
    BreakerOpen {
        engine: String,
        retry_after: Option<Duration>,
    },

    #[error("Breaker call for engine {engine} did not settle within {after:?}")]
    CallTimeout { engine: String, after: Duration },

    #[error("Circuit breaker for engine {engine} was reset while the call was in flight")]
    Reset { engine: String },

    #[error("Engine '{0}' is not registered")]
    UnknownEngine(String),

    #[error("Engine '{0}' is not available on this host")]
    Unavailable(String),

    #[error("Engine {engine} reported an error: {message}")]
    Reported { engine: String, message: String },

    #[error("Fallback '{strategy}' produced no result: {reason}")]
    FallbackFailed { strategy: String, reason: String },
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Runner(e) => e.class(),
            EngineError::BreakerOpen { .. } => ErrorClass::BreakerOpen,
            EngineError::CallTimeout { .. } | EngineError::Reset { .. } => ErrorClass::Cancelled,
            EngineError::UnknownEngine(_) => ErrorClass::Validation,
            EngineError::Unavailable(_)
            | EngineError::Reported { .. }
            | EngineError::FallbackFailed { .. } => ErrorClass::Execution,
        }
    }

    /// Whether re-running the same invocation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ResourceLimit | ErrorClass::Execution | ErrorClass::Cancelled
        ) && !matches!(self, EngineError::Unavailable(_))
    }
}

/// Errors from the response cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Entry of {size} bytes exceeds the per-entry limit of {limit} bytes")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("Failed to compress cache entry: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Failed to decompress cache entry: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// One engine's failure inside a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EngineFailure {
    pub engine: String,
    /// Sanitized, user-presentable message.
    pub message: String,
}

/// Errors surfaced by the orchestration façade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("All {} engine(s) failed", failures.len())]
    AllEnginesFailed { failures: Vec<EngineFailure> },

    #[error("No critique engines are available")]
    NoEnginesAvailable,

    #[error("Engine '{0}' is not registered")]
    UnknownEngine(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// A stable message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::AllEnginesFailed { failures } => {
                let detail = failures
                    .iter()
                    .map(|f| format!("{}: {}", f.engine, f.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("Analysis failed on every engine ({})", detail)
            }
            other => sanitize_message(&other.to_string()),
        }
    }
}

/// Maximum length of a sanitized message body, before the reference suffix.
const MAX_SANITIZED_LEN: usize = 240;

static PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[A-Za-z]:\\|~?/)[^\s:'"`,;)]+"#).expect("path pattern is a valid static regex")
});

static BACKTRACE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:at |\d+: ).*$").expect("backtrace pattern is a valid static regex")
});

/// Strip filesystem paths and stack frames from a raw error message and
/// append a short diagnostic reference for log correlation.
pub fn sanitize_message(raw: &str) -> String {
    let without_frames = BACKTRACE_REGEX.replace_all(raw, "");
    let redacted = PATH_REGEX.replace_all(&without_frames, "<path>");
    let collapsed = redacted.split_whitespace().collect::<Vec<_>>().join(" ");

    let body = if collapsed.chars().count() > MAX_SANITIZED_LEN {
        let cut: String = collapsed.chars().take(MAX_SANITIZED_LEN - 3).collect();
        format!("{}...", cut)
    } else {
        collapsed
    };

    format!("{} [ref {}]", body, diagnostic_ref(raw))
}

/// Short hash of the raw message; logged alongside the full text.
pub fn diagnostic_ref(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_error_validation_variants_classify_as_validation() {
        assert_eq!(RunnerError::EmptyCommand.class(), ErrorClass::Validation);
        assert_eq!(RunnerError::NullByte { index: 2 }.class(), ErrorClass::Validation);
        let err = RunnerError::InvalidWorkingDir {
            path: "/nope".into(),
            reason: "does not exist".into(),
        };
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_runner_error_limits_classify_as_resource_limit() {
        let err = RunnerError::BufferExceeded {
            stream: StreamKind::Stdout,
            limit: 10,
        };
        assert_eq!(err.class(), ErrorClass::ResourceLimit);
        let err = RunnerError::Timeout {
            after: Duration::from_secs(1),
        };
        assert_eq!(err.class(), ErrorClass::ResourceLimit);
    }

    #[test]
    fn test_non_zero_exit_carries_code_and_streams() {
        let err = RunnerError::NonZeroExit {
            code: 3,
            stdout: "out".into(),
            stderr: "err".into(),
        };
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.class(), ErrorClass::Execution);
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_engine_error_breaker_open_is_not_retryable() {
        let err = EngineError::BreakerOpen {
            engine: "codex".into(),
            retry_after: None,
        };
        assert_eq!(err.class(), ErrorClass::BreakerOpen);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_engine_error_converts_from_runner_error() {
        let err: EngineError = RunnerError::Timeout {
            after: Duration::from_millis(5),
        }
        .into();
        assert!(matches!(err, EngineError::Runner(RunnerError::Timeout { .. })));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sanitize_removes_paths() {
        let msg = sanitize_message("failed to open /home/alice/secret/project/main.rs: denied");
        assert!(!msg.contains("/home/alice"));
        assert!(msg.contains("<path>"));
        assert!(msg.contains("[ref "));
    }

    #[test]
    fn test_sanitize_drops_stack_frames_and_truncates() {
        let raw = format!("boom\n   at Object.run (x.js:1:1)\n{}", "y".repeat(500));
        let msg = sanitize_message(&raw);
        assert!(!msg.contains("Object.run"));
        assert!(msg.contains("..."));
        assert!(msg.len() < 300);
    }

    #[test]
    fn test_diagnostic_ref_is_stable() {
        assert_eq!(diagnostic_ref("abc"), diagnostic_ref("abc"));
        assert_eq!(diagnostic_ref("abc").len(), 8);
    }

    #[test]
    fn test_all_errors_failed_user_message_lists_engines() {
        let err = OrchestratorError::AllEnginesFailed {
            failures: vec![EngineFailure {
                engine: "gemini".into(),
                message: "timed out".into(),
            }],
        };
        let text = err.user_message();
        assert!(text.contains("gemini: timed out"));
    }

    #[test]
    fn test_all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&RunnerError::EmptyCommand);
        assert_std_error(&EngineError::UnknownEngine("x".into()));
        assert_std_error(&CacheError::LockPoisoned);
        assert_std_error(&OrchestratorError::NoEnginesAvailable);
    }
}
