//! Critique engine definitions, availability probing, and target selection.

pub mod invoker;

pub use invoker::{EngineInvoker, ExecutionRequest, ExecutionResult};

use crate::errors::OrchestratorError;
use crate::runner::{ProcessRunner, ResourceLimits, RunRequest};
use crate::stream::{JsonDialect, OutputConvention};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_OUTPUT_LIMIT: usize = 64 * 1024;

/// How the prompt reaches the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptDelivery {
    /// Written to stdin, which is then closed.
    Stdin,
    /// Appended as the last argument; stdin is closed with no payload.
    Argument,
}

/// One external critique engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub id: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub delivery: PromptDelivery,
    pub convention: OutputConvention,
}

impl EngineSpec {
    pub fn claude() -> Self {
        Self {
            id: "claude".into(),
            display_name: "Claude".into(),
            command: "claude".into(),
            args: vec![
                "--print".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
            ],
            delivery: PromptDelivery::Stdin,
            convention: OutputConvention::JsonLines(JsonDialect::ClaudeStream),
        }
    }

    pub fn codex() -> Self {
        Self {
            id: "codex".into(),
            display_name: "Codex".into(),
            command: "codex".into(),
            args: vec!["exec".into(), "--json".into()],
            delivery: PromptDelivery::Argument,
            convention: OutputConvention::JsonLines(JsonDialect::CodexExec),
        }
    }

    pub fn gemini() -> Self {
        Self {
            id: "gemini".into(),
            display_name: "Gemini".into(),
            command: "gemini".into(),
            args: vec!["--output-format".into(), "json".into()],
            delivery: PromptDelivery::Stdin,
            convention: OutputConvention::FinalJson,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Command line echoed in results. A positional prompt is elided.
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().cloned());
        if self.delivery == PromptDelivery::Argument {
            parts.push("<prompt>".to_string());
        }
        parts.join(" ")
    }

    /// Build the runner invocation for `prompt`.
    pub fn run_request(&self, prompt: &str, working_dir: &Path, limits: ResourceLimits) -> RunRequest {
        let request = RunRequest::new(&self.command, working_dir).with_limits(limits);
        match self.delivery {
            PromptDelivery::Stdin => request.with_args(self.args.iter().cloned()).with_stdin(prompt),
            PromptDelivery::Argument => request.with_args(
                self.args
                    .iter()
                    .cloned()
                    .chain(std::iter::once(prompt.to_string())),
            ),
        }
    }
}

/// Which engines a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSelection {
    /// Every available engine except the host.
    All,
    Single(String),
}

impl std::str::FromStr for EngineSelection {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            Ok(EngineSelection::All)
        } else {
            Ok(EngineSelection::Single(s.to_ascii_lowercase()))
        }
    }
}

/// Registered engines plus memoized availability.
#[derive(Debug)]
pub struct EngineRegistry {
    specs: IndexMap<String, EngineSpec>,
    probe_timeout: Duration,
    availability: Mutex<HashMap<String, bool>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EngineRegistry {
    pub fn new(specs: impl IntoIterator<Item = EngineSpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            availability: Mutex::new(HashMap::new()),
        }
    }

    pub fn builtin() -> Self {
        Self::new([EngineSpec::claude(), EngineSpec::codex(), EngineSpec::gemini()])
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replace engine commands, e.g. from configuration. Unknown ids are ignored.
    pub fn with_command_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        for (id, command) in overrides {
            if let Some(spec) = self.specs.get_mut(id) {
                spec.command = command.clone();
            }
        }
        self
    }

    /// Keep only the listed engines, in registry order.
    pub fn restrict_to(mut self, enabled: &[String]) -> Self {
        if !enabled.is_empty() {
            self.specs.retain(|id, _| enabled.iter().any(|e| e == id));
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&EngineSpec> {
        self.specs.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn specs(&self) -> impl Iterator<Item = &EngineSpec> {
        self.specs.values()
    }

    /// Whether `id` answers `--version`. The first answer is remembered.
    pub async fn probe(&self, runner: &ProcessRunner, id: &str) -> bool {
        if let Some(known) = self
            .availability
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
        {
            return *known;
        }
        let Some(spec) = self.specs.get(id) else {
            return false;
        };
        let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
        let request = RunRequest::new(&spec.command, cwd)
            .with_args(["--version"])
            .with_limits(ResourceLimits {
                timeout: self.probe_timeout,
                max_output_bytes: PROBE_OUTPUT_LIMIT,
                max_memory_mb: None,
                max_cpu_secs: None,
            });
        let available = match runner.run(request).await {
            Ok(output) => {
                debug!(engine = id, version = %output.stdout.trim(), "engine available");
                true
            }
            Err(e) => {
                info!(engine = id, error = %e, "engine unavailable");
                false
            }
        };
        self.availability
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), available);
        available
    }

    /// Registered engines that pass the probe, in registry order.
    pub async fn available(&self, runner: &ProcessRunner) -> Vec<String> {
        let checks = self.specs.keys().map(|id| async move {
            let ok = self.probe(runner, id).await;
            (id.clone(), ok)
        });
        futures::future::join_all(checks)
            .await
            .into_iter()
            .filter_map(|(id, ok)| ok.then_some(id))
            .collect()
    }

    /// Engines to invoke for `selection`.
    ///
    /// Fan-out uses every available engine except `host_engine`, so the tool
    /// never calls back into the CLI hosting it. An explicit single-engine
    /// request is honored even when it names the host.
    pub async fn resolve_targets(
        &self,
        runner: &ProcessRunner,
        selection: &EngineSelection,
        host_engine: Option<&str>,
    ) -> Result<Vec<String>, OrchestratorError> {
        match selection {
            EngineSelection::Single(id) => {
                if self.get(id).is_none() {
                    return Err(OrchestratorError::UnknownEngine(id.clone()));
                }
                if self.probe(runner, id).await {
                    Ok(vec![id.clone()])
                } else {
                    Err(OrchestratorError::NoEnginesAvailable)
                }
            }
            EngineSelection::All => {
                let targets: Vec<String> = self
                    .available(runner)
                    .await
                    .into_iter()
                    .filter(|id| Some(id.as_str()) != host_engine)
                    .collect();
                if targets.is_empty() {
                    Err(OrchestratorError::NoEnginesAvailable)
                } else {
                    Ok(targets)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_conventions() {
        let registry = EngineRegistry::builtin();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["claude", "codex", "gemini"]);
        assert_eq!(registry.get("codex").unwrap().delivery, PromptDelivery::Argument);
        assert_eq!(registry.get("gemini").unwrap().convention, OutputConvention::FinalJson);
    }

    #[test]
    fn test_stdin_delivery_keeps_prompt_out_of_args() {
        let dir = tempfile::tempdir().unwrap();
        let request = EngineSpec::claude().run_request("review this", dir.path(), ResourceLimits::default());
        assert_eq!(request.stdin.as_deref(), Some("review this"));
        assert!(!request.args.iter().any(|a| a == "review this"));
    }

    #[test]
    fn test_argument_delivery_closes_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let request = EngineSpec::codex().run_request("review this", dir.path(), ResourceLimits::default());
        assert!(request.stdin.is_none());
        assert_eq!(request.args, vec!["exec", "--json", "review this"]);
    }

    #[test]
    fn test_overrides_and_restriction() {
        let overrides = HashMap::from([
            ("codex".to_string(), "/opt/bin/codex".to_string()),
            ("nope".to_string(), "x".to_string()),
        ]);
        let registry = EngineRegistry::builtin()
            .with_command_overrides(&overrides)
            .restrict_to(&["codex".to_string(), "gemini".to_string()]);
        assert_eq!(registry.get("codex").unwrap().command, "/opt/bin/codex");
        assert!(registry.get("claude").is_none());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_selection_parsing() {
        assert_eq!("all".parse::<EngineSelection>().unwrap(), EngineSelection::All);
        assert_eq!("".parse::<EngineSelection>().unwrap(), EngineSelection::All);
        assert_eq!(
            "Codex".parse::<EngineSelection>().unwrap(),
            EngineSelection::Single("codex".into())
        );
    }

    #[cfg(unix)]
    mod probing {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn registry(dir: &Path) -> EngineRegistry {
            let overrides = HashMap::from([
                ("claude".to_string(), script(dir, "claude", "echo 1.0.0")),
                ("codex".to_string(), script(dir, "codex", "exit 3")),
                ("gemini".to_string(), script(dir, "gemini", "echo 0.9")),
            ]);
            EngineRegistry::builtin().with_command_overrides(&overrides)
        }

        #[tokio::test]
        async fn test_available_filters_failed_probes() {
            let dir = tempfile::tempdir().unwrap();
            let registry = registry(dir.path());
            let runner = ProcessRunner::new();
            assert_eq!(registry.available(&runner).await, vec!["claude", "gemini"]);
        }

        #[tokio::test]
        async fn test_probe_is_memoized() {
            let dir = tempfile::tempdir().unwrap();
            let registry = registry(dir.path());
            let runner = ProcessRunner::new();
            assert!(registry.probe(&runner, "claude").await);
            std::fs::remove_file(dir.path().join("claude")).unwrap();
            assert!(registry.probe(&runner, "claude").await);
        }

        #[tokio::test]
        async fn test_fan_out_excludes_host_engine() {
            let dir = tempfile::tempdir().unwrap();
            let registry = registry(dir.path());
            let runner = ProcessRunner::new();
            let targets = registry
                .resolve_targets(&runner, &EngineSelection::All, Some("claude"))
                .await
                .unwrap();
            assert_eq!(targets, vec!["gemini"]);

            let all = registry
                .resolve_targets(&runner, &EngineSelection::All, None)
                .await
                .unwrap();
            assert_eq!(all, vec!["claude", "gemini"]);
        }

        #[tokio::test]
        async fn test_single_engine_selection() {
            let dir = tempfile::tempdir().unwrap();
            let registry = registry(dir.path());
            let runner = ProcessRunner::new();
            let host = registry
                .resolve_targets(&runner, &EngineSelection::Single("claude".into()), Some("claude"))
                .await
                .unwrap();
            assert_eq!(host, vec!["claude"]);

            let err = registry
                .resolve_targets(&runner, &EngineSelection::Single("codex".into()), None)
                .await
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::NoEnginesAvailable));

            let err = registry
                .resolve_targets(&runner, &EngineSelection::Single("llama".into()), None)
                .await
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::UnknownEngine(_)));
        }
    }
}
