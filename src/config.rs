//! Layered configuration for crossfire.
//!
//! Settings are resolved in this order, later layers winning:
//! 1. built-in defaults
//! 2. `crossfire.toml` (project `.crossfire/` first, then the user config dir)
//! 3. `CROSSFIRE_*` environment variables, with `.env` loaded through dotenvy
//! 4. CLI flags, applied by the command layer
//!
//! # Configuration File Format
//!
//! ```toml
//! [execution]
//! default_timeout_ms = 600000
//! max_concurrent = 4
//! max_memory_mb = 2048
//!
//! [breaker]
//! failure_threshold = 5
//! recovery_timeout_ms = 60000
//!
//! [throttle]
//! flush_interval_ms = 250
//! max_chunks = 10
//!
//! [cache]
//! max_entries = 100
//! ttl_hours = 24
//!
//! [engines]
//! enabled = ["claude", "codex", "gemini"]
//! host_engine = "claude"
//!
//! [engines.commands]
//! codex = "/opt/codex/bin/codex"
//! ```

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::engines::EngineRegistry;
use crate::gate::ConcurrencyGate;
use crate::runner::{ProcessRunner, ResourceLimits};
use crate::stream::ThrottleBuffer;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_DIR: &str = ".crossfire";
pub const CONFIG_FILE: &str = "crossfire.toml";
const ENV_PREFIX: &str = "CROSSFIRE_";
const MB: usize = 1024 * 1024;

/// Process execution limits and concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub default_timeout_ms: u64,
    /// Timeout for the `--version` availability probe.
    pub probe_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    pub max_memory_mb: u64,
    pub max_cpu_secs: u64,
    pub kill_grace_ms: u64,
    pub monitor_interval_ms: u64,
    /// Working directories must live under this root when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_root: Option<PathBuf>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 600_000,
            probe_timeout_ms: 5_000,
            max_output_bytes: 10 * MB,
            max_concurrent: 4,
            max_memory_mb: 2048,
            max_cpu_secs: 600,
            kill_grace_ms: 5_000,
            monitor_interval_ms: 1_000,
            allowed_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Defaults to the execution timeout plus 30 seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
    pub window_ms: u64,
    pub max_window_samples: usize,
    pub minimum_samples: usize,
    pub failure_rate_threshold: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_ms: 60_000,
            call_timeout_ms: None,
            window_ms: 60_000,
            max_window_samples: 100,
            minimum_samples: 10,
            failure_rate_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub flush_interval_ms: u64,
    pub max_chunks: usize,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 250,
            max_chunks: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub ttl_hours: f64,
    pub max_size_mb: f64,
    pub max_entry_size_mb: f64,
    pub compression_threshold_mb: f64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl_hours: 24.0,
            max_size_mb: 100.0,
            max_entry_size_mb: 10.0,
            compression_threshold_mb: 1.0,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engines to consider. Empty means every built-in engine.
    pub enabled: Vec<String>,
    /// The CLI hosting crossfire, left out of fan-out to avoid recursion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_engine: Option<String>,
    /// Per-engine command overrides.
    pub commands: BTreeMap<String, String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: vec!["claude".into(), "codex".into(), "gemini".into()],
            host_engine: None,
            commands: BTreeMap::new(),
        }
    }
}

/// Every configuration knob.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub execution: ExecutionSettings,
    pub breaker: BreakerSettings,
    pub throttle: ThrottleSettings,
    pub cache: CacheSettings,
    pub engines: EngineSettings,
    /// Problems found while applying environment overrides.
    #[serde(skip)]
    env_warnings: Vec<String>,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crossfire.toml")
    }

    /// First config file that exists: project, then user config dir.
    pub fn locate(project_dir: &Path) -> Option<PathBuf> {
        let project = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if project.exists() {
            return Some(project);
        }
        dirs::config_dir()
            .map(|dir| dir.join("crossfire").join(CONFIG_FILE))
            .filter(|p| p.exists())
    }

    /// Load from the located file, or defaults when there is none.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        match Self::locate(project_dir) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// File layers plus the process environment (and `.env`).
    pub fn resolve(project_dir: &Path) -> Result<Self> {
        let _ = dotenvy::from_path(project_dir.join(".env"));
        let mut settings = Self::load_or_default(project_dir)?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Save settings to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize crossfire.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CROSSFIRE_*` overrides read through `lookup`.
    ///
    /// Unparseable values keep the previous setting and are reported by
    /// [`validate`](Self::validate).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = EnvLayer {
            lookup: &lookup,
            warnings: Vec::new(),
        };
        let exec = &mut self.execution;
        env.set("DEFAULT_TIMEOUT_MS", &mut exec.default_timeout_ms);
        env.set("PROBE_TIMEOUT_MS", &mut exec.probe_timeout_ms);
        env.set("MAX_OUTPUT_BYTES", &mut exec.max_output_bytes);
        env.set("MAX_CONCURRENT", &mut exec.max_concurrent);
        env.set("MAX_MEMORY_MB", &mut exec.max_memory_mb);
        env.set("MAX_CPU_SECS", &mut exec.max_cpu_secs);

        let cache = &mut self.cache;
        env.set("CACHE_MAX_ENTRIES", &mut cache.max_entries);
        env.set("CACHE_TTL_HOURS", &mut cache.ttl_hours);
        env.set("CACHE_MAX_SIZE_MB", &mut cache.max_size_mb);
        env.set("CACHE_MAX_ENTRY_SIZE_MB", &mut cache.max_entry_size_mb);
        env.set("CACHE_COMPRESSION_THRESHOLD_MB", &mut cache.compression_threshold_mb);

        if let Some(host) = env.raw("HOST_ENGINE") {
            self.engines.host_engine = (!host.trim().is_empty()).then(|| host.trim().to_ascii_lowercase());
        }
        let ids: Vec<String> = EngineRegistry::builtin()
            .ids()
            .map(str::to_string)
            .chain(self.engines.enabled.iter().cloned())
            .collect();
        for id in ids {
            if let Some(command) = env.raw(&format!("{}_CMD", id.to_ascii_uppercase())) {
                self.engines.commands.insert(id, command);
            }
        }

        self.env_warnings.extend(env.warnings);
    }

    /// Check the settings and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        let exec = &self.execution;

        if exec.max_concurrent == 0 {
            warnings.push("execution.max_concurrent is 0; one slot will be used".to_string());
        }
        if exec.default_timeout_ms == 0 {
            warnings.push("execution.default_timeout_ms must be greater than 0".to_string());
        }
        if exec.probe_timeout_ms > exec.default_timeout_ms {
            warnings.push(format!(
                "execution.probe_timeout_ms ({}) exceeds default_timeout_ms ({})",
                exec.probe_timeout_ms, exec.default_timeout_ms
            ));
        }
        if let Some(call) = self.breaker.call_timeout_ms
            && call < exec.default_timeout_ms
        {
            warnings.push(format!(
                "breaker.call_timeout_ms ({}) is shorter than the execution timeout ({}); slow engines will be abandoned early",
                call, exec.default_timeout_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.breaker.failure_rate_threshold) {
            warnings.push(format!(
                "breaker.failure_rate_threshold {} should be between 0 and 1",
                self.breaker.failure_rate_threshold
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            warnings.push("breaker thresholds must be at least 1".to_string());
        }
        if ttl_from_hours(self.cache.ttl_hours).is_none() {
            warnings.push(format!(
                "cache.ttl_hours {} is out of range; the default TTL will be used",
                self.cache.ttl_hours
            ));
        }
        if self.cache.compression_threshold_mb > self.cache.max_entry_size_mb {
            warnings.push(format!(
                "cache.compression_threshold_mb ({}) exceeds max_entry_size_mb ({}); nothing will be compressed",
                self.cache.compression_threshold_mb, self.cache.max_entry_size_mb
            ));
        }
        if self.cache.max_entry_size_mb > self.cache.max_size_mb {
            warnings.push(format!(
                "cache.max_entry_size_mb ({}) exceeds max_size_mb ({})",
                self.cache.max_entry_size_mb, self.cache.max_size_mb
            ));
        }

        let known: Vec<String> = EngineRegistry::builtin().ids().map(str::to_string).collect();
        for id in &self.engines.enabled {
            if !known.contains(id) {
                warnings.push(format!("Unknown engine '{}' in engines.enabled", id));
            }
        }
        if let Some(host) = &self.engines.host_engine
            && !known.contains(host)
        {
            warnings.push(format!("Unknown engine '{}' in engines.host_engine", host));
        }
        for id in self.engines.commands.keys() {
            if !known.contains(id) {
                warnings.push(format!("Command override for unknown engine '{}'", id));
            }
        }

        warnings
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.default_timeout_ms)
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        let exec = &self.execution;
        ResourceLimits {
            timeout: self.default_timeout(),
            max_output_bytes: exec.max_output_bytes,
            max_memory_mb: (exec.max_memory_mb > 0).then_some(exec.max_memory_mb),
            max_cpu_secs: (exec.max_cpu_secs > 0).then_some(exec.max_cpu_secs),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        let b = &self.breaker;
        let call_timeout = b
            .call_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.default_timeout() + Duration::from_secs(30));
        BreakerConfig {
            failure_threshold: b.failure_threshold.max(1),
            success_threshold: b.success_threshold.max(1),
            recovery_timeout: Duration::from_millis(b.recovery_timeout_ms),
            call_timeout,
            window: Duration::from_millis(b.window_ms),
            max_window_samples: b.max_window_samples.max(1),
            minimum_samples: b.minimum_samples,
            failure_rate_threshold: b.failure_rate_threshold,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        let c = &self.cache;
        let bytes = |mb: f64| (mb.max(0.0) * MB as f64) as usize;
        CacheConfig {
            max_entries: c.max_entries.max(1),
            ttl: ttl_from_hours(c.ttl_hours).unwrap_or_else(|| CacheConfig::default().ttl),
            max_total_bytes: bytes(c.max_size_mb),
            max_entry_bytes: bytes(c.max_entry_size_mb),
            compression_threshold: bytes(c.compression_threshold_mb),
            sweep_interval: Duration::from_secs(c.sweep_interval_secs),
        }
    }

    pub fn throttle_buffer(&self) -> ThrottleBuffer {
        ThrottleBuffer::new(
            Duration::from_millis(self.throttle.flush_interval_ms),
            self.throttle.max_chunks,
        )
    }

    pub fn runner(&self) -> ProcessRunner {
        let exec = &self.execution;
        let runner = ProcessRunner::new()
            .with_kill_grace(Duration::from_millis(exec.kill_grace_ms))
            .with_monitor_interval(Duration::from_millis(exec.monitor_interval_ms.max(10)));
        match &exec.allowed_root {
            Some(root) => runner.with_allowed_root(root),
            None => runner,
        }
    }

    pub fn gate(&self) -> ConcurrencyGate {
        ConcurrencyGate::new(self.execution.max_concurrent)
    }

    pub fn engine_registry(&self) -> EngineRegistry {
        let overrides = self
            .engines
            .commands
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        EngineRegistry::builtin()
            .with_probe_timeout(Duration::from_millis(self.execution.probe_timeout_ms))
            .with_command_overrides(&overrides)
            .restrict_to(&self.engines.enabled)
    }
}

/// `None` for negative, non-finite, or unrepresentable values.
fn ttl_from_hours(hours: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(hours * 3600.0).ok()
}

struct EnvLayer<'a, F> {
    lookup: &'a F,
    warnings: Vec<String>,
}

impl<F> EnvLayer<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, suffix))
    }

    fn set<T: FromStr>(&mut self, suffix: &str, target: &mut T) {
        let Some(value) = self.raw(suffix) else {
            return;
        };
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => self.warnings.push(format!(
                "Ignoring {}{}='{}': not a valid value",
                ENV_PREFIX, suffix, value
            )),
        }
    }
}
