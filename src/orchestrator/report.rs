//! Synthesis of per-engine results into one report.

use crate::analysis::AnalysisType;
use crate::engines::ExecutionResult;
use crate::errors::{EngineFailure, OrchestratorError, diagnostic_ref, sanitize_message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One engine's contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSection {
    pub engine: String,
    pub output: String,
    pub duration_ms: u64,
}

/// Combined result of a single-engine or fan-out analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedReport {
    pub analysis: AnalysisType,
    pub target: String,
    pub session_id: Option<String>,
    /// Successful engines, sorted by engine id.
    pub sections: Vec<EngineSection>,
    /// Failed engines with sanitized messages, sorted by engine id.
    pub failures: Vec<EngineFailure>,
    pub summary: String,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
    /// Opaque cache id under which the rendered report was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<String>,
    /// Whether this report was served from the cache.
    #[serde(default)]
    pub cached: bool,
}

impl SynthesizedReport {
    /// Combine an unordered result set. Zero successes is the only failure.
    pub fn synthesize(
        analysis: AnalysisType,
        target: &str,
        session_id: Option<&str>,
        results: Vec<ExecutionResult>,
        total_duration_ms: u64,
    ) -> Result<Self, OrchestratorError> {
        let attempted = results.len();
        let mut sections = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            if result.success {
                sections.push(EngineSection {
                    engine: result.engine,
                    output: result.output,
                    duration_ms: result.duration.as_millis() as u64,
                });
            } else {
                let raw = result.error.unwrap_or_else(|| "unknown failure".to_string());
                warn!(engine = %result.engine, reference = %diagnostic_ref(&raw), error = %raw, "engine failure");
                failures.push(EngineFailure {
                    engine: result.engine,
                    message: sanitize_message(&raw),
                });
            }
        }
        sections.sort_by(|a, b| a.engine.cmp(&b.engine));
        failures.sort_by(|a, b| a.engine.cmp(&b.engine));

        if sections.is_empty() {
            return Err(if failures.is_empty() {
                OrchestratorError::NoEnginesAvailable
            } else {
                OrchestratorError::AllEnginesFailed { failures }
            });
        }

        let summary = if failures.is_empty() {
            format!("{} of {} engine(s) responded", sections.len(), attempted)
        } else {
            format!(
                "{} of {} engine(s) responded ({} failed)",
                sections.len(),
                attempted,
                failures
                    .iter()
                    .map(|f| f.engine.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        Ok(Self {
            analysis,
            target: target.to_string(),
            session_id: session_id.map(str::to_string),
            sections,
            failures,
            summary,
            total_duration_ms,
            created_at: Utc::now(),
            cache_id: None,
            cached: false,
        })
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.engine.as_str())
    }
}

/// Render a report as Markdown.
pub fn render_markdown(report: &SynthesizedReport) -> String {
    let mut out = format!(
        "# {}: {}\n\n{}\n",
        report.analysis.title(),
        report.target,
        report.summary
    );

    for section in &report.sections {
        out.push_str(&format!(
            "\n## {} ({:.1}s)\n\n{}\n",
            section.engine,
            section.duration_ms as f64 / 1000.0,
            section.output.trim_end()
        ));
    }

    if !report.failures.is_empty() {
        out.push_str("\n## Failed Engines\n\n");
        for failure in &report.failures {
            out.push_str(&format!("- **{}**: {}\n", failure.engine, failure.message));
        }
    }

    out
}
