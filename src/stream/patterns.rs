//! Phase and milestone detection tables.
//!
//! These are heuristics tuned against current engine output. They are kept
//! apart from the tracker so a new table can be swapped in without touching
//! the state machine; bump [`PatternSet::version`] when changing them.

use super::AnalysisPhase;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

pub const DEFAULT_PATTERNS_VERSION: &str = "2024.1";

/// Ordered phase indicators plus per-milestone triggers.
#[derive(Debug, Clone)]
pub struct PatternSet {
    version: String,
    phases: Vec<(AnalysisPhase, Regex)>,
    milestones: HashMap<String, Vec<Regex>>,
}

impl PatternSet {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            phases: Vec::new(),
            milestones: HashMap::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Add a phase indicator. Indicators are checked in insertion order.
    pub fn with_phase(mut self, phase: AnalysisPhase, pattern: &str) -> Result<Self, regex::Error> {
        self.phases.push((phase, Regex::new(pattern)?));
        Ok(self)
    }

    pub fn with_milestone(mut self, id: &str, pattern: &str) -> Result<Self, regex::Error> {
        self.milestones
            .entry(id.to_string())
            .or_default()
            .push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Highest phase any indicator matches in `text`.
    pub fn detect_phase(&self, text: &str) -> Option<AnalysisPhase> {
        self.phases
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(phase, _)| *phase)
            .max()
    }

    /// Whether a trigger for milestone `id` matches `text`.
    pub fn milestone_triggered(&self, id: &str, text: &str) -> bool {
        self.milestones
            .get(id)
            .is_some_and(|patterns| patterns.iter().any(|re| re.is_match(text)))
    }

    /// The built-in table, shared.
    pub fn builtin() -> Arc<PatternSet> {
        BUILTIN.clone()
    }
}

static BUILTIN: LazyLock<Arc<PatternSet>> = LazyLock::new(|| Arc::new(build_builtin()));

const PHASE_PATTERNS: &[(AnalysisPhase, &str)] = &[
    (
        AnalysisPhase::CollectingData,
        r"(?i)\b(reading|loading|gathering|collecting|scanning|looking at)\b",
    ),
    (
        AnalysisPhase::Analyzing,
        r"(?i)\b(analy[sz]ing|reviewing|evaluating|inspecting|examining|assessing)\b",
    ),
    (
        AnalysisPhase::ProcessingResults,
        r"(?i)(\bfindings\b|\bissues? (found|identified)\b|\bidentified \d+|^\s*(\d+\.|[-*])\s+\*\*)",
    ),
    (
        AnalysisPhase::GeneratingReport,
        r"(?i)\b(recommendations?|in summary|in conclusion|final (verdict|assessment|report))\b",
    ),
];

const MILESTONE_PATTERNS: &[(&str, &str)] = &[
    ("context_loaded", r"(?i)\b(read|loaded|reviewed the (file|code|document)|context)\b"),
    ("structure_reviewed", r"(?i)\b(structure|module|function|class|layout)\b"),
    ("issues_identified", r"(?i)\b(bug|issue|problem|defect|flaw|race)\b"),
    ("improvements_suggested", r"(?i)\b(suggest|improve|refactor|consider)\w*\b"),
    ("components_mapped", r"(?i)\b(component|service|layer|boundary|dependency)\b"),
    ("tradeoffs_evaluated", r"(?i)\b(trade-?offs?|versus|vs\.?|downside|cost)\b"),
    ("scalability_assessed", r"(?i)\b(scal\w+|throughput|latency|bottleneck)\b"),
    ("assumptions_challenged", r"(?i)\b(assum\w+|premise|presuppos\w+)\b"),
    ("risks_identified", r"(?i)\b(risk|fail\w*|threat|weakness)\b"),
    ("alternatives_proposed", r"(?i)\b(alternative|instead|simpler|option)\b"),
    ("attack_surface_mapped", r"(?i)\b(attack surface|entry point|input|endpoint|trust boundary)\b"),
    ("vulnerabilities_identified", r"(?i)\b(vulnerab\w+|injection|xss|csrf|cve|exploit\w*)\b"),
    ("mitigations_proposed", r"(?i)\b(mitigat\w+|sanitiz\w+|escape|validate|harden\w*)\b"),
    ("analysis_performed", r"(?i)\b(analy[sz]\w+|evaluat\w+|assess\w+)\b"),
    ("findings_compiled", r"(?i)\b(findings|summary|key (issues|points))\b"),
    ("report_ready", r"(?i)\b(recommendations?|conclusion|verdict)\b"),
];

fn build_builtin() -> PatternSet {
    let mut set = PatternSet::new(DEFAULT_PATTERNS_VERSION);
    for (phase, pattern) in PHASE_PATTERNS {
        if let Ok(re) = Regex::new(pattern) {
            set.phases.push((*phase, re));
        }
    }
    for (id, pattern) in MILESTONE_PATTERNS {
        if let Ok(re) = Regex::new(pattern) {
            set.milestones.entry((*id).to_string()).or_default().push(re);
        }
    }
    set
}
