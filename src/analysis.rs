//! Analysis types and their declared milestone sets.

use crate::stream::AnalysisPhase;
use serde::{Deserialize, Serialize};

/// What kind of artifact is being critiqued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Code,
    Architecture,
    Idea,
    Security,
    General,
}

impl std::fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code" => Ok(AnalysisType::Code),
            "architecture" | "arch" => Ok(AnalysisType::Architecture),
            "idea" => Ok(AnalysisType::Idea),
            "security" | "sec" => Ok(AnalysisType::Security),
            "general" => Ok(AnalysisType::General),
            other => Err(format!("unknown analysis type '{}'", other)),
        }
    }
}

/// A weighted sub-step of an analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MilestoneSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub phase: AnalysisPhase,
    pub weight: f64,
    pub depends_on: &'static [&'static str],
    /// Does not block dependents once its phase is behind the tracker.
    pub skippable: bool,
}

const fn milestone(
    id: &'static str,
    name: &'static str,
    phase: AnalysisPhase,
    weight: f64,
    depends_on: &'static [&'static str],
    skippable: bool,
) -> MilestoneSpec {
    MilestoneSpec {
        id,
        name,
        phase,
        weight,
        depends_on,
        skippable,
    }
}

use AnalysisPhase::{Analyzing, CollectingData, GeneratingReport, ProcessingResults};

const CODE_MILESTONES: &[MilestoneSpec] = &[
    milestone("context_loaded", "Context loaded", CollectingData, 0.10, &[], false),
    milestone("structure_reviewed", "Structure reviewed", Analyzing, 0.20, &["context_loaded"], false),
    milestone("issues_identified", "Issues identified", Analyzing, 0.25, &["structure_reviewed"], false),
    milestone("improvements_suggested", "Improvements suggested", ProcessingResults, 0.15, &["issues_identified"], true),
    milestone("findings_compiled", "Findings compiled", ProcessingResults, 0.15, &["issues_identified"], false),
    milestone("report_ready", "Report ready", GeneratingReport, 0.15, &["findings_compiled"], false),
];

const ARCHITECTURE_MILESTONES: &[MilestoneSpec] = &[
    milestone("context_loaded", "Context loaded", CollectingData, 0.10, &[], false),
    milestone("components_mapped", "Components mapped", Analyzing, 0.20, &["context_loaded"], false),
    milestone("tradeoffs_evaluated", "Trade-offs evaluated", Analyzing, 0.25, &["components_mapped"], false),
    milestone("scalability_assessed", "Scalability assessed", Analyzing, 0.15, &["components_mapped"], true),
    milestone("findings_compiled", "Findings compiled", ProcessingResults, 0.15, &["tradeoffs_evaluated"], false),
    milestone("report_ready", "Report ready", GeneratingReport, 0.15, &["findings_compiled"], false),
];

const IDEA_MILESTONES: &[MilestoneSpec] = &[
    milestone("context_loaded", "Context loaded", CollectingData, 0.10, &[], false),
    milestone("assumptions_challenged", "Assumptions challenged", Analyzing, 0.25, &["context_loaded"], false),
    milestone("risks_identified", "Risks identified", Analyzing, 0.20, &["assumptions_challenged"], false),
    milestone("alternatives_proposed", "Alternatives proposed", ProcessingResults, 0.15, &["risks_identified"], true),
    milestone("findings_compiled", "Findings compiled", ProcessingResults, 0.15, &["risks_identified"], false),
    milestone("report_ready", "Report ready", GeneratingReport, 0.15, &["findings_compiled"], false),
];

const SECURITY_MILESTONES: &[MilestoneSpec] = &[
    milestone("context_loaded", "Context loaded", CollectingData, 0.10, &[], false),
    milestone("attack_surface_mapped", "Attack surface mapped", Analyzing, 0.20, &["context_loaded"], false),
    milestone("vulnerabilities_identified", "Vulnerabilities identified", Analyzing, 0.25, &["attack_surface_mapped"], false),
    milestone("mitigations_proposed", "Mitigations proposed", ProcessingResults, 0.15, &["vulnerabilities_identified"], true),
    milestone("findings_compiled", "Findings compiled", ProcessingResults, 0.15, &["vulnerabilities_identified"], false),
    milestone("report_ready", "Report ready", GeneratingReport, 0.15, &["findings_compiled"], false),
];

const GENERAL_MILESTONES: &[MilestoneSpec] = &[
    milestone("context_loaded", "Context loaded", CollectingData, 0.15, &[], false),
    milestone("analysis_performed", "Analysis performed", Analyzing, 0.40, &["context_loaded"], false),
    milestone("findings_compiled", "Findings compiled", ProcessingResults, 0.25, &["analysis_performed"], false),
    milestone("report_ready", "Report ready", GeneratingReport, 0.20, &["findings_compiled"], false),
];

impl AnalysisType {
    pub const ALL: [AnalysisType; 5] = [
        AnalysisType::Code,
        AnalysisType::Architecture,
        AnalysisType::Idea,
        AnalysisType::Security,
        AnalysisType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Code => "code",
            AnalysisType::Architecture => "architecture",
            AnalysisType::Idea => "idea",
            AnalysisType::Security => "security",
            AnalysisType::General => "general",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AnalysisType::Code => "Code Review",
            AnalysisType::Architecture => "Architecture Review",
            AnalysisType::Idea => "Idea Critique",
            AnalysisType::Security => "Security Review",
            AnalysisType::General => "General Critique",
        }
    }

    pub fn milestones(&self) -> &'static [MilestoneSpec] {
        match self {
            AnalysisType::Code => CODE_MILESTONES,
            AnalysisType::Architecture => ARCHITECTURE_MILESTONES,
            AnalysisType::Idea => IDEA_MILESTONES,
            AnalysisType::Security => SECURITY_MILESTONES,
            AnalysisType::General => GENERAL_MILESTONES,
        }
    }

    /// What the engines are asked to concentrate on.
    pub fn focus_areas(&self) -> &'static [&'static str] {
        match self {
            AnalysisType::Code => &[
                "correctness bugs and unhandled edge cases",
                "concurrency and resource leaks",
                "error handling gaps",
                "maintainability and unnecessary complexity",
            ],
            AnalysisType::Architecture => &[
                "coupling and boundaries between components",
                "failure modes and single points of failure",
                "scalability limits",
                "operational complexity",
            ],
            AnalysisType::Idea => &[
                "hidden assumptions",
                "reasons this could fail",
                "cheaper or simpler alternatives",
                "what evidence would change the conclusion",
            ],
            AnalysisType::Security => &[
                "injection and input validation",
                "authentication and authorization flaws",
                "secret handling and data exposure",
                "unsafe defaults and privilege boundaries",
            ],
            AnalysisType::General => &[
                "weakest points of the argument or design",
                "risks and unintended consequences",
                "concrete improvements",
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestone_weights_sum_to_one() {
        for kind in AnalysisType::ALL {
            let total: f64 = kind.milestones().iter().map(|m| m.weight).sum();
            assert!((total - 1.0).abs() < 1e-9, "{} sums to {}", kind, total);
        }
    }

    #[test]
    fn test_dependencies_reference_declared_milestones() {
        for kind in AnalysisType::ALL {
            let ids: Vec<&str> = kind.milestones().iter().map(|m| m.id).collect();
            for m in kind.milestones() {
                for dep in m.depends_on {
                    assert!(ids.contains(dep), "{}: {} depends on unknown {}", kind, m.id, dep);
                }
            }
        }
    }

    #[test]
    fn test_parse_round_trips_display() {
        for kind in AnalysisType::ALL {
            assert_eq!(kind.to_string().parse::<AnalysisType>().unwrap(), kind);
        }
        assert_eq!("ARCH".parse::<AnalysisType>().unwrap(), AnalysisType::Architecture);
        assert!("poetry".parse::<AnalysisType>().is_err());
    }
}
