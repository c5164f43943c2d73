//! Prompt construction for critique engines.
//!
//! The template layer is swappable: the façade only depends on
//! [`PromptBuilder`].

use crate::analysis::AnalysisType;
use serde::{Deserialize, Serialize};

/// The artifact under analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisTarget {
    /// Short label for reports, e.g. a file name or "inline text".
    pub label: String,
    pub content: String,
}

impl AnalysisTarget {
    pub fn new(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
        }
    }

    pub fn inline(content: impl Into<String>) -> Self {
        Self::new("inline text", content)
    }
}

/// Builds the two halves of an engine prompt.
pub trait PromptBuilder: Send + Sync {
    /// Role and ground rules, shared by every engine in a fan-out.
    fn system_prompt(&self, analysis: AnalysisType) -> String;

    /// The task itself.
    fn user_prompt(&self, analysis: AnalysisType, target: &AnalysisTarget, context: Option<&str>) -> String;
}

/// Plain Markdown prompts listing the analysis type's focus areas.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPromptBuilder;

impl PromptBuilder for DefaultPromptBuilder {
    fn system_prompt(&self, analysis: AnalysisType) -> String {
        format!(
            "You are an adversarial reviewer performing a {title}. \
             Your job is to find what is wrong, risky, or missing, not to praise. \
             Be specific and concrete. If something is fine, say so briefly and move on.",
            title = analysis.title().to_lowercase()
        )
    }

    fn user_prompt(&self, analysis: AnalysisType, target: &AnalysisTarget, context: Option<&str>) -> String {
        let focus_list = analysis
            .focus_areas()
            .iter()
            .map(|area| format!("- {}", area))
            .collect::<Vec<_>>()
            .join("\n");

        let context_section = context
            .filter(|c| !c.trim().is_empty())
            .map(|c| format!("\n## Additional Context\n{}\n", c.trim()))
            .unwrap_or_default();

        format!(
            r#"# {title}: {label}
{context_section}
## Focus Areas

Examine the target for these specific concerns:
{focus_list}

## Instructions

1. Work through the focus areas in order
2. For each problem found, say where it is, why it matters, and what to do instead
3. Rank problems from most to least severe
4. Finish with a one-paragraph verdict

## Target

```
{content}
```
"#,
            title = analysis.title(),
            label = target.label,
            content = target.content,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_prompt_lists_focus_areas_and_target() {
        let target = AnalysisTarget::new("lib.rs", "fn main() {}");
        let prompt = DefaultPromptBuilder.user_prompt(AnalysisType::Code, &target, None);
        assert!(prompt.starts_with("# Code Review: lib.rs"));
        for area in AnalysisType::Code.focus_areas() {
            assert!(prompt.contains(&format!("- {}", area)));
        }
        assert!(prompt.contains("fn main() {}"));
        assert!(!prompt.contains("Additional Context"));
    }

    #[test]
    fn test_context_section_only_when_non_blank() {
        let target = AnalysisTarget::inline("ship it");
        let with = DefaultPromptBuilder.user_prompt(AnalysisType::Idea, &target, Some("  budget is tight "));
        assert!(with.contains("## Additional Context\nbudget is tight\n"));
        let blank = DefaultPromptBuilder.user_prompt(AnalysisType::Idea, &target, Some("   "));
        assert!(!blank.contains("Additional Context"));
    }

    #[test]
    fn test_system_prompt_names_analysis() {
        let system = DefaultPromptBuilder.system_prompt(AnalysisType::Security);
        assert!(system.contains("security review"));
    }
}
