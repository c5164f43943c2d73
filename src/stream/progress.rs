//! Phase and milestone tracking for one analysis session.
//!
//! The state machine only knows about ordered phases and weighted
//! milestones with dependencies. What text moves it forward is decided by
//! the [`PatternSet`] it is given.

use super::patterns::PatternSet;
use super::{StreamEventType, StreamingEvent};
use crate::analysis::{AnalysisType, MilestoneSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ordered analysis phases. `Error` is terminal and sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    Initializing,
    CollectingData,
    Analyzing,
    ProcessingResults,
    GeneratingReport,
    Complete,
    Error,
}

impl AnalysisPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisPhase::Complete | AnalysisPhase::Error)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AnalysisPhase::Initializing => "Initializing",
            AnalysisPhase::CollectingData => "Collecting data",
            AnalysisPhase::Analyzing => "Analyzing",
            AnalysisPhase::ProcessingResults => "Processing results",
            AnalysisPhase::GeneratingReport => "Generating report",
            AnalysisPhase::Complete => "Complete",
            AnalysisPhase::Error => "Error",
        }
    }
}

impl std::fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Published to progress subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    MilestoneStarted {
        session_id: String,
        milestone: String,
    },
    MilestoneCompleted {
        session_id: String,
        milestone: String,
        progress: f64,
    },
    PhaseChanged {
        session_id: String,
        from: AnalysisPhase,
        to: AnalysisPhase,
    },
    ProgressUpdated {
        session_id: String,
        progress: f64,
        phase_progress: f64,
        estimated_completion: Option<DateTime<Utc>>,
    },
    AnalysisComplete {
        session_id: String,
        duration_ms: u64,
    },
    AnalysisError {
        session_id: String,
        error: String,
    },
}

/// Snapshot of a session's progress.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressState {
    pub session_id: String,
    pub analysis_type: Option<AnalysisType>,
    pub phase: AnalysisPhase,
    pub progress: f64,
    pub phase_progress: f64,
    pub completed: BTreeSet<String>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

pub struct ProgressTracker {
    state: ProgressState,
    milestones: Vec<MilestoneSpec>,
    started_milestones: BTreeSet<String>,
    patterns: Arc<PatternSet>,
    clock_start: Instant,
}

impl ProgressTracker {
    pub fn new(session_id: impl Into<String>, milestones: Vec<MilestoneSpec>, patterns: Arc<PatternSet>) -> Self {
        let now = Utc::now();
        Self {
            state: ProgressState {
                session_id: session_id.into(),
                analysis_type: None,
                phase: AnalysisPhase::Initializing,
                progress: 0.0,
                phase_progress: 0.0,
                completed: BTreeSet::new(),
                errors: Vec::new(),
                started_at: now,
                last_update: now,
                estimated_completion: None,
            },
            milestones,
            started_milestones: BTreeSet::new(),
            patterns,
            clock_start: Instant::now(),
        }
    }

    pub fn for_analysis(session_id: impl Into<String>, analysis: AnalysisType, patterns: Arc<PatternSet>) -> Self {
        let mut tracker = Self::new(session_id, analysis.milestones().to_vec(), patterns);
        tracker.state.analysis_type = Some(analysis);
        tracker
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn phase(&self) -> AnalysisPhase {
        self.state.phase
    }

    fn session(&self) -> String {
        self.state.session_id.clone()
    }

    /// Feed one published streaming event.
    pub fn observe(&mut self, event: &StreamingEvent) -> Vec<ProgressEvent> {
        match event.kind {
            StreamEventType::Error => self.record_error(&event.content),
            StreamEventType::Progress => self.observe_text(&event.content),
            StreamEventType::Start | StreamEventType::Complete => Vec::new(),
        }
    }

    /// Match `text` against phase indicators and milestone triggers.
    pub fn observe_text(&mut self, text: &str) -> Vec<ProgressEvent> {
        if self.state.phase.is_terminal() {
            return Vec::new();
        }
        let mut events = Vec::new();
        let before = self.state.progress;

        if let Some(phase) = self.patterns.detect_phase(text)
            && phase > self.state.phase
            && !phase.is_terminal()
        {
            self.enter_phase(phase, &mut events);
        } else if self.state.phase == AnalysisPhase::Initializing {
            // Any output at all means the engine is past start-up.
            self.enter_phase(AnalysisPhase::CollectingData, &mut events);
        }
        self.auto_complete(&mut events);

        let triggered: Vec<&'static str> = self
            .milestones
            .iter()
            .filter(|m| !self.state.completed.contains(m.id))
            .filter(|m| self.patterns.milestone_triggered(m.id, text))
            .map(|m| m.id)
            .collect();
        for id in triggered {
            if self.dependencies_met(id) {
                self.complete(id, &mut events);
            }
        }

        self.auto_complete(&mut events);
        self.finish_update(before, &mut events);
        events
    }

    /// Advance to `phase` if it is later than the current one.
    pub fn advance_to(&mut self, phase: AnalysisPhase) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        if self.state.phase.is_terminal() || phase <= self.state.phase || phase.is_terminal() {
            return events;
        }
        let before = self.state.progress;
        self.enter_phase(phase, &mut events);
        self.auto_complete(&mut events);
        self.finish_update(before, &mut events);
        events
    }

    /// Move to the terminal error phase and record `error`.
    pub fn record_error(&mut self, error: &str) -> Vec<ProgressEvent> {
        self.state.errors.push(error.to_string());
        self.state.last_update = Utc::now();
        if self.state.phase.is_terminal() {
            return Vec::new();
        }
        let from = self.state.phase;
        self.state.phase = AnalysisPhase::Error;
        self.state.estimated_completion = None;
        vec![
            ProgressEvent::PhaseChanged {
                session_id: self.session(),
                from,
                to: AnalysisPhase::Error,
            },
            ProgressEvent::AnalysisError {
                session_id: self.session(),
                error: error.to_string(),
            },
        ]
    }

    /// Complete every eligible milestone and set progress to 1.0.
    ///
    /// A tracker already in the error phase is left as it is. Milestones
    /// whose dependencies can never be met stay incomplete.
    pub fn mark_complete(&mut self) -> Vec<ProgressEvent> {
        if self.state.phase.is_terminal() {
            return Vec::new();
        }
        let mut events = Vec::new();
        let from = self.state.phase;
        self.state.phase = AnalysisPhase::Complete;
        events.push(ProgressEvent::PhaseChanged {
            session_id: self.session(),
            from,
            to: AnalysisPhase::Complete,
        });
        self.auto_complete(&mut events);
        self.state.progress = 1.0;
        self.state.phase_progress = 1.0;
        self.state.estimated_completion = Some(Utc::now());
        self.state.last_update = Utc::now();
        events.push(ProgressEvent::ProgressUpdated {
            session_id: self.session(),
            progress: 1.0,
            phase_progress: 1.0,
            estimated_completion: self.state.estimated_completion,
        });
        events.push(ProgressEvent::AnalysisComplete {
            session_id: self.session(),
            duration_ms: self.clock_start.elapsed().as_millis() as u64,
        });
        events
    }

    fn enter_phase(&mut self, phase: AnalysisPhase, events: &mut Vec<ProgressEvent>) {
        let from = self.state.phase;
        self.state.phase = phase;
        events.push(ProgressEvent::PhaseChanged {
            session_id: self.session(),
            from,
            to: phase,
        });
        let starting: Vec<&'static str> = self
            .milestones
            .iter()
            .filter(|m| m.phase == phase && !self.state.completed.contains(m.id))
            .map(|m| m.id)
            .collect();
        for id in starting {
            if self.started_milestones.insert(id.to_string()) {
                events.push(ProgressEvent::MilestoneStarted {
                    session_id: self.session(),
                    milestone: id.to_string(),
                });
            }
        }
    }

    fn spec(&self, id: &str) -> Option<&MilestoneSpec> {
        self.milestones.iter().find(|m| m.id == id)
    }

    /// A dependency is met once completed, or when it is skippable and its
    /// phase is already behind the tracker.
    fn dependencies_met(&self, id: &str) -> bool {
        let Some(spec) = self.spec(id) else {
            return false;
        };
        spec.depends_on.iter().all(|dep| {
            self.state.completed.contains(*dep)
                || self
                    .spec(dep)
                    .is_some_and(|d| d.skippable && d.phase < self.state.phase)
        })
    }

    /// Complete milestones from earlier phases until nothing changes.
    fn auto_complete(&mut self, events: &mut Vec<ProgressEvent>) {
        loop {
            let eligible: Option<&'static str> = self
                .milestones
                .iter()
                .filter(|m| !self.state.completed.contains(m.id))
                .filter(|m| m.phase < self.state.phase)
                .map(|m| m.id)
                .find(|id| self.dependencies_met(id));
            match eligible {
                Some(id) => self.complete(id, events),
                None => break,
            }
        }
    }

    fn complete(&mut self, id: &str, events: &mut Vec<ProgressEvent>) {
        if !self.state.completed.insert(id.to_string()) {
            return;
        }
        self.recompute();
        events.push(ProgressEvent::MilestoneCompleted {
            session_id: self.session(),
            milestone: id.to_string(),
            progress: self.state.progress,
        });
    }

    fn recompute(&mut self) {
        let total: f64 = self.milestones.iter().map(|m| m.weight).sum();
        let done: f64 = self
            .milestones
            .iter()
            .filter(|m| self.state.completed.contains(m.id))
            .map(|m| m.weight)
            .sum();
        let all_done = self
            .milestones
            .iter()
            .all(|m| self.state.completed.contains(m.id));
        self.state.progress = if all_done {
            1.0
        } else if total > 0.0 {
            (done / total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let phase = self.state.phase;
        let in_phase: Vec<&MilestoneSpec> = self.milestones.iter().filter(|m| m.phase == phase).collect();
        let phase_total: f64 = in_phase.iter().map(|m| m.weight).sum();
        let phase_done: f64 = in_phase
            .iter()
            .filter(|m| self.state.completed.contains(m.id))
            .map(|m| m.weight)
            .sum();
        self.state.phase_progress = if phase_total > 0.0 {
            (phase_done / phase_total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.state.estimated_completion =
            estimate_completion(self.clock_start.elapsed(), self.state.progress, Utc::now());
    }

    fn finish_update(&mut self, before: f64, events: &mut Vec<ProgressEvent>) {
        self.recompute();
        self.state.last_update = Utc::now();
        if (self.state.progress - before).abs() > f64::EPSILON || !events.is_empty() {
            events.push(ProgressEvent::ProgressUpdated {
                session_id: self.session(),
                progress: self.state.progress,
                phase_progress: self.state.phase_progress,
                estimated_completion: self.state.estimated_completion,
            });
        }
    }
}

/// Linear extrapolation: if `progress` took `elapsed`, the rest takes
/// `elapsed * (1 - progress) / progress`.
pub fn estimate_completion(elapsed: Duration, progress: f64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if progress <= 0.0 {
        return None;
    }
    if progress >= 1.0 {
        return Some(now);
    }
    let remaining = elapsed.as_secs_f64() * (1.0 - progress) / progress;
    let remaining = chrono::Duration::milliseconds((remaining * 1000.0) as i64);
    Some(now + remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::MilestoneSpec;

    const A: MilestoneSpec = MilestoneSpec {
        id: "a",
        name: "A",
        phase: AnalysisPhase::CollectingData,
        weight: 0.25,
        depends_on: &[],
        skippable: false,
    };
    const B: MilestoneSpec = MilestoneSpec {
        id: "b",
        name: "B",
        phase: AnalysisPhase::Analyzing,
        weight: 0.25,
        depends_on: &["a"],
        skippable: true,
    };
    const C: MilestoneSpec = MilestoneSpec {
        id: "c",
        name: "C",
        phase: AnalysisPhase::Analyzing,
        weight: 0.5,
        depends_on: &["b"],
        skippable: false,
    };

    fn patterns() -> Arc<PatternSet> {
        Arc::new(
            PatternSet::new("test")
                .with_phase(AnalysisPhase::CollectingData, "READ")
                .unwrap()
                .with_phase(AnalysisPhase::Analyzing, "THINK")
                .unwrap()
                .with_phase(AnalysisPhase::GeneratingReport, "WRITE")
                .unwrap()
                .with_milestone("a", "got-a")
                .unwrap()
                .with_milestone("b", "got-b")
                .unwrap()
                .with_milestone("c", "got-c")
                .unwrap(),
        )
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new("s1", vec![A, B, C], patterns())
    }

    #[test]
    fn test_pattern_completes_milestone_and_updates_progress() {
        let mut t = tracker();
        let events = t.observe_text("READ got-a");
        assert_eq!(t.phase(), AnalysisPhase::CollectingData);
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::MilestoneCompleted { milestone, .. } if milestone == "a")));
        assert_eq!(t.state().progress, 0.25);
    }

    #[test]
    fn test_unmet_dependency_blocks_pattern_match() {
        let mut t = tracker();
        t.observe_text("READ got-c");
        assert!(!t.state().completed.contains("c"));
        assert_eq!(t.state().progress, 0.0);
    }

    #[test]
    fn test_phase_never_moves_backwards() {
        let mut t = tracker();
        t.observe_text("THINK");
        assert_eq!(t.phase(), AnalysisPhase::Analyzing);
        t.observe_text("READ");
        assert_eq!(t.phase(), AnalysisPhase::Analyzing);
    }

    #[test]
    fn test_earlier_phase_milestones_auto_complete() {
        let mut t = tracker();
        t.observe_text("THINK");
        // a is from an earlier phase, so it completes without a match
        assert!(t.state().completed.contains("a"));
        assert!(!t.state().completed.contains("b"));

        t.observe_text("WRITE");
        assert_eq!(t.phase(), AnalysisPhase::GeneratingReport);
        assert_eq!(t.state().progress, 1.0);
    }

    #[test]
    fn test_first_output_leaves_initializing() {
        let mut t = tracker();
        let events = t.observe_text("hello");
        assert_eq!(t.phase(), AnalysisPhase::CollectingData);
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::MilestoneStarted { milestone, .. } if milestone == "a")));
    }

    #[test]
    fn test_mark_complete_reaches_exactly_one() {
        let milestones: Vec<MilestoneSpec> = AnalysisType::Code.milestones().to_vec();
        let mut t = ProgressTracker::new("s1", milestones, PatternSet::builtin());
        t.observe_text("Reading the code");
        let events = t.mark_complete();
        assert_eq!(t.state().progress, 1.0);
        assert_eq!(t.state().completed.len(), AnalysisType::Code.milestones().len());
        assert!(matches!(events.last(), Some(ProgressEvent::AnalysisComplete { .. })));
        assert!(t.mark_complete().is_empty());
    }

    #[test]
    fn test_error_is_terminal() {
        let mut t = tracker();
        t.observe_text("READ got-a");
        let events = t.record_error("engine crashed");
        assert_eq!(t.phase(), AnalysisPhase::Error);
        assert!(matches!(events.last(), Some(ProgressEvent::AnalysisError { .. })));
        assert!(t.observe_text("THINK got-b").is_empty());
        assert_eq!(t.state().errors, vec!["engine crashed".to_string()]);
    }

    #[test]
    fn test_mark_complete_after_error_leaves_error_phase() {
        let mut t = tracker();
        t.observe_text("READ got-a");
        t.record_error("engine crashed");
        assert!(t.mark_complete().is_empty());
        assert_eq!(t.phase(), AnalysisPhase::Error);
        assert_eq!(t.state().progress, 0.25);
        assert!(!t.state().completed.contains("b"));
    }

    #[test]
    fn test_mark_complete_skips_milestones_with_unmet_dependencies() {
        const D: MilestoneSpec = MilestoneSpec {
            id: "d",
            name: "D",
            phase: AnalysisPhase::Analyzing,
            weight: 0.5,
            depends_on: &["missing"],
            skippable: false,
        };
        let mut t = ProgressTracker::new("s1", vec![A, D], patterns());
        let events = t.mark_complete();
        assert!(t.state().completed.contains("a"));
        assert!(!t.state().completed.contains("d"));
        assert!(!events.iter().any(|e| matches!(e, ProgressEvent::MilestoneCompleted { milestone, .. } if milestone == "d")));
        assert_eq!(t.phase(), AnalysisPhase::Complete);
        assert_eq!(t.state().progress, 1.0);
        assert!(matches!(events.last(), Some(ProgressEvent::AnalysisComplete { .. })));
    }

    #[test]
    fn test_observe_routes_error_events() {
        let mut t = tracker();
        let event = StreamingEvent::new(StreamEventType::Error, "codex", "quota", "s1");
        t.observe(&event);
        assert_eq!(t.phase(), AnalysisPhase::Error);
    }

    #[test]
    fn test_estimate_completion_is_linear() {
        let now = Utc::now();
        let eta = estimate_completion(Duration::from_secs(10), 0.25, now).unwrap();
        assert_eq!((eta - now).num_seconds(), 30);
        assert!(estimate_completion(Duration::from_secs(10), 0.0, now).is_none());
    }
}
