use crate::stream::{
    AnalysisPhase, ProgressEvent, StreamEventType, StreamingEvent, SYSTEM_ENGINE,
    pipeline::SessionSubscription,
};
use crate::ui::icons::{CHECK, CROSS, ENGINE, MILESTONE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Longest snippet of engine output shown on a spinner line.
const SNIPPET_CHARS: usize = 60;

/// Terminal progress for one analysis session, rendered via `indicatif`.
///
/// One bar tracks overall progress and phase; each engine gets its own
/// spinner once its start event arrives. Everything draws to stderr.
pub struct AnalysisUI {
    multi: MultiProgress,
    overall: ProgressBar,
    engines: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
}

impl AnalysisUI {
    pub fn new(title: &str, verbose: bool) -> Self {
        Self::with_target(title, verbose, ProgressDrawTarget::stderr())
    }

    /// A UI that tracks state but draws nothing.
    pub fn hidden(title: &str) -> Self {
        Self::with_target(title, false, ProgressDrawTarget::hidden())
    }

    fn with_target(title: &str, verbose: bool, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let overall_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let overall = multi.add(ProgressBar::new(100));
        overall.set_style(overall_style);
        overall.set_prefix(title.to_string());
        overall.set_message(style(AnalysisPhase::Initializing.label()).dim().to_string());

        Self {
            multi,
            overall,
            engines: Mutex::new(HashMap::new()),
            verbose,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn engine_bar(&self, engine: &str) -> ProgressBar {
        let mut engines = self.engines.lock().unwrap_or_else(|p| p.into_inner());
        engines
            .entry(engine.to_string())
            .or_insert_with(|| {
                let spinner_style = ProgressStyle::default_spinner()
                    .template("{prefix:>10.bold} {spinner} {msg}")
                    .expect("progress bar template is a valid static string");
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(spinner_style);
                bar.set_prefix(engine.to_string());
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            })
            .clone()
    }

    /// Current overall progress in percent.
    pub fn percent(&self) -> u64 {
        self.overall.position()
    }

    pub fn handle_stream(&self, event: &StreamingEvent) {
        if event.engine == SYSTEM_ENGINE {
            return;
        }
        let bar = self.engine_bar(&event.engine);
        match event.kind {
            StreamEventType::Start => {
                bar.set_message(format!("{}{}", ENGINE, style("running").dim()));
            }
            StreamEventType::Progress => {
                bar.set_message(style(snippet(&event.content)).dim().to_string());
                if self.verbose {
                    self.print_line(format!(
                        "  {} {}",
                        style(&event.engine).cyan(),
                        style(snippet(&event.content)).dim()
                    ));
                }
            }
            StreamEventType::Complete => {
                bar.finish_with_message(format!("{}{}", CHECK, style("done").green()));
            }
            StreamEventType::Error => {
                bar.finish_with_message(format!("{}{}", CROSS, style(snippet(&event.content)).red()));
            }
        }
    }

    pub fn handle_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ProgressUpdated { progress, .. }
            | ProgressEvent::MilestoneCompleted { progress, .. } => {
                self.overall.set_position((progress.clamp(0.0, 1.0) * 100.0).round() as u64);
            }
            ProgressEvent::PhaseChanged { to, .. } => {
                self.overall.set_message(style(to.label()).dim().to_string());
            }
            ProgressEvent::MilestoneStarted { milestone, .. } => {
                if self.verbose {
                    self.print_line(format!("  {}{}", MILESTONE, style(milestone).dim()));
                }
            }
            ProgressEvent::AnalysisComplete { duration_ms, .. } => {
                self.overall.set_position(100);
                self.overall.finish_with_message(format!(
                    "{}{}",
                    CHECK,
                    style(format!("complete in {:.1}s", *duration_ms as f64 / 1000.0)).green()
                ));
            }
            ProgressEvent::AnalysisError { error, .. } => {
                self.overall
                    .abandon_with_message(format!("{}{}", CROSS, style(error).red()));
            }
        }
    }

    /// Render events until the session closes both channels.
    pub async fn drive(&self, mut subscription: SessionSubscription) {
        let mut events_open = true;
        let mut progress_open = true;
        while events_open || progress_open {
            tokio::select! {
                event = subscription.events.recv(), if events_open => match event {
                    Ok(event) => self.handle_stream(&event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => events_open = false,
                },
                event = subscription.progress.recv(), if progress_open => match event {
                    Ok(event) => self.handle_progress(&event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => progress_open = false,
                },
            }
        }
    }

    /// Stop every spinner that is still running.
    pub fn finish(&self) {
        for bar in self
            .engines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
        {
            if !bar.is_finished() {
                bar.finish_and_clear();
            }
        }
        if !self.overall.is_finished() {
            self.overall.finish_and_clear();
        }
    }
}

/// First line of `text`, cut to a terminal-friendly length.
fn snippet(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() > SNIPPET_CHARS {
        let cut: String = line.chars().take(SNIPPET_CHARS - 3).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}
