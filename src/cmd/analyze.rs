//! Multi-engine analysis: `crossfire analyze`.

use anyhow::{Context, Result, bail};
use console::style;
use crossfire::analysis::AnalysisType;
use crossfire::config::Settings;
use crossfire::engines::EngineSelection;
use crossfire::orchestrator::{AnalysisRequest, AnalysisTarget, Orchestrator, SynthesizedReport, render_markdown};
use crossfire::ui::AnalysisUI;
use crossfire::ui::icons::CACHED;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Cli;

/// Arguments of the `analyze` subcommand, detached from clap.
#[derive(Debug, Clone)]
pub struct AnalyzeArgs {
    pub target: Option<PathBuf>,
    pub text: Option<String>,
    pub analysis: AnalysisType,
    pub engine: String,
    pub context: Option<String>,
    pub session: Option<String>,
    pub timeout_ms: Option<u64>,
    pub refresh: bool,
    pub json: bool,
}

pub async fn cmd_analyze(project_dir: &Path, cli: &Cli, args: AnalyzeArgs) -> Result<()> {
    let settings = Settings::resolve(project_dir)?;
    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }

    let target = load_target(project_dir, &args)?;
    let selection: EngineSelection = args.engine.parse()?;
    let session = args
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut request = AnalysisRequest::new(args.analysis, target, project_dir)
        .with_engines(selection)
        .with_session(session.clone())
        .with_refresh(args.refresh);
    if let Some(context) = &args.context {
        request = request.with_context(context.clone());
    }
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }

    let orchestrator = Orchestrator::from_settings(&settings);
    orchestrator.start_background_tasks();

    let title = args.analysis.title();
    let ui = if args.json {
        AnalysisUI::hidden(title)
    } else {
        AnalysisUI::new(title, cli.verbose)
    };
    let subscription = orchestrator.pipeline().open_session(&session, args.analysis);

    let (result, ()) = tokio::join!(
        async {
            let result = orchestrator.analyze(request).await;
            // Cache hits and engine resolution errors return before the
            // session is closed, which would leave the UI waiting.
            if orchestrator.pipeline().is_open(&session) {
                let error = result.as_ref().err().map(|e| e.user_message());
                orchestrator.pipeline().close_session(&session, error.as_deref());
            }
            result
        },
        ui.drive(subscription)
    );
    ui.finish();

    let report = match result {
        Ok(report) => report,
        Err(e) => bail!(e.user_message()),
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn load_target(project_dir: &Path, args: &AnalyzeArgs) -> Result<AnalysisTarget> {
    if let Some(text) = &args.text {
        if text.trim().is_empty() {
            bail!("Nothing to analyze: --text is empty");
        }
        return Ok(AnalysisTarget::inline(text.clone()));
    }
    let Some(path) = &args.target else {
        bail!("Provide a file to analyze or --text");
    };
    let resolved = if path.is_absolute() {
        path.clone()
    } else {
        project_dir.join(path)
    };
    let content = std::fs::read_to_string(&resolved)
        .with_context(|| format!("Failed to read {}", resolved.display()))?;
    Ok(AnalysisTarget::new(path.display().to_string(), content))
}

fn print_report(report: &SynthesizedReport) {
    if report.cached {
        eprintln!("{}{}", CACHED, style("served from cache (use --refresh to re-run)").dim());
    }
    if report.is_partial() {
        eprintln!(
            "{} {}",
            style("warning:").yellow().bold(),
            style(&report.summary).yellow()
        );
    }
    println!("{}", render_markdown(report));
}
