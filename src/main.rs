use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossfire::analysis::AnalysisType;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "crossfire")]
#[command(version, about = "Cross-check code and ideas with several AI engines at once")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an analysis across the available engines
    Analyze {
        /// File to analyze
        #[arg(required_unless_present = "text", conflicts_with = "text")]
        target: Option<PathBuf>,

        /// Analyze inline text instead of a file
        #[arg(long)]
        text: Option<String>,

        #[arg(short = 't', long = "type", value_enum, default_value = "general")]
        analysis: AnalysisType,

        /// Engine id, or "all" for every available engine
        #[arg(short, long, default_value = "all")]
        engine: String,

        /// Extra context passed along with the target
        #[arg(long)]
        context: Option<String>,

        /// Session id used for progress and cache ownership
        #[arg(long)]
        session: Option<String>,

        /// Per-engine timeout, overriding configuration
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Ignore any cached report and run again
        #[arg(long)]
        refresh: bool,

        /// Print the report as JSON instead of Markdown
        #[arg(long)]
        json: bool,
    },
    /// Show configured engines, availability and breaker state
    Engines {
        #[arg(long)]
        json: bool,
    },
    /// View and manage configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and report warnings
    Validate,
    /// Write a default crossfire.toml into the project
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    crossfire::logging::init(cli.verbose, cli.json_logs);

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Analyze {
            target,
            text,
            analysis,
            engine,
            context,
            session,
            timeout_ms,
            refresh,
            json,
        } => {
            let args = cmd::AnalyzeArgs {
                target: target.clone(),
                text: text.clone(),
                analysis: *analysis,
                engine: engine.clone(),
                context: context.clone(),
                session: session.clone(),
                timeout_ms: *timeout_ms,
                refresh: *refresh,
                json: *json,
            };
            cmd::cmd_analyze(&project_dir, &cli, args).await?;
        }
        Commands::Engines { json } => cmd::cmd_engines(&project_dir, *json).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
