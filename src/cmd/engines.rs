//! Engine availability and health: `crossfire engines`.

use anyhow::{Context, Result};
use console::style;
use crossfire::config::Settings;
use crossfire::engines::{EngineInvoker, PromptDelivery};
use crossfire::ui::icons::{CHECK, CROSS};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct EngineRow {
    id: String,
    name: String,
    command: String,
    delivery: PromptDelivery,
    available: bool,
    host: bool,
    breaker: String,
}

pub async fn cmd_engines(project_dir: &Path, json: bool) -> Result<()> {
    let settings = Settings::resolve(project_dir)?;
    let invoker = EngineInvoker::new(
        Arc::new(settings.engine_registry()),
        settings.runner(),
        settings.gate(),
        settings.breaker_config(),
    );
    let registry = invoker.registry();
    let available = registry.available(invoker.runner()).await;
    let host = settings.engines.host_engine.as_deref();

    let rows: Vec<EngineRow> = registry
        .specs()
        .map(|spec| EngineRow {
            id: spec.id.clone(),
            name: spec.display_name.clone(),
            command: spec.display_command(),
            delivery: spec.delivery,
            available: available.contains(&spec.id),
            host: host == Some(spec.id.as_str()),
            breaker: invoker.breaker(&spec.id).state().to_string(),
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("Failed to serialize engine list")?
        );
        return Ok(());
    }

    println!();
    println!("Engines");
    println!("=======");
    println!();
    if rows.is_empty() {
        println!("No engines enabled. Check [engines] enabled in crossfire.toml.");
        println!();
        return Ok(());
    }
    for row in &rows {
        let status = if row.available {
            format!("{}{}", CHECK, style("available").green())
        } else {
            format!("{}{}", CROSS, style("not found").red())
        };
        let host_note = if row.host {
            style(" (host, skipped for \"all\")").dim().to_string()
        } else {
            String::new()
        };
        println!("{} {}{}", style(&row.id).bold(), status, host_note);
        println!("    name     = {}", row.name);
        println!("    command  = {}", row.command);
        println!("    breaker  = {}", row.breaker);
    }
    println!();
    println!("{} of {} engine(s) available", available.len(), rows.len());
    println!();
    Ok(())
}
