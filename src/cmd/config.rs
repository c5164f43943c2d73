//! Configuration view and validation commands: `crossfire config`.

use anyhow::{Context, Result};
use crossfire::config::{CONFIG_DIR, CONFIG_FILE, Settings};
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let project_config = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Crossfire Configuration");
            println!("=======================");
            println!();

            match Settings::locate(project_dir) {
                Some(path) => println!("Config file: {}", path.display()),
                None => {
                    println!("No crossfire.toml found. Using defaults.");
                    println!("Run 'crossfire config init' to create one.");
                }
            }
            println!();

            // Effective values include CROSSFIRE_* and .env overrides.
            let settings = Settings::resolve(project_dir)?;
            let rendered =
                toml::to_string_pretty(&settings).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let settings = Settings::resolve(project_dir)?;
            let warnings = settings.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if project_config.exists() {
                println!("crossfire.toml already exists at {}", project_config.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            Settings::default().save(&project_config)?;

            println!("Created crossfire.toml at {}", project_config.display());
            println!();
            println!("You can now customize:");
            println!("  - [execution] default_timeout_ms, max_concurrent, max_memory_mb");
            println!("  - [breaker] failure_threshold, recovery_timeout_ms");
            println!("  - [engines] enabled, host_engine, and [engines.commands]");
            println!();
        }
    }

    Ok(())
}
