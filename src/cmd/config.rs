//! Configuration view and validation commands: `billing-automation config`.

use std::path::Path;

use anyhow::{Context, Result};

use billing_automation::config::AutomationToml;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    effective: &AutomationToml,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("# Effective values (with env overrides)");
            println!();
            let rendered =
                toml::to_string_pretty(effective).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No automation.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = AutomationToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                return Ok(());
            }
            AutomationToml::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
