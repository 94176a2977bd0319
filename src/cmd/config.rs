//! Configuration view and validation commands (`cotflow config`).

use anyhow::{Context, Result};
use cotflow::config::CotflowConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &CotflowConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("cotflow Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No cotflow.toml found at {}, using defaults.", config_path.display());
            }
            println!("Database:    {}", config.db_path().display());
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            let text = toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", text);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No cotflow.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
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
    }

    Ok(())
}
