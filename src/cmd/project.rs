//! Project initialization command.

use anyhow::{Context, Result};
use std::path::Path;

use cotflow::config::CotflowToml;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let cotflow_dir = project_dir.join(".cotflow");
    let config_path = cotflow_dir.join("cotflow.toml");

    if config_path.exists() && !force {
        println!("cotflow.toml already exists at {}", config_path.display());
        println!("Use --force to overwrite it with the defaults.");
        return Ok(());
    }

    std::fs::create_dir_all(&cotflow_dir)
        .with_context(|| format!("Failed to create {}", cotflow_dir.display()))?;
    CotflowToml::default().save(&config_path)?;

    println!(
        "Initialized cotflow project at {}",
        console::style(cotflow_dir.display()).bold()
    );
    println!();
    println!("Created:");
    println!("  .cotflow/");
    println!("  └── cotflow.toml   # queue, recovery, collaborators and the pipeline phases");
    println!();
    println!("Next steps:");
    println!("  1. Export the API keys named by [reasoning] and [search] api_key_env");
    println!("  2. Run `cotflow create \"<topic>\"` to create a session");
    println!("  3. Run `cotflow run` to process sessions");

    Ok(())
}
