//! Health and recovery commands.

use anyhow::Result;
use cotflow::config::CotflowConfig;
use cotflow::recovery::RecoveryAction;

use super::super::Cli;
use super::{open, print_json, styled_status};

pub async fn cmd_health(config: &CotflowConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let orch = open(config)?;
    let report = orch.check_health(session_id).await?;

    if cli.json {
        return print_json(&report);
    }

    println!();
    println!(
        "Session {} is {} at {}",
        report.session_id,
        styled_status(report.status),
        report.cursor
    );
    if report.healthy {
        println!("{}", console::style("Healthy").green());
        println!();
        return Ok(());
    }

    println!("{}", console::style("Issues").yellow().bold());
    for issue in &report.issues {
        println!("  - {}", issue);
    }
    if !report.recommendations.is_empty() {
        println!();
        println!("Recommendations");
        for decision in &report.recommendations {
            println!("  - {}", decision);
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_recover(
    config: &CotflowConfig,
    cli: &Cli,
    session_id: &str,
    action: Option<&str>,
) -> Result<()> {
    let action = action
        .map(|a| a.parse::<RecoveryAction>().map_err(anyhow::Error::msg))
        .transpose()?;

    let orch = open(config)?;
    let applied = orch.trigger_recovery(session_id, action).await?;

    if cli.json {
        return print_json(&applied);
    }
    match applied {
        None => println!("Session {} needs no recovery.", session_id),
        Some(applied) => {
            println!(
                "{} to {}: {}",
                console::style("Applied").green(),
                applied.session_id,
                applied.decision
            );
            if applied.active_session_id() != applied.session_id {
                println!("  Replacement session: {}", applied.active_session_id());
            }
            println!(
                "  Now {} at {}",
                styled_status(applied.session.status),
                applied.session.cursor
            );
        }
    }
    Ok(())
}
