//! Service and single-session driving commands.

use anyhow::Result;
use cotflow::config::CotflowConfig;
use cotflow::executor::StepOutcome;
use tokio::sync::watch;
use tracing::{error, info};

use super::super::Cli;
use super::{open, print_json, styled_status};

/// Serve until Ctrl-C. In-flight tasks finish before the command returns.
pub async fn cmd_run(config: &CotflowConfig) -> Result<()> {
    let orch = open(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        shutdown_tx.send_replace(true);
    });

    println!(
        "cotflow running (database {}, {} workers). Press Ctrl-C to stop.",
        config.db_path().display(),
        config.toml.queue.concurrency
    );
    orch.serve(shutdown_rx).await?;
    println!("Stopped.");
    Ok(())
}

pub async fn cmd_drive(config: &CotflowConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let orch = open(config)?;
    let driven = orch.run_session_to_end(session_id).await?;
    let view = orch.get_session_status(&driven.session_id).await?;

    if cli.json {
        return print_json(&view);
    }
    if driven.session_id != session_id {
        println!("Session {} was restarted as {}", session_id, driven.session_id);
    }
    match &driven.outcome {
        StepOutcome::Completed => println!(
            "{} {}",
            console::style("Completed").green().bold(),
            driven.session_id
        ),
        StepOutcome::Halted { reason } => {
            println!(
                "{} {} at {}: {}",
                console::style("Halted").red().bold(),
                driven.session_id,
                view.session.cursor,
                reason
            );
            println!("Run `cotflow health {}` for recommendations.", driven.session_id);
        }
        other => println!("Stopped with {:?}", other),
    }
    println!("  Status: {}", styled_status(view.session.status));
    Ok(())
}
