//! Session creation and inspection commands.

use anyhow::{Context, Result};
use cotflow::config::CotflowConfig;
use cotflow_common::{SessionConfig, SessionStatus, Step, TaskSummary};

use super::super::Cli;
use super::{open, print_json, styled_status};

/// Split `KEY=VALUE` pairs into the session's extra config.
fn parse_extra(pairs: &[String]) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut extra = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --extra '{}': expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid --extra '{}': empty key", pair);
        }
        extra.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    }
    Ok(extra)
}

pub async fn cmd_create(
    config: &CotflowConfig,
    cli: &Cli,
    topic: &str,
    style: &str,
    platform: &str,
    extra: &[String],
) -> Result<()> {
    let mut session_config = SessionConfig::new(topic, style, platform);
    session_config.extra = parse_extra(extra)?;

    let orch = open(config)?;
    let session = orch.create_session(session_config).await?;

    if cli.json {
        return print_json(&session);
    }
    println!("{} {}", console::style("Created session").green(), session.id);
    println!("  Topic:    {}", session.config.topic);
    println!("  Style:    {}", session.config.style);
    println!("  Platform: {}", session.config.platform);
    Ok(())
}

pub async fn cmd_list(config: &CotflowConfig, cli: &Cli, status: Option<&str>, limit: usize) -> Result<()> {
    let status = status
        .map(|s| s.parse::<SessionStatus>().map_err(anyhow::Error::msg))
        .transpose()?;

    let orch = open(config)?;
    let sessions = orch.list_sessions(status, limit).await?;

    if cli.json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!();
    println!(
        "{:<38} {:<12} {:<20} {:<8} Topic",
        "Session", "Status", "Cursor", "Retries"
    );
    println!(
        "{:<38} {:<12} {:<20} {:<8} -----",
        "-".repeat(36),
        "----------",
        "------------------",
        "-------"
    );
    for s in &sessions {
        println!(
            "{:<38} {:<12} {:<20} {:<8} {}",
            s.id,
            styled_status(s.status),
            s.cursor.to_string(),
            s.retry_count,
            s.config.topic
        );
    }
    println!();
    Ok(())
}

fn print_task_summary(tasks: &TaskSummary) {
    println!(
        "Tasks: {} total, {} queued, {} processing, {} completed, {} retrying, {} failed",
        tasks.total, tasks.queued, tasks.processing, tasks.completed, tasks.retrying, tasks.failed
    );
}

pub async fn cmd_status(config: &CotflowConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let orch = open(config)?;
    let view = orch.get_session_status(session_id).await?;

    if cli.json {
        return print_json(&view);
    }

    let s = &view.session;
    println!();
    println!("Session {}", console::style(&s.id).bold());
    println!("  Topic:      {}", s.config.topic);
    println!("  Status:     {}", styled_status(s.status));
    println!("  Cursor:     {}", s.cursor);
    println!("  Retries:    {}", s.retry_count);
    if let Some(error) = &s.last_error {
        println!("  Last error: {}", console::style(error).red());
    }
    if let Some(at) = s.next_retry_at {
        println!("  Next retry: {}", at.to_rfc3339());
    }
    if let Some(parent) = &s.parent_id {
        println!("  Restarted from {} (generation {})", parent, s.generation);
    }
    println!();

    let plan = &config.toml.pipeline;
    println!("Phases");
    for number in 1..=plan.phase_count() {
        let name = plan.phase(number).map(|p| p.name.as_str()).unwrap_or("?");
        let record = view.phases.iter().find(|p| p.phase_number == number);
        let marks: Vec<String> = Step::all()
            .iter()
            .map(|step| {
                let done = record.is_some_and(|r| r.has_result(*step));
                let mark = if done {
                    console::style("✓").green()
                } else {
                    console::style("·").dim()
                };
                format!("{} {}", step.as_str().to_lowercase(), mark)
            })
            .collect();
        let status = record
            .map(|r| r.status.to_string())
            .unwrap_or_else(|| "NOT STARTED".to_string());
        println!("  {:<3} {:<12} {:<12} {}", number, name, status, marks.join("  "));
    }
    println!();
    print_task_summary(&view.tasks);
    println!();
    Ok(())
}

pub async fn cmd_tasks(config: &CotflowConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let orch = open(config)?;
    let tasks = orch.get_session_tasks(session_id).await?;
    if cli.json {
        return print_json(&tasks);
    }
    print_task_summary(&tasks);
    Ok(())
}
