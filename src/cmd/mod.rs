//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                      |
//! |------------|---------------------------------------|
//! | `project`  | `Init`                                |
//! | `session`  | `Create`, `List`, `Status`, `Tasks`   |
//! | `recover`  | `Health`, `Recover`                   |
//! | `run`      | `Run`, `Drive`                        |
//! | `config`   | `Config`                              |

pub mod config;
pub mod project;
pub mod recover;
pub mod run;
pub mod session;

pub use config::cmd_config;
pub use project::cmd_init;
pub use recover::{cmd_health, cmd_recover};
pub use run::{cmd_drive, cmd_run};
pub use session::{cmd_create, cmd_list, cmd_status, cmd_tasks};

use anyhow::{Context, Result};
use cotflow::Orchestrator;
use cotflow::config::CotflowConfig;
use cotflow_common::SessionStatus;
use serde::Serialize;

pub(crate) fn open(config: &CotflowConfig) -> Result<Orchestrator> {
    Orchestrator::open(config)
        .with_context(|| format!("Failed to open database at {}", config.db_path().display()))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

pub(crate) fn styled_status(status: SessionStatus) -> console::StyledObject<&'static str> {
    let text = console::style(status.as_str());
    match status {
        SessionStatus::Completed => text.green(),
        SessionStatus::Failed => text.red(),
        SessionStatus::Pending => text.dim(),
        SessionStatus::Thinking | SessionStatus::Executing | SessionStatus::Integrating => text.cyan(),
    }
}
