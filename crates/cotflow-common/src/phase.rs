use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::{ExecuteResult, IntegrateResult, StepResult, ThinkResult};
use crate::session::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    Thinking,
    Executing,
    Integrating,
    Completed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "THINKING",
            Self::Executing => "EXECUTING",
            Self::Integrating => "INTEGRATING",
            Self::Completed => "COMPLETED",
        }
    }

    /// Phase status once `step` has produced its result.
    pub fn after(step: Step) -> Self {
        match step {
            Step::Think => Self::Executing,
            Step::Execute => Self::Integrating,
            Step::Integrate => Self::Completed,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "THINKING" => Ok(Self::Thinking),
            "EXECUTING" => Ok(Self::Executing),
            "INTEGRATING" => Ok(Self::Integrating),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Persisted record of one phase's triad for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub session_id: String,
    pub phase_number: u32,
    pub status: PhaseStatus,
    pub think_result: Option<ThinkResult>,
    pub think_at: Option<DateTime<Utc>>,
    pub execute_result: Option<ExecuteResult>,
    pub execute_at: Option<DateTime<Utc>>,
    pub integrate_result: Option<IntegrateResult>,
    pub integrate_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseRecord {
    pub fn has_result(&self, step: Step) -> bool {
        match step {
            Step::Think => self.think_result.is_some(),
            Step::Execute => self.execute_result.is_some(),
            Step::Integrate => self.integrate_result.is_some(),
        }
    }

    /// Steps whose result is absent.
    pub fn missing_results(&self) -> Vec<Step> {
        Step::all()
            .into_iter()
            .filter(|s| !self.has_result(*s))
            .collect()
    }

    /// COMPLETED with all three results present.
    pub fn is_complete(&self) -> bool {
        self.status == PhaseStatus::Completed && self.missing_results().is_empty()
    }

    pub fn result(&self, step: Step) -> Option<StepResult> {
        match step {
            Step::Think => self.think_result.clone().map(StepResult::Think),
            Step::Execute => self.execute_result.clone().map(StepResult::Execute),
            Step::Integrate => self.integrate_result.clone().map(StepResult::Integrate),
        }
    }
}
