use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step of a phase triad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    Think,
    Execute,
    Integrate,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Think => "THINK",
            Self::Execute => "EXECUTE",
            Self::Integrate => "INTEGRATE",
        }
    }

    /// The step that follows this one inside the same phase.
    pub fn next(&self) -> Option<Step> {
        match self {
            Self::Think => Some(Self::Execute),
            Self::Execute => Some(Self::Integrate),
            Self::Integrate => None,
        }
    }

    pub fn all() -> [Step; 3] {
        [Self::Think, Self::Execute, Self::Integrate]
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "THINK" => Ok(Self::Think),
            "EXECUTE" => Ok(Self::Execute),
            "INTEGRATE" => Ok(Self::Integrate),
            _ => Err(format!("Invalid step: {}", s)),
        }
    }
}

/// Position of a session inside the fixed pipeline.
///
/// Phases are numbered from 1. The cursor always names the step that has
/// to run next (or is running right now); it never points past the final
/// integrate of the last phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub phase: u32,
    pub step: Step,
}

impl Cursor {
    pub fn new(phase: u32, step: Step) -> Self {
        Self { phase, step }
    }

    /// Phase 1, THINK.
    pub fn start() -> Self {
        Self::new(1, Step::Think)
    }

    /// The cursor after this step completes, or `None` when this is the
    /// integrate step of the last phase.
    pub fn next(&self, phase_count: u32) -> Option<Cursor> {
        match self.step.next() {
            Some(step) => Some(Cursor::new(self.phase, step)),
            None if self.phase < phase_count => Some(Cursor::new(self.phase + 1, Step::Think)),
            None => None,
        }
    }

    pub fn is_final(&self, phase_count: u32) -> bool {
        self.next(phase_count).is_none()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} {}", self.phase, self.step)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Thinking,
    Executing,
    Integrating,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Thinking => "THINKING",
            Self::Executing => "EXECUTING",
            Self::Integrating => "INTEGRATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Status a session carries while `step` is in progress.
    pub fn running(step: Step) -> Self {
        match step {
            Step::Think => Self::Thinking,
            Step::Execute => Self::Executing,
            Step::Integrate => Self::Integrating,
        }
    }

    /// The step this status claims is in progress, if any.
    pub fn running_step(&self) -> Option<Step> {
        match self {
            Self::Thinking => Some(Step::Think),
            Self::Executing => Some(Step::Execute),
            Self::Integrating => Some(Step::Integrate),
            _ => None,
        }
    }

    /// Status once the step at `from` has completed and the cursor moved
    /// to `next`: the next step of the same phase is running right away, a
    /// new phase waits PENDING, and no successor means the session is done.
    pub fn after_advance(from: Cursor, next: Option<Cursor>) -> Self {
        match next {
            Some(c) if c.phase == from.phase => Self::running(c.step),
            Some(_) => Self::Pending,
            None => Self::Completed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_in_progress(&self) -> bool {
        self.running_step().is_some()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "THINKING" => Ok(Self::Thinking),
            "EXECUTING" => Ok(Self::Executing),
            "INTEGRATING" => Ok(Self::Integrating),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Creation-time configuration. Opaque to the orchestration core; it is
/// only interpolated into prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub topic: String,
    pub style: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionConfig {
    pub fn new(topic: &str, style: &str, platform: &str) -> Self {
        Self {
            topic: topic.to_string(),
            style: style.to_string(),
            platform: platform.to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub config: SessionConfig,
    pub cursor: Cursor,
    pub status: SessionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Attempt generation of the cursor. Bumped whenever the current
    /// attempt is abandoned (retry, wait, restart) so that tasks enqueued
    /// by the old attempt are ignored.
    pub epoch: u32,
    /// Session this one was restarted from.
    pub parent_id: Option<String>,
    /// Number of `restart_session` hops from the original session.
    pub generation: u32,
    pub last_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh session at phase 1 THINK.
    pub fn new(config: SessionConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            cursor: Cursor::start(),
            status: SessionStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            epoch: 0,
            parent_id: None,
            generation: 0,
            last_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A new session carrying over only the configuration of `previous`.
    pub fn restarted_from(previous: &Session, now: DateTime<Utc>) -> Self {
        let mut session = Self::new(previous.config.clone(), now);
        session.parent_id = Some(previous.id.clone());
        session.generation = previous.generation + 1;
        session
    }

    /// Status and cursor agree: an in-progress status names the cursor's step.
    pub fn is_consistent(&self) -> bool {
        match self.status.running_step() {
            Some(step) => step == self.cursor.step,
            None => true,
        }
    }
}
