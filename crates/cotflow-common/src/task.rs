use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::{TaskRequest, TaskResponse};
use crate::session::Step;

/// Which collaborator a task calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Reasoning,
    Search,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reasoning => "REASONING",
            Self::Search => "SEARCH",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REASONING" => Ok(Self::Reasoning),
            "SEARCH" => Ok(Self::Search),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

/// Task lifecycle. Transitions only move forward
/// (QUEUED → PROCESSING → COMPLETED | FAILED); a retryable FAILED task is
/// put back to QUEUED by the queue once its backoff has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// A task about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub session_id: String,
    pub phase_number: u32,
    pub step: Step,
    /// Position inside the batch enqueued for one step.
    pub slot: u32,
    /// Session epoch the task belongs to.
    pub epoch: u32,
    pub request: TaskRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub session_id: String,
    pub phase_number: u32,
    pub step: Step,
    pub slot: u32,
    pub epoch: u32,
    pub request: TaskRequest,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When a retryable failure becomes eligible to run again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub response: Option<TaskResponse>,
    pub error: Option<String>,
}

impl Task {
    /// FAILED with no retry pending: either out of retries or failed
    /// structurally. `retry_count` always holds the attempts actually made.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == TaskStatus::Failed
            && (self.next_attempt_at.is_none() || self.retry_count >= max_retries)
    }

    /// Will not change state again without outside intervention.
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        self.status == TaskStatus::Completed || self.is_exhausted(max_retries)
    }
}

/// Per-session task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    /// Failed and waiting for a backoff retry.
    pub retrying: usize,
    /// Failed with no retries left.
    pub failed: usize,
}

impl TaskSummary {
    pub fn from_tasks(tasks: &[Task], max_retries: u32) -> Self {
        let mut summary = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Queued => summary.queued += 1,
                TaskStatus::Processing => summary.processing += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed if task.is_exhausted(max_retries) => summary.failed += 1,
                TaskStatus::Failed => summary.retrying += 1,
            }
        }
        summary
    }
}
