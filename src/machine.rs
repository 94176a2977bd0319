//! Session state machine.
//!
//! `next_step` is a pure function of persisted rows: the session, its
//! phase records and the tasks of the cursor's step. It reads no clock of
//! its own and keeps no counters, so the same rows always yield the same
//! `NextStep`.
//!
//! ```text
//! PENDING ─run─> THINKING ─think result─> EXECUTING ─execute result─> INTEGRATING
//!    ^                                                                     │
//!    └──────────── integrate result, more phases ─────────────────────────┤
//!                                                                          └─> COMPLETED
//! any live status ─step or task failure─> FAILED ─retry / restart─> PENDING
//! ```

use chrono::{DateTime, Utc};
use cotflow_common::{Cursor, PhaseRecord, Session, SessionStatus, Task, TaskStatus};

/// What has to happen next for a session.
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    /// The session is COMPLETED.
    Done,
    /// The session is FAILED and waits for an explicit recovery action.
    Halted { reason: String },
    /// A retry is scheduled for later.
    Wait { until: DateTime<Utc> },
    /// The cursor's step has neither a result nor tasks in this epoch.
    Run { cursor: Cursor },
    /// Tasks of the step are still queued, running or waiting for a retry.
    Await { cursor: Cursor, pending: usize },
    /// Every task of the step completed; the result can be assembled.
    Collect { cursor: Cursor, task_ids: Vec<String> },
    /// A task of the step is out of retries.
    TaskFailed {
        cursor: Cursor,
        task_id: String,
        attempts: u32,
        error: String,
    },
    /// The step's result is already stored but the cursor did not move.
    Advance { from: Cursor, to: Option<Cursor> },
}

/// Decide the next action for `session`.
///
/// `step_tasks` may hold tasks of any epoch for the cursor's step; only
/// those of the session's current epoch count.
pub fn next_step(
    session: &Session,
    phases: &[PhaseRecord],
    step_tasks: &[Task],
    now: DateTime<Utc>,
    phase_count: u32,
    max_retries: u32,
) -> NextStep {
    match session.status {
        SessionStatus::Completed => return NextStep::Done,
        SessionStatus::Failed => {
            return NextStep::Halted {
                reason: session
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Session failed".to_string()),
            };
        }
        _ => {}
    }

    if let Some(until) = session.next_retry_at
        && until > now
    {
        return NextStep::Wait { until };
    }

    let cursor = session.cursor;
    let has_result = phases
        .iter()
        .find(|p| p.phase_number == cursor.phase)
        .is_some_and(|p| p.has_result(cursor.step));
    if has_result {
        return NextStep::Advance {
            from: cursor,
            to: cursor.next(phase_count),
        };
    }

    let mut current: Vec<&Task> = step_tasks
        .iter()
        .filter(|t| {
            t.epoch == session.epoch && t.phase_number == cursor.phase && t.step == cursor.step
        })
        .collect();
    if current.is_empty() {
        return NextStep::Run { cursor };
    }
    current.sort_by_key(|t| t.slot);

    if let Some(failed) = current.iter().find(|t| t.is_exhausted(max_retries)) {
        return NextStep::TaskFailed {
            cursor,
            task_id: failed.id.clone(),
            attempts: failed.retry_count,
            error: failed
                .error
                .clone()
                .unwrap_or_else(|| "Task failed".to_string()),
        };
    }

    let pending = current
        .iter()
        .filter(|t| t.status != TaskStatus::Completed)
        .count();
    if pending > 0 {
        return NextStep::Await { cursor, pending };
    }

    NextStep::Collect {
        cursor,
        task_ids: current.iter().map(|t| t.id.clone()).collect(),
    }
}
