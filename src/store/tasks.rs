//! Task rows: enqueue, atomic claim, completion, failure and re-queue.

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cotflow_common::{NewTask, Step, Task, TaskRequest, TaskResponse, TaskStatus, TaskSummary, TaskType};
use rusqlite::{Connection, OptionalExtension, params};

use super::db::PipelineDb;
use super::{parse_opt_ts, parse_ts, ts};

const TASK_COLUMNS: &str = "id, task_type, session_id, phase_number, step_name, slot, epoch, request, \
     status, retry_count, created_at, started_at, completed_at, next_attempt_at, response, error";

pub(super) fn insert_tasks_in(conn: &Connection, tasks: &[NewTask], now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut ids = Vec::with_capacity(tasks.len());
    let mut stmt = conn
        .prepare(
            "INSERT INTO tasks (id, task_type, session_id, phase_number, step_name, slot, epoch,
                                request, status, retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'QUEUED', 0, ?9)",
        )
        .context("Failed to prepare task insert")?;
    for task in tasks {
        let id = uuid::Uuid::new_v4().to_string();
        let request = serde_json::to_string(&task.request).context("Failed to serialize task request")?;
        stmt.execute(params![
            id,
            task.request.task_type().as_str(),
            task.session_id,
            task.phase_number,
            task.step.as_str(),
            task.slot,
            task.epoch,
            request,
            ts(&now),
        ])
        .context("Failed to insert task")?;
        ids.push(id);
    }
    Ok(ids)
}

/// Retire every not-yet-running task of `session_id` in phases `>= from_phase`:
/// QUEUED tasks and FAILED tasks still waiting for a retry become terminal.
pub(super) fn supersede_tasks_in(
    conn: &Connection,
    session_id: &str,
    from_phase: u32,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<usize> {
    conn.execute(
        "UPDATE tasks SET status = 'FAILED', retry_count = MAX(retry_count, ?1),
             next_attempt_at = NULL, completed_at = ?2,
             error = '[superseded] Session was retried or restarted'
         WHERE session_id = ?3 AND phase_number >= ?4
           AND (status = 'QUEUED' OR (status = 'FAILED' AND next_attempt_at IS NOT NULL))",
        params![max_retries, ts(&now), session_id, from_phase],
    )
    .context("Failed to supersede tasks")
}

impl PipelineDb {
    /// Insert QUEUED tasks in one transaction.
    pub fn enqueue_tasks(&self, tasks: &[NewTask], now: DateTime<Utc>) -> Result<Vec<String>> {
        let tx = self.begin_immediate()?;
        let ids = insert_tasks_in(&tx, tasks, now)?;
        tx.commit().context("Failed to commit enqueue")?;
        Ok(ids)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// All tasks of a session in creation order.
    pub fn list_tasks(&self, session_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE session_id = ?1 ORDER BY created_at, seq",
                TASK_COLUMNS
            ),
            params![session_id],
        )
    }

    /// Tasks of one step of one phase, across epochs, in slot order.
    pub fn step_tasks(&self, session_id: &str, phase: u32, step: Step) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE session_id = ?1 AND phase_number = ?2 AND step_name = ?3
                 ORDER BY epoch, slot, seq",
                TASK_COLUMNS
            ),
            params![session_id, phase, step.as_str()],
        )
    }

    pub fn task_summary(&self, session_id: &str, max_retries: u32) -> Result<TaskSummary> {
        Ok(TaskSummary::from_tasks(&self.list_tasks(session_id)?, max_retries))
    }

    pub fn count_processing(&self) -> Result<usize> {
        self.conn
            .query_row("SELECT COUNT(*) FROM tasks WHERE status = 'PROCESSING'", [], |row| row.get(0))
            .context("Failed to count processing tasks")
    }

    pub fn count_claimable(&self, max_retries: u32) -> Result<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'QUEUED' AND retry_count < ?1",
                params![max_retries],
                |row| row.get(0),
            )
            .context("Failed to count queued tasks")
    }

    /// Atomically move up to `limit` QUEUED tasks to PROCESSING, oldest first.
    ///
    /// A task is skipped while another task with the same logical identity
    /// (session, phase, step, slot, epoch) is PROCESSING, and at most one
    /// task per identity is claimed per call.
    pub fn claim_tasks(&self, limit: usize, max_retries: u32, now: DateTime<Utc>) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let tx = self.begin_immediate()?;
        let candidates = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {} FROM tasks t
                     WHERE t.status = 'QUEUED' AND t.retry_count < ?1
                       AND NOT EXISTS (
                           SELECT 1 FROM tasks p
                           WHERE p.status = 'PROCESSING' AND p.session_id = t.session_id
                             AND p.phase_number = t.phase_number AND p.step_name = t.step_name
                             AND p.slot = t.slot AND p.epoch = t.epoch)
                     ORDER BY t.created_at, t.seq",
                    TASK_COLUMNS
                        .split(", ")
                        .map(|c| format!("t.{}", c))
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
                .context("Failed to prepare claim query")?;
            let rows = stmt
                .query_map(params![max_retries], TaskRow::from_row)
                .context("Failed to query claimable tasks")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("Failed to read task row")?.into_task()?);
            }
            out
        };

        let mut seen = HashSet::new();
        let mut claimed = Vec::new();
        for mut task in candidates {
            if claimed.len() >= limit {
                break;
            }
            let identity = (
                task.session_id.clone(),
                task.phase_number,
                task.step,
                task.slot,
                task.epoch,
            );
            if !seen.insert(identity) {
                continue;
            }
            let changed = tx
                .execute(
                    "UPDATE tasks SET status = 'PROCESSING', started_at = ?1
                     WHERE id = ?2 AND status = 'QUEUED'",
                    params![ts(&now), task.id],
                )
                .context("Failed to claim task")?;
            if changed == 1 {
                task.status = TaskStatus::Processing;
                task.started_at = Some(now);
                claimed.push(task);
            }
        }
        tx.commit().context("Failed to commit claim")?;
        Ok(claimed)
    }

    /// PROCESSING → COMPLETED. Returns `false` when the task is no longer
    /// PROCESSING (timed out meanwhile); the late response is then dropped.
    pub fn complete_task(&self, id: &str, response: &TaskResponse, now: DateTime<Utc>) -> Result<bool> {
        let body = serde_json::to_string(response).context("Failed to serialize task response")?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'COMPLETED', response = ?1, completed_at = ?2,
                     error = NULL, next_attempt_at = NULL
                 WHERE id = ?3 AND status = 'PROCESSING'",
                params![body, ts(&now), id],
            )
            .context("Failed to complete task")?;
        Ok(changed > 0)
    }

    /// PROCESSING → FAILED with `retry_count` set to `retry_count`.
    /// `next_attempt_at = None` makes the failure terminal.
    pub fn fail_task(
        &self,
        id: &str,
        retry_count: u32,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'FAILED', retry_count = MAX(retry_count, ?1), error = ?2,
                     next_attempt_at = ?3, completed_at = ?4
                 WHERE id = ?5 AND status = 'PROCESSING'",
                params![retry_count, error, next_attempt_at.as_ref().map(ts), ts(&now), id],
            )
            .context("Failed to mark task failed")?;
        Ok(changed > 0)
    }

    /// FAILED tasks whose backoff has elapsed go back to QUEUED.
    pub fn requeue_due(&self, max_retries: u32, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE tasks SET status = 'QUEUED', next_attempt_at = NULL
                 WHERE status = 'FAILED' AND retry_count < ?1
                   AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?2",
                params![max_retries, ts(&now)],
            )
            .context("Failed to re-queue tasks")
    }

    /// Earliest pending retry, if any.
    pub fn next_attempt_due(&self, max_retries: u32) -> Result<Option<DateTime<Utc>>> {
        let next: Option<String> = self
            .conn
            .query_row(
                "SELECT MIN(next_attempt_at) FROM tasks
                 WHERE status = 'FAILED' AND retry_count < ?1 AND next_attempt_at IS NOT NULL",
                params![max_retries],
                |row| row.get(0),
            )
            .context("Failed to query next retry")?;
        parse_opt_ts(next)
    }

    /// Fail tasks left PROCESSING by a previous process. Orphans from an
    /// epoch the session has left are retired for good; the rest become due
    /// immediately while below the retry ceiling. Returns how many were
    /// touched.
    pub fn recover_orphans(&self, max_retries: u32, now: DateTime<Utc>) -> Result<usize> {
        let tx = self.begin_immediate()?;
        let stale = tx
            .execute(
                "UPDATE tasks SET status = 'FAILED', next_attempt_at = NULL, completed_at = ?1,
                     error = '[superseded] Session moved on while the task was processing'
                 WHERE status = 'PROCESSING'
                   AND epoch < (SELECT s.epoch FROM sessions s WHERE s.id = tasks.session_id)",
                params![ts(&now)],
            )
            .context("Failed to retire stale orphaned tasks")?;
        let retried = tx
            .execute(
                "UPDATE tasks SET status = 'FAILED', retry_count = retry_count + 1,
                     error = '[network] Worker stopped while the task was processing',
                     completed_at = ?1,
                     next_attempt_at = CASE WHEN retry_count + 1 < ?2 THEN ?1 ELSE NULL END
                 WHERE status = 'PROCESSING'",
                params![ts(&now), max_retries],
            )
            .context("Failed to recover orphaned tasks")?;
        tx.commit().context("Failed to commit orphan recovery")?;
        Ok(stale + retried)
    }

    fn query_tasks<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt.query_map(params, TaskRow::from_row).context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }
}

/// Intermediate row struct for tasks.
struct TaskRow {
    id: String,
    task_type: String,
    session_id: String,
    phase_number: u32,
    step_name: String,
    slot: u32,
    epoch: u32,
    request: String,
    status: String,
    retry_count: u32,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    next_attempt_at: Option<String>,
    response: Option<String>,
    error: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            session_id: row.get(2)?,
            phase_number: row.get(3)?,
            step_name: row.get(4)?,
            slot: row.get(5)?,
            epoch: row.get(6)?,
            request: row.get(7)?,
            status: row.get(8)?,
            retry_count: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
            next_attempt_at: row.get(13)?,
            response: row.get(14)?,
            error: row.get(15)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let task_type = TaskType::from_str(&self.task_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task type")?;
        let step = Step::from_str(&self.step_name)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task step")?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let request: TaskRequest =
            serde_json::from_str(&self.request).context("Failed to parse task request JSON")?;
        let response: Option<TaskResponse> = self
            .response
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse task response JSON")?;

        Ok(Task {
            id: self.id,
            task_type,
            session_id: self.session_id,
            phase_number: self.phase_number,
            step,
            slot: self.slot,
            epoch: self.epoch,
            request,
            status,
            retry_count: self.retry_count,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            next_attempt_at: parse_opt_ts(self.next_attempt_at)?,
            response,
            error: self.error,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cotflow_common::{Recency, SearchRequest, SearchResponse, Session, SessionConfig};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn setup() -> (PipelineDb, Session) {
        let db = PipelineDb::new_in_memory().unwrap();
        let session = Session::new(SessionConfig::new("rust", "witty", "x"), t0());
        db.insert_session(&session).unwrap();
        (db, session)
    }

    fn search(session: &Session, slot: u32, query: &str) -> NewTask {
        NewTask {
            session_id: session.id.clone(),
            phase_number: 1,
            step: Step::Execute,
            slot,
            epoch: session.epoch,
            request: TaskRequest::Search(SearchRequest {
                query: query.to_string(),
                recency: Recency::Week,
                context: None,
            }),
        }
    }

    fn response() -> TaskResponse {
        TaskResponse::Search(SearchResponse {
            content: "found".into(),
            citations: vec![],
        })
    }

    #[test]
    fn test_enqueue_and_read_back() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a"), search(&s, 1, "b")], t0())?;
        assert_eq!(ids.len(), 2);
        let task = db.get_task(&ids[1])?.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.task_type, TaskType::Search);
        assert_eq!(task.slot, 1);
        assert_eq!(db.step_tasks(&s.id, 1, Step::Execute)?.len(), 2);
        assert!(db.step_tasks(&s.id, 1, Step::Think)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_claim_is_fifo_and_bounded() -> Result<()> {
        let (db, s) = setup();
        db.enqueue_tasks(&[search(&s, 0, "first")], t0())?;
        db.enqueue_tasks(&[search(&s, 1, "second")], t0() + secs(1))?;
        db.enqueue_tasks(&[search(&s, 2, "third")], t0() + secs(2))?;

        let claimed = db.claim_tasks(2, 3, t0() + secs(3))?;
        let slots: Vec<u32> = claimed.iter().map(|t| t.slot).collect();
        assert_eq!(slots, vec![0, 1]);
        assert!(claimed.iter().all(|t| t.status == TaskStatus::Processing));
        assert_eq!(db.count_processing()?, 2);
        assert_eq!(db.count_claimable(3)?, 1);
        Ok(())
    }

    #[test]
    fn test_claim_never_hands_out_a_task_twice() -> Result<()> {
        let (db, s) = setup();
        db.enqueue_tasks(&[search(&s, 0, "a")], t0())?;
        let first = db.claim_tasks(3, 3, t0())?;
        let second = db.claim_tasks(3, 3, t0())?;
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        Ok(())
    }

    #[test]
    fn test_claim_skips_duplicate_logical_identity() -> Result<()> {
        let (db, s) = setup();
        // Same (session, phase, step, slot, epoch) enqueued twice.
        db.enqueue_tasks(&[search(&s, 0, "a"), search(&s, 0, "a")], t0())?;
        let first = db.claim_tasks(3, 3, t0())?;
        assert_eq!(first.len(), 1);
        // The twin stays queued while the first is processing.
        assert!(db.claim_tasks(3, 3, t0())?.is_empty());
        db.complete_task(&first[0].id, &response(), t0())?;
        assert_eq!(db.claim_tasks(3, 3, t0())?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_complete_only_from_processing() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a")], t0())?;
        assert!(!db.complete_task(&ids[0], &response(), t0())?);
        db.claim_tasks(1, 3, t0())?;
        assert!(db.complete_task(&ids[0], &response(), t0() + secs(1))?);
        let task = db.get_task(&ids[0])?.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.response, Some(response()));
        Ok(())
    }

    #[test]
    fn test_late_result_after_timeout_is_discarded() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a")], t0())?;
        db.claim_tasks(1, 3, t0())?;
        assert!(db.fail_task(&ids[0], 1, "[timeout] slow", Some(t0() + secs(10)), t0())?);
        assert!(!db.complete_task(&ids[0], &response(), t0() + secs(1))?);
        assert_eq!(db.get_task(&ids[0])?.unwrap().status, TaskStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_requeue_waits_for_backoff() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a")], t0())?;
        db.claim_tasks(1, 3, t0())?;
        db.fail_task(&ids[0], 1, "[network] reset", Some(t0() + secs(10)), t0())?;
        assert_eq!(db.next_attempt_due(3)?, Some(t0() + secs(10)));
        assert_eq!(db.requeue_due(3, t0() + secs(9))?, 0);
        assert_eq!(db.requeue_due(3, t0() + secs(10))?, 1);
        let task = db.get_task(&ids[0])?.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert!(db.next_attempt_due(3)?.is_none());
        Ok(())
    }

    #[test]
    fn test_terminal_failure_is_never_requeued() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a")], t0())?;
        db.claim_tasks(1, 3, t0())?;
        db.fail_task(&ids[0], 3, "[network] reset", None, t0())?;
        assert_eq!(db.requeue_due(3, t0() + secs(3600))?, 0);
        assert!(db.get_task(&ids[0])?.unwrap().is_exhausted(3));
        Ok(())
    }

    #[test]
    fn test_recover_orphans_makes_processing_retryable() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a")], t0())?;
        db.claim_tasks(1, 3, t0())?;
        assert_eq!(db.recover_orphans(3, t0() + secs(5))?, 1);
        let task = db.get_task(&ids[0])?.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(db.requeue_due(3, t0() + secs(5))?, 1);
        Ok(())
    }

    #[test]
    fn test_recover_orphans_retires_abandoned_epochs() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "old"), search(&s, 1, "old too")], t0())?;
        db.claim_tasks(2, 3, t0())?;
        db.reset_for_retry(&s.id, None, 3, t0())?;
        let current = db.enqueue_tasks(
            &[NewTask {
                epoch: 1,
                ..search(&s, 0, "new")
            }],
            t0(),
        )?;
        db.claim_tasks(1, 3, t0())?;

        assert_eq!(db.recover_orphans(3, t0() + secs(5))?, 3);
        for id in &ids {
            let task = db.get_task(id)?.unwrap();
            assert!(task.is_exhausted(3));
            assert_eq!(task.retry_count, 0);
            assert!(task.error.unwrap().starts_with("[superseded]"));
        }
        assert_eq!(db.requeue_due(3, t0() + secs(5))?, 1);
        assert_eq!(db.get_task(&current[0])?.unwrap().status, TaskStatus::Queued);
        Ok(())
    }

    #[test]
    fn test_supersede_retires_pending_work_only() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a"), search(&s, 1, "b"), search(&s, 2, "c")], t0())?;
        // a: processing, b: waiting for retry, c: queued
        db.claim_tasks(1, 3, t0())?;
        db.claim_tasks(1, 3, t0())?;
        db.fail_task(&ids[1], 1, "[network] x", Some(t0() + secs(10)), t0())?;
        let n = supersede_tasks_in(&db.conn, &s.id, 1, 3, t0())?;
        assert_eq!(n, 2);
        assert_eq!(db.get_task(&ids[0])?.unwrap().status, TaskStatus::Processing);
        assert!(db.get_task(&ids[1])?.unwrap().is_exhausted(3));
        assert!(db.get_task(&ids[2])?.unwrap().is_exhausted(3));
        assert_eq!(db.requeue_due(3, t0() + secs(60))?, 0);
        Ok(())
    }

    #[test]
    fn test_task_summary_counts() -> Result<()> {
        let (db, s) = setup();
        let ids = db.enqueue_tasks(&[search(&s, 0, "a"), search(&s, 1, "b"), search(&s, 2, "c")], t0())?;
        db.claim_tasks(2, 3, t0())?;
        db.complete_task(&ids[0], &response(), t0())?;
        let summary = db.task_summary(&s.id, 3)?;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.processing, 1);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.failed, 0);
        Ok(())
    }
}
