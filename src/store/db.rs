use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cotflow_common::{
    Cursor, PhaseRecord, PhaseStatus, Session, SessionConfig, SessionStatus, Step, StepResult,
};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use super::{parse_opt_ts, parse_ts, ts};
use crate::errors::StepError;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, CLI commands
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PipelineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct PipelineDb {
    pub(super) conn: Connection,
}

const SESSION_COLUMNS: &str = "id, config, current_phase, current_step, status, retry_count, \
     last_error, next_retry_at, epoch, parent_id, generation, last_task_id, created_at, updated_at";

const PHASE_COLUMNS: &str = "session_id, phase_number, status, think_result, think_at, \
     execute_result, execute_at, integrate_result, integrate_at, updated_at";

/// Statuses a session can hold while it still moves.
const LIVE_STATUSES: &str = "('PENDING', 'THINKING', 'EXECUTING', 'INTEGRATING')";

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    config TEXT NOT NULL,
                    current_phase INTEGER NOT NULL DEFAULT 1,
                    current_step TEXT NOT NULL DEFAULT 'THINK',
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    next_retry_at TEXT,
                    epoch INTEGER NOT NULL DEFAULT 0,
                    parent_id TEXT REFERENCES sessions(id),
                    generation INTEGER NOT NULL DEFAULT 0,
                    last_task_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phases (
                    session_id TEXT NOT NULL REFERENCES sessions(id),
                    phase_number INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    think_result TEXT,
                    think_at TEXT,
                    execute_result TEXT,
                    execute_at TEXT,
                    integrate_result TEXT,
                    integrate_at TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, phase_number)
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    task_type TEXT NOT NULL,
                    session_id TEXT NOT NULL REFERENCES sessions(id),
                    phase_number INTEGER NOT NULL,
                    step_name TEXT NOT NULL,
                    slot INTEGER NOT NULL DEFAULT 0,
                    epoch INTEGER NOT NULL DEFAULT 0,
                    request TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    next_attempt_at TEXT,
                    response TEXT,
                    error TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, next_retry_at);
                CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, retry_count, created_at);
                CREATE INDEX IF NOT EXISTS idx_tasks_step
                    ON tasks(session_id, phase_number, step_name, epoch);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable, safe to re-run).
        match self.conn.execute("ALTER TABLE sessions ADD COLUMN step_started_at TEXT", []) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add step_started_at column: {}", e)),
        }
        Ok(())
    }

    /// Start an IMMEDIATE transaction so concurrent processes serialise on it.
    pub(super) fn begin_immediate(&self) -> Result<Transaction<'_>> {
        // DbHandle's Mutex already guarantees single-threaded access to `conn`.
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin transaction")
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        insert_session_in(&self.conn, session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                SessionRow::from_row,
            )
            .optional()
            .context("Failed to query session")?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Sessions newest first, optionally filtered by status.
    pub fn list_sessions(&self, status: Option<SessionStatus>, limit: usize) -> Result<Vec<Session>> {
        let sql = match status {
            Some(_) => format!(
                "SELECT {} FROM sessions WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                SESSION_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM sessions WHERE ?1 IS NULL ORDER BY created_at DESC LIMIT ?2",
                SESSION_COLUMNS
            ),
        };
        let status_str = status.map(|s| s.as_str());
        self.query_sessions(&sql, params![status_str, limit])
    }

    /// Live sessions whose retry time has come, oldest first.
    pub fn due_sessions(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions
             WHERE status IN {} AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC LIMIT ?2",
            SESSION_COLUMNS, LIVE_STATUSES
        );
        self.query_sessions(&sql, params![ts(&now), limit])
    }

    /// Every live session, oldest first.
    pub fn live_sessions(&self) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE status IN {} ORDER BY created_at ASC",
            SESSION_COLUMNS, LIVE_STATUSES
        );
        self.query_sessions(&sql, [])
    }

    fn query_sessions<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare session query")?;
        let rows = stmt
            .query_map(params, SessionRow::from_row)
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let row = row.context("Failed to read session row")?;
            sessions.push(row.into_session()?);
        }
        Ok(sessions)
    }

    /// Claim the cursor's step: mark it running and insert its tasks,
    /// atomically. Only one caller can start a step; a start older than
    /// `reclaim_before` is treated as abandoned and may be taken over.
    pub fn start_step(
        &self,
        session_id: &str,
        epoch: u32,
        cursor: Cursor,
        tasks: &[cotflow_common::NewTask],
        reclaim_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<StepStart> {
        let tx = self.begin_immediate()?;
        let changed = tx
            .execute(
                &format!(
                    "UPDATE sessions SET status = ?1, next_retry_at = NULL, step_started_at = ?2,
                         updated_at = ?2
                     WHERE id = ?3 AND epoch = ?4 AND current_phase = ?5 AND current_step = ?6
                       AND status IN {}
                       AND (step_started_at IS NULL OR step_started_at < ?7)",
                    LIVE_STATUSES
                ),
                params![
                    SessionStatus::running(cursor.step).as_str(),
                    ts(&now),
                    session_id,
                    epoch,
                    cursor.phase,
                    cursor.step.as_str(),
                    ts(&reclaim_before)
                ],
            )
            .context("Failed to mark step as running")?;
        if changed == 0 {
            let still_here: bool = tx
                .query_row(
                    &format!(
                        "SELECT EXISTS(SELECT 1 FROM sessions
                         WHERE id = ?1 AND epoch = ?2 AND current_phase = ?3 AND current_step = ?4
                           AND status IN {})",
                        LIVE_STATUSES
                    ),
                    params![session_id, epoch, cursor.phase, cursor.step.as_str()],
                    |row| row.get(0),
                )
                .context("Failed to check session position")?;
            return Ok(if still_here {
                StepStart::AlreadyStarted
            } else {
                StepStart::Moved
            });
        }
        let ids = super::tasks::insert_tasks_in(&tx, tasks, now)?;
        tx.commit().context("Failed to commit step start")?;
        Ok(StepStart::Started(ids))
    }

    /// Persist the result of the cursor's step (if any) and move the cursor.
    ///
    /// `next = None` completes the session. Success clears `retry_count`,
    /// `last_error` and `next_retry_at`. Returns `false` without writing when
    /// the session is no longer at `cursor` in `epoch`.
    pub fn complete_step(
        &self,
        session_id: &str,
        epoch: u32,
        cursor: Cursor,
        result: Option<&StepResult>,
        next: Option<Cursor>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let status = SessionStatus::after_advance(cursor, next);
        let target = next.unwrap_or(cursor);

        let tx = self.begin_immediate()?;
        let changed = tx
            .execute(
                &format!(
                    "UPDATE sessions SET current_phase = ?1, current_step = ?2, status = ?3,
                         retry_count = 0, last_error = NULL, next_retry_at = NULL,
                         step_started_at = NULL, updated_at = ?4
                     WHERE id = ?5 AND epoch = ?6 AND current_phase = ?7 AND current_step = ?8
                       AND status IN {}",
                    LIVE_STATUSES
                ),
                params![
                    target.phase,
                    target.step.as_str(),
                    status.as_str(),
                    ts(&now),
                    session_id,
                    epoch,
                    cursor.phase,
                    cursor.step.as_str()
                ],
            )
            .context("Failed to advance session")?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(result) = result {
            upsert_step_result_in(&tx, session_id, cursor.phase, cursor.step, result, now)?;
        }
        if cursor.step == Step::Integrate {
            ensure_phase_complete_in(&tx, session_id, cursor.phase)?;
        }
        tx.commit().context("Failed to commit step completion")?;
        Ok(true)
    }

    /// Record a failure against a live session: FAILED, `last_error`,
    /// `retry_count + 1`. With `epoch` set, only a session still in that
    /// epoch is touched. Returns whether a row changed.
    pub fn record_failure(
        &self,
        session_id: &str,
        epoch: Option<u32>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE sessions SET status = 'FAILED', last_error = ?1,
                         retry_count = retry_count + 1, updated_at = ?2
                     WHERE id = ?3 AND (?4 IS NULL OR epoch = ?4) AND status IN {}",
                    LIVE_STATUSES
                ),
                params![last_error, ts(&now), session_id, epoch],
            )
            .context("Failed to record session failure")?;
        Ok(changed > 0)
    }

    /// Remember the task that last reported back and refresh `updated_at`.
    pub fn note_task_activity(&self, session_id: &str, task_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "UPDATE sessions SET last_task_id = ?1, updated_at = ?2
                     WHERE id = ?3 AND status IN {}",
                    LIVE_STATUSES
                ),
                params![task_id, ts(&now), session_id],
            )
            .context("Failed to note task completion")?;
        Ok(())
    }

    // ── Recovery writes ───────────────────────────────────────────────

    /// Put the session back to PENDING in a new epoch, optionally not
    /// before `not_before`. Pending tasks of the current phase and later
    /// are superseded. A FAILED session already had its attempt counted by
    /// `record_failure`; any other session is counted here.
    pub fn reset_for_retry(
        &self,
        session_id: &str,
        not_before: Option<DateTime<Utc>>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let Some(session) = self.get_session(session_id)? else {
            return Ok(None);
        };
        let tx = self.begin_immediate()?;
        tx.execute(
            "UPDATE sessions SET status = 'PENDING',
                 retry_count = retry_count + CASE WHEN status = 'FAILED' THEN 0 ELSE 1 END,
                 epoch = epoch + 1, next_retry_at = ?1, step_started_at = NULL, updated_at = ?2
             WHERE id = ?3",
            params![not_before.as_ref().map(ts), ts(&now), session_id],
        )
        .context("Failed to reset session for retry")?;
        super::tasks::supersede_tasks_in(&tx, session_id, session.cursor.phase, max_retries, now)?;
        tx.commit().context("Failed to commit retry")?;
        self.get_session(session_id)
    }

    /// Truncate phases `>= phase` and rewind the session to `phase` THINK.
    pub fn restart_phase(
        &self,
        session_id: &str,
        phase: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let tx = self.begin_immediate()?;
        tx.execute(
            "DELETE FROM phases WHERE session_id = ?1 AND phase_number >= ?2",
            params![session_id, phase],
        )
        .context("Failed to delete phase records")?;
        super::tasks::supersede_tasks_in(&tx, session_id, phase, max_retries, now)?;
        let changed = tx
            .execute(
                "UPDATE sessions SET current_phase = ?1, current_step = 'THINK', status = 'PENDING',
                     retry_count = 0, last_error = NULL, next_retry_at = NULL,
                     step_started_at = NULL, epoch = epoch + 1, updated_at = ?2
                 WHERE id = ?3",
                params![phase, ts(&now), session_id],
            )
            .context("Failed to rewind session")?;
        if changed == 0 {
            return Ok(None);
        }
        tx.commit().context("Failed to commit phase restart")?;
        self.get_session(session_id)
    }

    /// Fail `old_id` with `Restarted: {reason}` and insert `fresh` in its place.
    pub fn restart_session(
        &self,
        old_id: &str,
        reason: &str,
        fresh: &Session,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self.begin_immediate()?;
        let changed = tx
            .execute(
                "UPDATE sessions SET status = 'FAILED', last_error = ?1, next_retry_at = NULL,
                     epoch = epoch + 1, updated_at = ?2
                 WHERE id = ?3",
                params![format!("Restarted: {}", reason), ts(&now), old_id],
            )
            .context("Failed to retire old session")?;
        if changed == 0 {
            return Ok(false);
        }
        super::tasks::supersede_tasks_in(&tx, old_id, 1, max_retries, now)?;
        insert_session_in(&tx, fresh)?;
        tx.commit().context("Failed to commit session restart")?;
        Ok(true)
    }

    /// Give up on a session for good.
    pub fn abort_session(
        &self,
        session_id: &str,
        reason: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let tx = self.begin_immediate()?;
        tx.execute(
            "UPDATE sessions SET status = 'FAILED', last_error = ?1, next_retry_at = NULL,
                 retry_count = retry_count + 1, epoch = epoch + 1, updated_at = ?2
             WHERE id = ?3",
            params![reason, ts(&now), session_id],
        )
        .context("Failed to abort session")?;
        super::tasks::supersede_tasks_in(&tx, session_id, 1, max_retries, now)?;
        tx.commit().context("Failed to commit abort")?;
        self.get_session(session_id)
    }

    // ── Phases ────────────────────────────────────────────────────────

    pub fn get_phases(&self, session_id: &str) -> Result<Vec<PhaseRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM phases WHERE session_id = ?1 ORDER BY phase_number ASC",
                PHASE_COLUMNS
            ))
            .context("Failed to prepare phase query")?;
        let rows = stmt
            .query_map(params![session_id], PhaseRow::from_row)
            .context("Failed to query phases")?;
        let mut phases = Vec::new();
        for row in rows {
            let row = row.context("Failed to read phase row")?;
            phases.push(row.into_phase()?);
        }
        Ok(phases)
    }

    /// Write a whole phase record, replacing any existing one.
    pub fn put_phase(&self, record: &PhaseRecord) -> Result<()> {
        let think = to_json(record.think_result.as_ref())?;
        let execute = to_json(record.execute_result.as_ref())?;
        let integrate = to_json(record.integrate_result.as_ref())?;
        self.conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO phases ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    PHASE_COLUMNS
                ),
                params![
                    record.session_id,
                    record.phase_number,
                    record.status.as_str(),
                    think,
                    record.think_at.as_ref().map(ts),
                    execute,
                    record.execute_at.as_ref().map(ts),
                    integrate,
                    record.integrate_at.as_ref().map(ts),
                    ts(&record.updated_at),
                ],
            )
            .context("Failed to write phase record")?;
        Ok(())
    }
}

fn insert_session_in(conn: &Connection, session: &Session) -> Result<()> {
    let config = serde_json::to_string(&session.config).context("Failed to serialize session config")?;
    conn.execute(
        &format!(
            "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            SESSION_COLUMNS
        ),
        params![
            session.id,
            config,
            session.cursor.phase,
            session.cursor.step.as_str(),
            session.status.as_str(),
            session.retry_count,
            session.last_error,
            session.next_retry_at.as_ref().map(ts),
            session.epoch,
            session.parent_id,
            session.generation,
            session.last_task_id,
            ts(&session.created_at),
            ts(&session.updated_at),
        ],
    )
    .context("Failed to insert session")?;
    Ok(())
}

/// A phase leaving INTEGRATE must hold all three step results. Fails with
/// `StepError::MissingData` naming the first missing step.
fn ensure_phase_complete_in(conn: &Connection, session_id: &str, phase: u32) -> Result<()> {
    let present: Option<(bool, bool, bool)> = conn
        .query_row(
            "SELECT think_result IS NOT NULL, execute_result IS NOT NULL, integrate_result IS NOT NULL
             FROM phases WHERE session_id = ?1 AND phase_number = ?2",
            params![session_id, phase],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("Failed to check phase record")?;
    let (think, execute, integrate) = present.unwrap_or((false, false, false));
    let missing = [(Step::Think, think), (Step::Execute, execute), (Step::Integrate, integrate)]
        .into_iter()
        .find(|(_, present)| !present);
    match missing {
        Some((step, _)) => Err(StepError::MissingData { phase, step }.into()),
        None => Ok(()),
    }
}

fn upsert_step_result_in(
    conn: &Connection,
    session_id: &str,
    phase: u32,
    step: Step,
    result: &StepResult,
    now: DateTime<Utc>,
) -> Result<()> {
    let column = match step {
        Step::Think => "think",
        Step::Execute => "execute",
        Step::Integrate => "integrate",
    };
    let body = match result {
        StepResult::Think(r) => serde_json::to_string(r),
        StepResult::Execute(r) => serde_json::to_string(r),
        StepResult::Integrate(r) => serde_json::to_string(r),
    }
    .context("Failed to serialize step result")?;
    conn.execute(
        &format!(
            "INSERT INTO phases (session_id, phase_number, status, {c}_result, {c}_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(session_id, phase_number) DO UPDATE SET
                 status = excluded.status,
                 {c}_result = excluded.{c}_result,
                 {c}_at = excluded.{c}_at,
                 updated_at = excluded.updated_at",
            c = column
        ),
        params![
            session_id,
            phase,
            PhaseStatus::after(step).as_str(),
            body,
            ts(&now)
        ],
    )
    .context("Failed to store step result")?;
    Ok(())
}

/// What `start_step` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStart {
    /// The step is now running; ids of the tasks inserted with it.
    Started(Vec<String>),
    /// Another driver started the step in this epoch and has not finished.
    AlreadyStarted,
    /// The session left the cursor or epoch, or is no longer live.
    Moved,
}

/// Intermediate row struct for reading sessions from SQLite before
/// converting status/step strings and JSON into typed values.
struct SessionRow {
    id: String,
    config: String,
    current_phase: u32,
    current_step: String,
    status: String,
    retry_count: u32,
    last_error: Option<String>,
    next_retry_at: Option<String>,
    epoch: u32,
    parent_id: Option<String>,
    generation: u32,
    last_task_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            config: row.get(1)?,
            current_phase: row.get(2)?,
            current_step: row.get(3)?,
            status: row.get(4)?,
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
            next_retry_at: row.get(7)?,
            epoch: row.get(8)?,
            parent_id: row.get(9)?,
            generation: row.get(10)?,
            last_task_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let step = Step::from_str(&self.current_step)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session step")?;
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session status")?;
        let config: SessionConfig =
            serde_json::from_str(&self.config).context("Failed to parse session config JSON")?;

        Ok(Session {
            id: self.id,
            config,
            cursor: Cursor::new(self.current_phase, step),
            status,
            retry_count: self.retry_count,
            last_error: self.last_error,
            next_retry_at: parse_opt_ts(self.next_retry_at)?,
            epoch: self.epoch,
            parent_id: self.parent_id,
            generation: self.generation,
            last_task_id: self.last_task_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Intermediate row struct for phases.
struct PhaseRow {
    session_id: String,
    phase_number: u32,
    status: String,
    think_result: Option<String>,
    think_at: Option<String>,
    execute_result: Option<String>,
    execute_at: Option<String>,
    integrate_result: Option<String>,
    integrate_at: Option<String>,
    updated_at: String,
}

impl PhaseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            phase_number: row.get(1)?,
            status: row.get(2)?,
            think_result: row.get(3)?,
            think_at: row.get(4)?,
            execute_result: row.get(5)?,
            execute_at: row.get(6)?,
            integrate_result: row.get(7)?,
            integrate_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_phase(self) -> Result<PhaseRecord> {
        let status = PhaseStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse phase status")?;
        Ok(PhaseRecord {
            session_id: self.session_id,
            phase_number: self.phase_number,
            status,
            think_result: parse_json(self.think_result).context("Failed to parse think result")?,
            think_at: parse_opt_ts(self.think_at)?,
            execute_result: parse_json(self.execute_result)
                .context("Failed to parse execute result")?,
            execute_at: parse_opt_ts(self.execute_at)?,
            integrate_result: parse_json(self.integrate_result)
                .context("Failed to parse integrate result")?,
            integrate_at: parse_opt_ts(self.integrate_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize phase result")
}

fn parse_json<T: serde::de::DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    text.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(anyhow::Error::from)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cotflow_common::{ExecuteResult, IntegrateResult, ThinkResult};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn new_session(db: &PipelineDb) -> Session {
        let session = Session::new(SessionConfig::new("rust", "witty", "x"), now());
        db.insert_session(&session).unwrap();
        session
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('sessions', 'phases', 'tasks')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3);
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_insert_and_get_session() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let session = new_session(&db);
        let loaded = db.get_session(&session.id)?.unwrap();
        assert_eq!(loaded.config, session.config);
        assert_eq!(loaded.cursor, Cursor::start());
        assert_eq!(loaded.status, SessionStatus::Pending);
        assert_eq!(loaded.created_at, now());
        assert!(db.get_session("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_sessions_filters_by_status() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let a = new_session(&db);
        new_session(&db);
        db.record_failure(&a.id, None, "boom", now())?;
        assert_eq!(db.list_sessions(None, 10)?.len(), 2);
        let failed = db.list_sessions(Some(SessionStatus::Failed), 10)?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.id);
        Ok(())
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn phase_with(session_id: &str, think: bool, execute: bool) -> PhaseRecord {
        PhaseRecord {
            session_id: session_id.to_string(),
            phase_number: 1,
            status: PhaseStatus::Integrating,
            think_result: think.then(ThinkResult::default),
            think_at: think.then(now),
            execute_result: execute.then(ExecuteResult::default),
            execute_at: execute.then(now),
            integrate_result: None,
            integrate_at: None,
            updated_at: now(),
        }
    }

    fn move_to_integrate(db: &PipelineDb, id: &str) -> Result<()> {
        db.conn.execute(
            "UPDATE sessions SET current_step = 'INTEGRATE', status = 'INTEGRATING', retry_count = 2, last_error = 'x' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    #[test]
    fn test_start_step_is_guarded_by_cursor_and_epoch() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        let reclaim = now() - secs(120);
        assert_eq!(db.start_step(&s.id, 1, Cursor::start(), &[], reclaim, now())?, StepStart::Moved);
        assert_eq!(
            db.start_step(&s.id, 0, Cursor::new(1, Step::Execute), &[], reclaim, now())?,
            StepStart::Moved
        );
        assert_eq!(
            db.start_step(&s.id, 0, Cursor::start(), &[], reclaim, now())?,
            StepStart::Started(vec![])
        );
        assert_eq!(db.get_session(&s.id)?.unwrap().status, SessionStatus::Thinking);
        Ok(())
    }

    #[test]
    fn test_start_step_claims_the_step_once() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        let reclaim = now() - secs(120);
        assert!(matches!(
            db.start_step(&s.id, 0, Cursor::start(), &[], reclaim, now())?,
            StepStart::Started(_)
        ));
        // THINKING is live and the cursor and epoch still match.
        assert_eq!(
            db.start_step(&s.id, 0, Cursor::start(), &[], reclaim + secs(1), now() + secs(1))?,
            StepStart::AlreadyStarted
        );
        // A start older than the reclaim cutoff is abandoned.
        assert!(matches!(
            db.start_step(&s.id, 0, Cursor::start(), &[], now() + secs(1), now() + secs(121))?,
            StepStart::Started(_)
        ));

        // Moving the cursor frees the next step.
        let think = StepResult::Think(ThinkResult::default());
        db.complete_step(&s.id, 0, Cursor::start(), Some(&think), Some(Cursor::new(1, Step::Execute)), now())?;
        assert!(matches!(
            db.start_step(&s.id, 0, Cursor::new(1, Step::Execute), &[], reclaim, now())?,
            StepStart::Started(_)
        ));
        Ok(())
    }

    #[test]
    fn test_retry_frees_a_started_step() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        let reclaim = now() - secs(120);
        db.start_step(&s.id, 0, Cursor::start(), &[], reclaim, now())?;
        db.record_failure(&s.id, Some(0), "[timeout] slow", now())?;
        let retried = db.reset_for_retry(&s.id, None, 3, now())?.unwrap();
        assert!(matches!(
            db.start_step(&s.id, retried.epoch, Cursor::start(), &[], reclaim, now())?,
            StepStart::Started(_)
        ));
        Ok(())
    }

    #[test]
    fn test_complete_step_persists_result_and_moves_cursor() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        db.record_failure(&s.id, None, "earlier", now())?;
        // FAILED sessions do not advance.
        let think = StepResult::Think(ThinkResult::default());
        assert!(!db.complete_step(&s.id, 0, Cursor::start(), Some(&think), Some(Cursor::new(1, Step::Execute)), now())?);

        let s = new_session(&db);
        assert!(db.complete_step(&s.id, 0, Cursor::start(), Some(&think), Some(Cursor::new(1, Step::Execute)), now())?);
        let loaded = db.get_session(&s.id)?.unwrap();
        assert_eq!(loaded.cursor, Cursor::new(1, Step::Execute));
        assert_eq!(loaded.status, SessionStatus::Executing);
        let phases = db.get_phases(&s.id)?;
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].status, PhaseStatus::Executing);
        assert!(phases[0].think_result.is_some());
        assert_eq!(phases[0].think_at, Some(now()));

        // Replaying the same completion is a no-op.
        assert!(!db.complete_step(&s.id, 0, Cursor::start(), Some(&think), Some(Cursor::new(1, Step::Execute)), now())?);
        Ok(())
    }

    #[test]
    fn test_complete_final_integrate_completes_session() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        let cursor = Cursor::new(1, Step::Integrate);
        move_to_integrate(&db, &s.id)?;
        db.put_phase(&phase_with(&s.id, true, true))?;
        let result = StepResult::Integrate(IntegrateResult::default());
        assert!(db.complete_step(&s.id, 0, cursor, Some(&result), None, now())?);
        let loaded = db.get_session(&s.id)?.unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.cursor, cursor);
        Ok(())
    }

    #[test]
    fn test_integrate_moves_to_next_phase_pending() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        move_to_integrate(&db, &s.id)?;
        db.put_phase(&phase_with(&s.id, true, true))?;
        let result = StepResult::Integrate(IntegrateResult::default());
        db.complete_step(&s.id, 0, Cursor::new(1, Step::Integrate), Some(&result), Some(Cursor::new(2, Step::Think)), now())?;
        let loaded = db.get_session(&s.id)?.unwrap();
        assert_eq!(loaded.cursor, Cursor::new(2, Step::Think));
        assert_eq!(loaded.status, SessionStatus::Pending);
        assert_eq!(loaded.retry_count, 0);
        assert!(loaded.last_error.is_none());
        Ok(())
    }

    #[test]
    fn test_integrate_without_execute_result_is_rejected() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        move_to_integrate(&db, &s.id)?;
        db.put_phase(&phase_with(&s.id, true, false))?;
        let result = StepResult::Integrate(IntegrateResult::default());

        let err = db
            .complete_step(&s.id, 0, Cursor::new(1, Step::Integrate), Some(&result), Some(Cursor::new(2, Step::Think)), now())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::MissingData { phase: 1, step: Step::Execute })
        ));
        // Rolled back: cursor and phase record untouched.
        let loaded = db.get_session(&s.id)?.unwrap();
        assert_eq!(loaded.cursor, Cursor::new(1, Step::Integrate));
        assert_eq!(loaded.status, SessionStatus::Integrating);
        assert!(db.get_phases(&s.id)?[0].integrate_result.is_none());
        Ok(())
    }

    #[test]
    fn test_record_failure_respects_epoch() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        assert!(!db.record_failure(&s.id, Some(3), "stale", now())?);
        assert!(db.record_failure(&s.id, Some(0), "[timeout] slow", now())?);
        let loaded = db.get_session(&s.id)?.unwrap();
        assert_eq!(loaded.status, SessionStatus::Failed);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("[timeout] slow"));
        // Already FAILED: no second count.
        assert!(!db.record_failure(&s.id, None, "again", now())?);
        Ok(())
    }

    #[test]
    fn test_restart_phase_truncates_and_rewinds() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        for n in 1..=4 {
            db.put_phase(&PhaseRecord {
                session_id: s.id.clone(),
                phase_number: n,
                status: PhaseStatus::Completed,
                think_result: Some(ThinkResult::default()),
                think_at: Some(now()),
                execute_result: Some(ExecuteResult::default()),
                execute_at: Some(now()),
                integrate_result: Some(IntegrateResult::default()),
                integrate_at: Some(now()),
                updated_at: now(),
            })?;
        }
        db.conn.execute(
            "UPDATE sessions SET current_phase = 4, current_step = 'EXECUTE', status = 'FAILED', retry_count = 4 WHERE id = ?1",
            params![s.id],
        )?;
        let session = db.restart_phase(&s.id, 3, 3, now())?.unwrap();
        assert_eq!(session.cursor, Cursor::new(3, Step::Think));
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.retry_count, 0);
        assert_eq!(session.epoch, 1);
        let phases: Vec<u32> = db.get_phases(&s.id)?.iter().map(|p| p.phase_number).collect();
        assert_eq!(phases, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_restart_session_links_new_session() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let old = new_session(&db);
        let fresh = Session::restarted_from(&old, now());
        assert!(db.restart_session(&old.id, "too many retries", &fresh, 3, now())?);
        let old = db.get_session(&old.id)?.unwrap();
        assert_eq!(old.status, SessionStatus::Failed);
        assert_eq!(old.last_error.as_deref(), Some("Restarted: too many retries"));
        let fresh = db.get_session(&fresh.id)?.unwrap();
        assert_eq!(fresh.parent_id.as_deref(), Some(old.id.as_str()));
        assert_eq!(fresh.generation, 1);
        Ok(())
    }

    #[test]
    fn test_reset_for_retry_counts_each_attempt_once() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let s = new_session(&db);
        db.record_failure(&s.id, None, "[timeout] slow", now())?;
        let retried = db.reset_for_retry(&s.id, None, 3, now())?.unwrap();
        assert_eq!(retried.status, SessionStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.epoch, 1);

        let again = db.reset_for_retry(&s.id, None, 3, now())?.unwrap();
        assert_eq!(again.retry_count, 2);
        assert_eq!(again.epoch, 2);
        Ok(())
    }

    #[test]
    fn test_due_sessions_skips_future_retries_and_terminal() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let due = new_session(&db);
        let later = new_session(&db);
        let failed = new_session(&db);
        db.reset_for_retry(&later.id, Some(now() + chrono::Duration::seconds(60)), 3, now())?;
        db.record_failure(&failed.id, None, "x", now())?;
        let ids: Vec<String> = db.due_sessions(now(), 5)?.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![due.id.clone()]);
        let ids = db.due_sessions(now() + chrono::Duration::seconds(61), 5)?;
        assert_eq!(ids.len(), 2);
        Ok(())
    }
}
