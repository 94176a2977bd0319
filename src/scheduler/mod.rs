//! Scheduler: drives sessions through the executor.
//!
//! A session is driven by calling `run_step` until it stops making
//! immediate progress. Drives of one session are serialised by a
//! per-session async lock; different sessions drive concurrently.
//!
//! Three things start a drive:
//! - a continuation signal from the task queue
//! - the periodic sweep over due sessions (covers lost signals and expired waits)
//! - an explicit call (`drive`, `drive_to_end`)
//!
//! A step failure is handed to the recovery manager. Retry and wait are
//! applied automatically while the session is under the retry ceiling;
//! anything that discards work (restarting a phase or the session,
//! aborting) is applied only with `auto_recover` on.

pub mod continuation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub use continuation::{Continuation, InProcessContinuation, WebhookContinuation};

use crate::clock::Clock;
use crate::config::CotflowToml;
use crate::errors::{RecoveryError, StepError};
use crate::executor::{PhaseExecutor, StepOutcome};
use crate::recovery::{AppliedRecovery, RecoveryManager};
use crate::store::DbHandle;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sweep_interval: Duration,
    pub sweep_batch: usize,
    pub audit_interval: Duration,
    /// Retry and wait are applied automatically below this count.
    pub retry_ceiling: u32,
    pub auto_recover: bool,
}

impl SchedulerSettings {
    pub fn from_config(toml: &CotflowToml) -> Self {
        Self {
            sweep_interval: Duration::from_secs(toml.scheduler.sweep_interval_secs.max(1)),
            sweep_batch: toml.scheduler.sweep_batch.max(1),
            audit_interval: Duration::from_secs(toml.recovery.audit_interval_secs.max(1)),
            retry_ceiling: toml.recovery.retry_ceiling,
            auto_recover: toml.recovery.auto_recover,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&CotflowToml::default())
    }
}

/// Where a drive left a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Driven {
    /// The session now carrying the work. Differs from the requested id
    /// after an automatic session restart.
    pub session_id: String,
    pub outcome: StepOutcome,
}

impl Driven {
    /// Nothing more will happen without outside help.
    pub fn is_final(&self) -> bool {
        matches!(self.outcome, StepOutcome::Completed | StepOutcome::Halted { .. })
    }
}

#[derive(Clone)]
pub struct Scheduler {
    db: DbHandle,
    executor: Arc<PhaseExecutor>,
    recovery: RecoveryManager,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Scheduler {
    pub fn new(
        db: DbHandle,
        executor: Arc<PhaseExecutor>,
        recovery: RecoveryManager,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            db,
            executor,
            recovery,
            clock,
            settings,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn executor(&self) -> &PhaseExecutor {
        &self.executor
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the lock of a settled session unless another drive still
    /// holds or waits on it.
    fn release_lock(&self, session_id: &str) {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks.get(session_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(session_id);
        }
    }

    /// Run steps of `session_id` until it stops making immediate progress.
    pub async fn drive(&self, session_id: &str) -> Result<Driven> {
        let mut current = session_id.to_string();
        loop {
            let outcome = {
                let lock = self.session_lock(&current);
                let _guard = lock.lock().await;
                self.drive_locked(&current).await?
            };
            match outcome {
                DriveStep::Settled(outcome) => {
                    if matches!(outcome, StepOutcome::Completed | StepOutcome::Halted { .. }) {
                        self.release_lock(&current);
                    }
                    return Ok(Driven {
                        session_id: current,
                        outcome,
                    });
                }
                DriveStep::Replaced(next) => {
                    self.release_lock(&current);
                    info!(from = %current, to = %next, "Following restarted session");
                    current = next;
                }
            }
        }
    }

    async fn drive_locked(&self, session_id: &str) -> Result<DriveStep> {
        loop {
            match self.executor.run_step(session_id).await {
                Ok(outcome) if outcome.should_continue() => continue,
                Ok(outcome) => {
                    debug!(session_id, ?outcome, "Drive settled");
                    return Ok(DriveStep::Settled(outcome));
                }
                Err(err) if err.is_recorded() => match self.recover(session_id, &err).await? {
                    Some(applied) if applied.session.id != session_id => {
                        return Ok(DriveStep::Replaced(applied.session.id));
                    }
                    Some(_) => continue,
                    None => {
                        return Ok(DriveStep::Settled(StepOutcome::Halted {
                            reason: err.failure().tagged(),
                        }));
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Consult the recovery manager after a recorded step failure.
    async fn recover(&self, session_id: &str, err: &StepError) -> Result<Option<AppliedRecovery>> {
        let Some(decision) = self.recovery.plan(session_id).await? else {
            return Ok(None);
        };
        let session_retries = self.retry_count(session_id).await?;
        let automatic = if decision.action.is_transient() {
            session_retries < self.settings.retry_ceiling
        } else {
            self.settings.auto_recover
        };
        if !automatic {
            warn!(
                session_id,
                error = %err,
                recommended = %decision,
                "Session needs recovery"
            );
            return Ok(None);
        }

        warn!(session_id, error = %err, decision = %decision, "Step failed, recovering");
        match self.recovery.apply(session_id, decision).await {
            Ok(applied) => Ok(Some(applied)),
            Err(RecoveryError::AlreadyCompleted { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn retry_count(&self, session_id: &str) -> Result<u32> {
        let id = session_id.to_string();
        let session = self.db.call(move |db| db.get_session(&id)).await?;
        Ok(session.map(|s| s.retry_count).unwrap_or_default())
    }

    /// Drive every due session once, oldest first.
    pub async fn sweep(&self) -> Result<Vec<Driven>> {
        let now = self.clock.now();
        let batch = self.settings.sweep_batch;
        let due = self.db.call(move |db| db.due_sessions(now, batch)).await?;
        let mut driven = Vec::with_capacity(due.len());
        for session in due {
            match self.drive(&session.id).await {
                Ok(d) => driven.push(d),
                Err(e) => error!(session_id = %session.id, error = %e, "Sweep failed to drive session"),
            }
        }
        Ok(driven)
    }

    /// Drive `session_id` until it completes or halts, waiting on
    /// `continuations` while its tasks run and sleeping through scheduled
    /// retries.
    pub async fn drive_to_end(
        &self,
        session_id: &str,
        continuations: &mut mpsc::UnboundedReceiver<String>,
    ) -> Result<Driven> {
        let mut current = session_id.to_string();
        loop {
            let driven = self.drive(&current).await?;
            current = driven.session_id.clone();
            match &driven.outcome {
                StepOutcome::Completed | StepOutcome::Halted { .. } => return Ok(driven),
                StepOutcome::Waiting { until } => {
                    let wait = self.until(*until);
                    debug!(session_id = %current, wait_secs = wait.as_secs(), "Waiting for scheduled retry");
                    self.clock.sleep(wait).await;
                }
                _ => {
                    tokio::select! {
                        received = continuations.recv() => {
                            if received.is_none() {
                                anyhow::bail!("Continuation channel closed while session {} was running", current);
                            }
                        }
                        _ = self.clock.sleep(self.settings.sweep_interval) => {}
                    }
                }
            }
        }
    }

    fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Service loop: drive sessions on continuation signals, sweep due
    /// sessions and audit health on their intervals, until `shutdown`.
    pub async fn run(
        &self,
        mut continuations: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            sweep_secs = self.settings.sweep_interval.as_secs(),
            audit_secs = self.settings.audit_interval.as_secs(),
            "Scheduler started"
        );
        let mut next_sweep = tokio::time::Instant::now();
        let mut next_audit = tokio::time::Instant::now() + self.settings.audit_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= next_sweep {
                next_sweep = now + self.settings.sweep_interval;
                let scheduler = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = scheduler.sweep().await {
                        error!(error = %e, "Sweep failed");
                    }
                });
            }
            if now >= next_audit {
                next_audit = now + self.settings.audit_interval;
                match self.recovery.audit().await {
                    Ok(entries) => {
                        let unhealthy = entries.iter().filter(|e| !e.report.healthy).count();
                        let applied = entries.iter().filter(|e| e.applied.is_some()).count();
                        if unhealthy > 0 {
                            info!(checked = entries.len(), unhealthy, applied, "Health audit finished");
                        }
                    }
                    Err(e) => error!(error = %e, "Health audit failed"),
                }
            }

            let wake_at = next_sweep.min(next_audit);
            tokio::select! {
                received = continuations.recv() => {
                    let Some(session_id) = received else {
                        break;
                    };
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.drive(&session_id).await {
                            error!(%session_id, error = %e, "Failed to resume session");
                        }
                    });
                }
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Scheduler stopped");
    }
}

enum DriveStep {
    Settled(StepOutcome),
    /// The session was restarted into the given session.
    Replaced(String),
}
