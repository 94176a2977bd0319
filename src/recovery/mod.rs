//! Recovery manager: diagnoses sessions and applies recovery actions.
//!
//! Health checks are read-only. Every action is persisted through a single
//! store write (status, `last_error`, `retry_count`, `next_retry_at`,
//! `epoch`), so running the same plan twice against the same rows lands in
//! the same place.

pub mod health;
pub mod policy;

use std::sync::Arc;

use cotflow_common::{Session, SessionStatus};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::RecoverySection;
use crate::errors::RecoveryError;
use crate::events::{EventBus, PipelineEvent};
use crate::store::DbHandle;

pub use health::{ABORTED_PREFIX, HealthIssue, HealthReport, RESTARTED_PREFIX, assess, is_retired};
pub use policy::{Decision, RecoveryAction, decide_action, plan_recovery, retry_delay};

/// Result of applying one recovery action.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedRecovery {
    pub session_id: String,
    pub decision: Decision,
    /// The session after the action. For `restart_session` this is the
    /// replacement session.
    pub session: Session,
}

impl AppliedRecovery {
    /// Id of the session that carries on the work.
    pub fn active_session_id(&self) -> &str {
        &self.session.id
    }
}

/// One session visited by `audit`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub report: HealthReport,
    /// Set when the audit applied a plan.
    pub applied: Option<AppliedRecovery>,
}

#[derive(Clone)]
pub struct RecoveryManager {
    db: DbHandle,
    clock: Arc<dyn Clock>,
    settings: RecoverySection,
    /// Task retry ceiling, used when superseding queued tasks.
    max_retries: u32,
    events: EventBus,
}

impl RecoveryManager {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>, settings: RecoverySection, max_retries: u32) -> Self {
        Self {
            db,
            clock,
            settings,
            max_retries,
            events: EventBus::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &RecoverySection {
        &self.settings
    }

    async fn load(&self, session_id: &str) -> Result<(Session, Vec<cotflow_common::PhaseRecord>), RecoveryError> {
        let id = session_id.to_string();
        let loaded = self
            .db
            .call(move |db| {
                let Some(session) = db.get_session(&id)? else {
                    return Ok(None);
                };
                let phases = db.get_phases(&id)?;
                Ok(Some((session, phases)))
            })
            .await?;
        loaded.ok_or_else(|| RecoveryError::SessionNotFound {
            id: session_id.to_string(),
        })
    }

    pub async fn check_health(&self, session_id: &str) -> Result<HealthReport, RecoveryError> {
        let (session, phases) = self.load(session_id).await?;
        Ok(assess(&session, &phases, self.clock.now(), &self.settings))
    }

    /// The action the policy table picks for the session, if any.
    pub async fn plan(&self, session_id: &str) -> Result<Option<Decision>, RecoveryError> {
        let (session, phases) = self.load(session_id).await?;
        let report = assess(&session, &phases, self.clock.now(), &self.settings);
        Ok(plan_recovery(&session, &report, &self.settings))
    }

    /// Drop results of `phase` and later and resume the session at `phase` THINK.
    pub async fn restart_phase(&self, session_id: &str, phase: u32) -> Result<Session, RecoveryError> {
        let applied = self
            .apply(session_id, Decision::restart_phase(phase, "Requested by operator"))
            .await?;
        Ok(applied.session)
    }

    /// Retire the session and start a fresh one with the same config.
    pub async fn restart_session(&self, session_id: &str, reason: &str) -> Result<Session, RecoveryError> {
        let applied = self.apply(session_id, Decision::restart_session(reason)).await?;
        Ok(applied.session)
    }

    /// Persist `decision` against the session.
    pub async fn apply(&self, session_id: &str, decision: Decision) -> Result<AppliedRecovery, RecoveryError> {
        let (session, _) = self.load(session_id).await?;
        if session.status == SessionStatus::Completed {
            return Err(RecoveryError::AlreadyCompleted {
                id: session_id.to_string(),
            });
        }
        if is_retired(&session) {
            return Err(RecoveryError::InvalidAction(format!(
                "session {} was retired ({})",
                session_id,
                session.last_error.as_deref().unwrap_or_default()
            )));
        }
        if let RecoveryAction::RestartPhase { phase } = decision.action
            && (phase == 0 || phase > session.cursor.phase)
        {
            return Err(RecoveryError::InvalidPhase {
                requested: phase,
                current: session.cursor.phase,
            });
        }

        let now = self.clock.now();
        let max_retries = self.max_retries;
        let id = session_id.to_string();
        let action = decision.action;
        let reason = decision.reason.clone();
        let not_before = decision
            .delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);

        let updated = self
            .db
            .call(move |db| match action {
                RecoveryAction::Retry | RecoveryAction::Wait => db.reset_for_retry(&id, not_before, max_retries, now),
                RecoveryAction::RestartPhase { phase } => db.restart_phase(&id, phase, max_retries, now),
                RecoveryAction::RestartSession => {
                    let fresh = Session::restarted_from(&session, now);
                    if db.restart_session(&id, &reason, &fresh, max_retries, now)? {
                        db.get_session(&fresh.id)
                    } else {
                        Ok(None)
                    }
                }
                RecoveryAction::Abort => {
                    db.abort_session(&id, &format!("{}{}", ABORTED_PREFIX, reason), max_retries, now)
                }
            })
            .await?
            .ok_or_else(|| RecoveryError::SessionNotFound {
                id: session_id.to_string(),
            })?;

        let new_session_id = (updated.id != session_id).then(|| updated.id.clone());
        info!(
            session_id,
            action = %decision.action,
            reason = %decision.reason,
            new_session_id = new_session_id.as_deref().unwrap_or(""),
            "Recovery applied"
        );
        self.events.emit(PipelineEvent::RecoveryApplied {
            session_id: session_id.to_string(),
            action: decision.action.to_string(),
            new_session_id,
        });

        Ok(AppliedRecovery {
            session_id: session_id.to_string(),
            decision,
            session: updated,
        })
    }

    /// Apply `action`, or the planned action when none is given.
    ///
    /// Returns `None` when no action is requested and the plan finds
    /// nothing to do.
    pub async fn trigger_recovery(
        &self,
        session_id: &str,
        action: Option<RecoveryAction>,
    ) -> Result<Option<AppliedRecovery>, RecoveryError> {
        let decision = match action {
            Some(action) => {
                let (session, _) = self.load(session_id).await?;
                Decision::requested(action, &session, &self.settings)
            }
            None => match self.plan(session_id).await? {
                Some(decision) => decision,
                None => return Ok(None),
            },
        };
        self.apply(session_id, decision).await.map(Some)
    }

    /// Check every live session. With `auto_recover` on, stalled and
    /// inconsistent sessions get their planned action applied.
    pub async fn audit(&self) -> Result<Vec<AuditEntry>, RecoveryError> {
        let sessions = self.db.call(|db| db.live_sessions()).await?;
        let mut entries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let report = match self.check_health(&session.id).await {
                Ok(report) => report,
                Err(RecoveryError::SessionNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if report.healthy {
                entries.push(AuditEntry { report, applied: None });
                continue;
            }

            warn!(
                session_id = %session.id,
                issues = %report.issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "),
                "Unhealthy session"
            );
            let mut applied = None;
            if self.settings.auto_recover
                && let Some(decision) = self.plan(&session.id).await?
            {
                match self.apply(&session.id, decision).await {
                    Ok(a) => applied = Some(a),
                    Err(e) => warn!(session_id = %session.id, error = %e, "Audit could not apply recovery"),
                }
            }
            entries.push(AuditEntry { report, applied });
        }
        Ok(entries)
    }
}
