//! Session health assessment.

use std::fmt;

use chrono::{DateTime, Utc};
use cotflow_common::{Cursor, PhaseRecord, PhaseStatus, Session, SessionStatus, Step};
use serde::{Deserialize, Serialize};

use super::policy::{Decision, decide_action};
use crate::config::RecoverySection;
use crate::errors::Failure;

/// `last_error` prefix of a session replaced by `restart_session`.
pub const RESTARTED_PREFIX: &str = "Restarted: ";
/// `last_error` prefix of an aborted session.
pub const ABORTED_PREFIX: &str = "Aborted: ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum HealthIssue {
    /// In progress but untouched for longer than the stall threshold.
    Stalled { idle_secs: u64 },
    /// `retry_count` reached the ceiling.
    RetryExhausted { count: u32 },
    /// A phase claims COMPLETED without all three results, or the session
    /// status disagrees with its cursor.
    Inconsistent { phase: u32 },
    /// The session is at `phase` but the previous phase is not COMPLETED.
    DependencyViolation { phase: u32 },
    /// The session is FAILED and may be recovered.
    Failed { last_error: String },
    /// The session was restarted or aborted and is kept for history only.
    Retired { reason: String },
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stalled { idle_secs } => write!(f, "stalled: no progress for {}s", idle_secs),
            Self::RetryExhausted { count } => write!(f, "retry exhausted: {} attempts", count),
            Self::Inconsistent { phase } => write!(f, "inconsistent records in phase {}", phase),
            Self::DependencyViolation { phase } => {
                write!(f, "phase {} started before phase {} completed", phase, phase.saturating_sub(1))
            }
            Self::Failed { last_error } => write!(f, "failed: {}", last_error),
            Self::Retired { reason } => write!(f, "retired: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub cursor: Cursor,
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
    /// One recommendation per actionable issue, in issue order.
    pub recommendations: Vec<Decision>,
}

impl HealthReport {
    pub fn is_stalled(&self) -> bool {
        self.issues.iter().any(|i| matches!(i, HealthIssue::Stalled { .. }))
    }
}

/// Whether a FAILED session was replaced or given up on.
pub fn is_retired(session: &Session) -> bool {
    session.status == SessionStatus::Failed
        && session
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with(RESTARTED_PREFIX) || e.starts_with(ABORTED_PREFIX))
}

/// Inspect a session and its phase rows. Pure: reads no clock and no store.
pub fn assess(
    session: &Session,
    phases: &[PhaseRecord],
    now: DateTime<Utc>,
    settings: &RecoverySection,
) -> HealthReport {
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();
    let current = session.cursor.phase;

    if session.status == SessionStatus::Completed {
        return report(session, issues, recommendations);
    }
    if is_retired(session) {
        issues.push(HealthIssue::Retired {
            reason: session.last_error.clone().unwrap_or_default(),
        });
        return report(session, issues, recommendations);
    }

    if session.status.is_in_progress() {
        let idle = (now - session.updated_at).num_seconds().max(0) as u64;
        if idle > settings.stall_threshold_secs {
            issues.push(HealthIssue::Stalled { idle_secs: idle });
            recommendations.push(Decision::restart_phase(
                current,
                format!("No progress for {}s", idle),
            ));
        }
    }

    if session.retry_count >= settings.retry_ceiling {
        issues.push(HealthIssue::RetryExhausted {
            count: session.retry_count,
        });
        recommendations.push(Decision::restart_session(format!(
            "Retry ceiling of {} reached",
            settings.retry_ceiling
        )));
    }

    if !session.is_consistent() {
        issues.push(HealthIssue::Inconsistent { phase: current });
        recommendations.push(Decision::restart_phase(current, "Status disagrees with the cursor"));
    }
    for phase in phases {
        let complete = Step::all().iter().all(|s| phase.has_result(*s));
        if phase.status == PhaseStatus::Completed && !complete {
            issues.push(HealthIssue::Inconsistent {
                phase: phase.phase_number,
            });
            recommendations.push(Decision::restart_phase(
                phase.phase_number,
                format!("Phase {} is COMPLETED without all results", phase.phase_number),
            ));
        }
    }

    if current > 1 {
        let previous_done = phases
            .iter()
            .any(|p| p.phase_number == current - 1 && p.status == PhaseStatus::Completed);
        if !previous_done {
            issues.push(HealthIssue::DependencyViolation { phase: current });
            recommendations.push(Decision::restart_phase(
                current - 1,
                format!("Phase {} never completed", current - 1),
            ));
        }
    }

    if session.status == SessionStatus::Failed {
        let last_error = session
            .last_error
            .clone()
            .unwrap_or_else(|| "Session failed".to_string());
        recommendations.push(decide_action(session, &Failure::from_message(&last_error), settings));
        issues.push(HealthIssue::Failed { last_error });
    }

    report(session, issues, recommendations)
}

fn report(session: &Session, issues: Vec<HealthIssue>, recommendations: Vec<Decision>) -> HealthReport {
    HealthReport {
        session_id: session.id.clone(),
        status: session.status,
        cursor: session.cursor,
        healthy: issues.is_empty(),
        issues,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::policy::RecoveryAction;
    use cotflow_common::{ExecuteResult, IntegrateResult, SessionConfig, ThinkResult};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn session(cursor: Cursor, status: SessionStatus) -> Session {
        let mut s = Session::new(SessionConfig::new("rust", "witty", "x"), t0());
        s.cursor = cursor;
        s.status = status;
        s
    }

    fn completed_phase(session_id: &str, n: u32) -> PhaseRecord {
        PhaseRecord {
            session_id: session_id.to_string(),
            phase_number: n,
            status: PhaseStatus::Completed,
            think_result: Some(ThinkResult::default()),
            think_at: Some(t0()),
            execute_result: Some(ExecuteResult::default()),
            execute_at: Some(t0()),
            integrate_result: Some(IntegrateResult::default()),
            integrate_at: Some(t0()),
            updated_at: t0(),
        }
    }

    #[test]
    fn test_idle_mid_execute_is_stalled() {
        let s = session(Cursor::new(1, Step::Execute), SessionStatus::Executing);
        let report = assess(&s, &[], t0() + chrono::Duration::minutes(10), &RecoverySection::default());
        assert!(!report.healthy);
        assert_eq!(report.issues, vec![HealthIssue::Stalled { idle_secs: 600 }]);
        assert_eq!(report.recommendations[0].action, RecoveryAction::RestartPhase { phase: 1 });
    }

    #[test]
    fn test_pending_session_is_never_stalled() {
        let s = session(Cursor::start(), SessionStatus::Pending);
        let report = assess(&s, &[], t0() + chrono::Duration::hours(2), &RecoverySection::default());
        assert!(report.healthy);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_recent_activity_is_healthy() {
        let s = session(Cursor::new(1, Step::Think), SessionStatus::Thinking);
        let report = assess(&s, &[], t0() + chrono::Duration::minutes(4), &RecoverySection::default());
        assert!(report.healthy);
    }

    #[test]
    fn test_retry_ceiling_recommends_restart_session() {
        let mut s = session(Cursor::start(), SessionStatus::Failed);
        s.retry_count = 5;
        s.last_error = Some("[network] connection reset".into());
        let report = assess(&s, &[], t0(), &RecoverySection::default());
        assert!(report.issues.contains(&HealthIssue::RetryExhausted { count: 5 }));
        assert_eq!(report.recommendations[0].action, RecoveryAction::RestartSession);
    }

    #[test]
    fn test_completed_phase_missing_result_is_inconsistent() {
        let s = session(Cursor::new(2, Step::Think), SessionStatus::Pending);
        let mut phase = completed_phase(&s.id, 1);
        phase.execute_result = None;
        let report = assess(&s, &[phase], t0(), &RecoverySection::default());
        assert_eq!(report.issues, vec![HealthIssue::Inconsistent { phase: 1 }]);
        assert_eq!(report.recommendations[0].action, RecoveryAction::RestartPhase { phase: 1 });
    }

    #[test]
    fn test_status_cursor_mismatch_is_inconsistent() {
        let s = session(Cursor::new(1, Step::Think), SessionStatus::Integrating);
        let report = assess(&s, &[], t0(), &RecoverySection::default());
        assert!(report.issues.contains(&HealthIssue::Inconsistent { phase: 1 }));
    }

    #[test]
    fn test_missing_previous_phase_is_dependency_violation() {
        let s = session(Cursor::new(3, Step::Think), SessionStatus::Pending);
        let phases = vec![completed_phase(&s.id, 1)];
        let report = assess(&s, &phases, t0(), &RecoverySection::default());
        assert_eq!(report.issues, vec![HealthIssue::DependencyViolation { phase: 3 }]);
        assert_eq!(report.recommendations[0].action, RecoveryAction::RestartPhase { phase: 2 });
    }

    #[test]
    fn test_failed_session_gets_decision_from_last_error() {
        let mut s = session(Cursor::new(1, Step::Execute), SessionStatus::Failed);
        s.retry_count = 1;
        s.last_error = Some("[rate_limit] Rate limited: slow down".into());
        let report = assess(&s, &[], t0(), &RecoverySection::default());
        assert!(matches!(report.issues[0], HealthIssue::Failed { .. }));
        assert_eq!(report.recommendations[0].action, RecoveryAction::Wait);
    }

    #[test]
    fn test_retired_session_has_no_recommendation() {
        let mut s = session(Cursor::start(), SessionStatus::Failed);
        s.last_error = Some(format!("{}retry ceiling", RESTARTED_PREFIX));
        assert!(is_retired(&s));
        let report = assess(&s, &[], t0(), &RecoverySection::default());
        assert!(matches!(report.issues[0], HealthIssue::Retired { .. }));
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_completed_session_is_healthy() {
        let s = session(Cursor::new(3, Step::Integrate), SessionStatus::Completed);
        assert!(assess(&s, &[], t0() + chrono::Duration::days(1), &RecoverySection::default()).healthy);
    }
}
