//! Rule-based recovery decisions.
//!
//! `decide_action` maps one classified failure to an action;
//! `plan_recovery` walks the policy table over a whole health report and
//! picks the single action to apply.
//!
//! ## Policy table
//!
//! Evaluated top to bottom, first match wins:
//!
//! 1. Session COMPLETED or retired: nothing to do
//! 2. Lineage out of restarts and retries exhausted: **abort**
//! 3. Retries exhausted: **restart_session**
//! 4. Inconsistent rows or dependency violation: **restart_phase** at the lowest offending phase
//! 5. Session FAILED: `decide_action(last_error)`
//! 6. Session stalled: **restart_phase** at the current phase
//! 7. Healthy: nothing to do

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use cotflow_common::{Session, SessionStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::health::{HealthIssue, HealthReport};
use crate::config::RecoverySection;
use crate::errors::{Failure, FailureKind};
use crate::queue::backoff;

static MISSING_PHASE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"result not found for phase (\d+)").unwrap());

/// Base and cap of the session-level retry delay.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// What the recovery manager can do to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Run the current step again in a new epoch.
    Retry,
    /// Like retry, but not before a delay has passed.
    Wait,
    /// Drop results of `phase` and later, resume at `phase` THINK.
    RestartPhase { phase: u32 },
    /// Retire the session and start a fresh one with the same config.
    RestartSession,
    /// Give up for good.
    Abort,
}

impl RecoveryAction {
    /// Actions that keep the cursor where it is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Retry | Self::Wait)
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Wait => write!(f, "wait"),
            Self::RestartPhase { phase } => write!(f, "restart_phase({})", phase),
            Self::RestartSession => write!(f, "restart_session"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Parses `retry`, `wait`, `restart_session`, `abort` and
/// `restart_phase:N` (also `restart_phase(N)`), dashes or underscores.
impl FromStr for RecoveryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "retry" => return Ok(Self::Retry),
            "wait" => return Ok(Self::Wait),
            "restart_session" => return Ok(Self::RestartSession),
            "abort" => return Ok(Self::Abort),
            _ => {}
        }
        let phase = normalized
            .strip_prefix("restart_phase")
            .map(|rest| rest.trim_matches(|c: char| matches!(c, ':' | '(' | ')' | '=' | ' ')))
            .ok_or_else(|| format!("Unknown recovery action: {}", s))?;
        phase
            .parse::<u32>()
            .map(|phase| Self::RestartPhase { phase })
            .map_err(|_| format!("restart_phase needs a phase number, got '{}'", s))
    }
}

/// A chosen action with the delay it carries and the reason for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: RecoveryAction,
    /// Earliest time the next attempt may start, relative to now.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_secs")]
    pub delay: Option<Duration>,
    pub reason: String,
}

impl Decision {
    pub fn retry(retry_count: u32, reason: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::Retry,
            delay: Some(retry_delay(retry_count)),
            reason: reason.into(),
        }
    }

    pub fn wait(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::Wait,
            delay: Some(delay),
            reason: reason.into(),
        }
    }

    pub fn restart_phase(phase: u32, reason: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::RestartPhase { phase },
            delay: None,
            reason: reason.into(),
        }
    }

    pub fn restart_session(reason: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::RestartSession,
            delay: None,
            reason: reason.into(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::Abort,
            delay: None,
            reason: reason.into(),
        }
    }

    /// Decision for an action a caller asked for explicitly.
    pub fn requested(action: RecoveryAction, session: &Session, settings: &RecoverySection) -> Self {
        let reason = "Requested by operator";
        match action {
            RecoveryAction::Retry => Self::retry(session.retry_count, reason),
            RecoveryAction::Wait => Self::wait(Duration::from_secs(settings.rate_limit_wait_secs), reason),
            RecoveryAction::RestartPhase { phase } => Self::restart_phase(phase, reason),
            RecoveryAction::RestartSession => Self::restart_session(reason),
            RecoveryAction::Abort => Self::abort(reason),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.delay {
            Some(delay) => write!(f, "{} in {}s: {}", self.action, delay.as_secs(), self.reason),
            None => write!(f, "{}: {}", self.action, self.reason),
        }
    }
}

/// Session-level retry delay: `1s × 2^retry_count`, at most 30s.
pub fn retry_delay(retry_count: u32) -> Duration {
    backoff::delay(RETRY_BASE, RETRY_CAP, retry_count)
}

/// Map a failure of `session` to an action.
///
/// `session.retry_count` already counts this failure, so "retry up to N
/// times" means retrying while the count is at most N.
pub fn decide_action(session: &Session, failure: &Failure, settings: &RecoverySection) -> Decision {
    let current = session.cursor.phase;
    let retries_left = session.retry_count <= settings.timeout_retry_limit;
    match failure.kind {
        FailureKind::RateLimit => {
            let delay = failure
                .retry_after
                .unwrap_or(Duration::from_secs(settings.rate_limit_wait_secs));
            Decision::wait(delay, "Rate limited by collaborator")
        }
        FailureKind::PayloadTooLarge => {
            Decision::restart_phase(current, "Request exceeded the collaborator's size limit")
        }
        FailureKind::Timeout if retries_left => Decision::retry(session.retry_count, "Collaborator timed out"),
        FailureKind::Timeout => Decision::restart_phase(current, "Timed out repeatedly"),
        FailureKind::Malformed if retries_left => {
            Decision::retry(session.retry_count, "Collaborator returned malformed output")
        }
        FailureKind::Malformed => Decision::restart_phase(current, "Malformed output persisted across retries"),
        FailureKind::MissingData => {
            let phase = missing_phase(&failure.message)
                .filter(|p| (1..=current).contains(p))
                .unwrap_or(current);
            Decision::restart_phase(phase, "Required data is missing")
        }
        FailureKind::TaskExhausted => Decision::restart_phase(current, "A task ran out of retries"),
        FailureKind::Dependency => Decision::restart_phase(current, "Pipeline dependency violated"),
        FailureKind::Network | FailureKind::Unknown => {
            Decision::retry(session.retry_count, format!("Retrying after {} failure", failure.kind))
        }
    }
}

fn missing_phase(message: &str) -> Option<u32> {
    MISSING_PHASE_REGEX
        .captures(message)
        .and_then(|caps| caps[1].parse().ok())
}

/// Choose one action for the session described by `report`.
pub fn plan_recovery(session: &Session, report: &HealthReport, settings: &RecoverySection) -> Option<Decision> {
    if session.status == SessionStatus::Completed {
        return None;
    }
    if report.issues.iter().any(|i| matches!(i, HealthIssue::Retired { .. })) {
        return None;
    }

    let exhausted = report
        .issues
        .iter()
        .any(|i| matches!(i, HealthIssue::RetryExhausted { .. }));
    if exhausted && session.generation >= settings.max_session_restarts {
        return Some(Decision::abort(format!(
            "Retries exhausted after {} session restarts",
            session.generation
        )));
    }
    if exhausted {
        return Some(Decision::restart_session(format!(
            "Retry ceiling of {} reached",
            settings.retry_ceiling
        )));
    }

    let lowest_broken = report
        .issues
        .iter()
        .filter_map(|i| match i {
            HealthIssue::Inconsistent { phase } => Some(*phase),
            HealthIssue::DependencyViolation { phase } => Some(phase.saturating_sub(1).max(1)),
            _ => None,
        })
        .min();
    if let Some(phase) = lowest_broken {
        return Some(Decision::restart_phase(phase, "Phase records are inconsistent"));
    }

    for issue in &report.issues {
        if let HealthIssue::Failed { last_error } = issue {
            return Some(decide_action(session, &Failure::from_message(last_error), settings));
        }
    }

    for issue in &report.issues {
        if let HealthIssue::Stalled { idle_secs } = issue {
            return Some(Decision::restart_phase(
                session.cursor.phase,
                format!("No progress for {}s", idle_secs),
            ));
        }
    }

    None
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
