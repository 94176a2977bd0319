//! Typed error hierarchy for the cotflow orchestrator.
//!
//! Two top-level enums cover the two subsystems that report to callers:
//! - `StepError`: a step of a session could not be performed
//! - `RecoveryError`: a recovery action was rejected or could not be applied
//!
//! Both classify into a `FailureKind`, which the recovery policy maps to an
//! action. Persisted `last_error` text carries the kind as a `[kind]` tag.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use cotflow_common::{CollaboratorError, PayloadError, Step};
use regex::Regex;
use thiserror::Error;

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\[([a-z_]+)\]\s*(.*)$").unwrap());

static WAIT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(seconds?|secs?|minutes?|mins?)\b").unwrap());

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limits, timeouts and network faults. Retrying may succeed.
    Transient,
    /// Malformed output, missing fields, size limits. The same input fails again.
    Structural,
    /// Retry ceiling exhausted or the pipeline is in an impossible state.
    Fatal,
}

/// Concrete failure category recorded on sessions and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    RateLimit,
    Timeout,
    Network,
    PayloadTooLarge,
    Malformed,
    MissingData,
    TaskExhausted,
    Dependency,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Malformed => "malformed",
            Self::MissingData => "missing_data",
            Self::TaskExhausted => "task_exhausted",
            Self::Dependency => "dependency",
            Self::Unknown => "unknown",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimit | Self::Timeout | Self::Network | Self::Unknown => {
                ErrorClass::Transient
            }
            Self::PayloadTooLarge | Self::Malformed | Self::MissingData => ErrorClass::Structural,
            Self::TaskExhausted | Self::Dependency => ErrorClass::Fatal,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit" => Ok(Self::RateLimit),
            "timeout" => Ok(Self::Timeout),
            "network" => Ok(Self::Network),
            "payload_too_large" => Ok(Self::PayloadTooLarge),
            "malformed" => Ok(Self::Malformed),
            "missing_data" => Ok(Self::MissingData),
            "task_exhausted" => Ok(Self::TaskExhausted),
            "dependency" => Ok(Self::Dependency),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid failure kind: {}", s)),
        }
    }
}

/// A classified failure, either fresh from a typed error or recovered from
/// persisted `last_error` text.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Wait hint from the failing service, when it named one.
    pub retry_after: Option<Duration>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// `[kind] message`, the form written into `last_error` and task errors.
    pub fn tagged(&self) -> String {
        format!("[{}] {}", self.kind, self.message)
    }

    pub fn from_collaborator(err: &CollaboratorError) -> Self {
        let retry_after = match err {
            CollaboratorError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        };
        Self {
            kind: collaborator_kind(err),
            message: err.to_string(),
            retry_after,
        }
    }

    /// Classify persisted error text.
    ///
    /// A leading `[kind]` tag wins. Untagged text (written by older
    /// processes or by hand) falls back to matching known signatures.
    pub fn from_message(text: &str) -> Self {
        let retry_after = wait_hint(text);
        if let Some(caps) = TAG_REGEX.captures(text.trim())
            && let Ok(kind) = caps[1].parse::<FailureKind>()
        {
            return Self {
                kind,
                message: caps[2].to_string(),
                retry_after,
            };
        }
        Self {
            kind: signature_kind(text),
            message: text.to_string(),
            retry_after,
        }
    }
}

fn signature_kind(text: &str) -> FailureKind {
    let lower = text.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["rate limit", "429", "too many requests"]) {
        FailureKind::RateLimit
    } else if has(&["context length", "token limit", "maximum context", "too large", "413"]) {
        FailureKind::PayloadTooLarge
    } else if has(&["timeout", "timed out"]) {
        FailureKind::Timeout
    } else if has(&["result not found", "missing data"]) {
        FailureKind::MissingData
    } else if has(&["json", "parse", "unexpected token", "missing required field"]) {
        FailureKind::Malformed
    } else if has(&["network", "connection", "econnrefused", "fetch failed"]) {
        FailureKind::Network
    } else {
        FailureKind::Unknown
    }
}

/// "retry in 20 seconds", "wait 2 minutes".
fn wait_hint(text: &str) -> Option<Duration> {
    let caps = WAIT_REGEX.captures(text)?;
    let amount: u64 = caps[1].parse().ok()?;
    let unit = caps[2].to_lowercase();
    if unit.starts_with("min") {
        Some(Duration::from_secs(amount * 60))
    } else {
        Some(Duration::from_secs(amount))
    }
}

/// Kind of a collaborator error.
pub fn collaborator_kind(err: &CollaboratorError) -> FailureKind {
    match err {
        CollaboratorError::RateLimited { .. } => FailureKind::RateLimit,
        CollaboratorError::Timeout { .. } => FailureKind::Timeout,
        CollaboratorError::PayloadTooLarge(_) => FailureKind::PayloadTooLarge,
        CollaboratorError::Malformed(_) => FailureKind::Malformed,
        CollaboratorError::Transport(_) => FailureKind::Network,
        CollaboratorError::Status { code, .. } if *code >= 500 => FailureKind::Network,
        CollaboratorError::Status { .. } => FailureKind::Unknown,
        CollaboratorError::NotConfigured(_) => FailureKind::Unknown,
    }
}

/// Errors from performing one step of a session.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Phase {phase} is not part of the pipeline ({phase_count} phases)")]
    UnknownPhase { phase: u32, phase_count: u32 },

    #[error("Collaborator call failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Malformed output: {0}")]
    MalformedOutput(#[from] PayloadError),

    #[error("Step timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    #[error("{step} result not found for phase {phase}")]
    MissingData { phase: u32, step: Step },

    #[error("Task {task_id} failed after {attempts} attempts: {message}")]
    TaskFailed {
        task_id: String,
        attempts: u32,
        kind: FailureKind,
        message: String,
    },

    #[error("Database error: {0}")]
    Store(#[source] anyhow::Error),
}

impl StepError {
    /// A task of the step ran out of retries. `error` is the task's
    /// persisted error text; structural causes keep their kind so recovery
    /// can tell an oversized request from plain exhaustion.
    pub fn task_failed(task_id: &str, attempts: u32, error: &str) -> Self {
        let cause = Failure::from_message(error);
        let kind = match cause.kind.class() {
            ErrorClass::Structural => cause.kind,
            _ => FailureKind::TaskExhausted,
        };
        Self::TaskFailed {
            task_id: task_id.to_string(),
            attempts,
            kind,
            message: cause.message,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SessionNotFound { .. } | Self::UnknownPhase { .. } => FailureKind::Dependency,
            Self::Collaborator(e) => collaborator_kind(e),
            Self::MalformedOutput(_) => FailureKind::Malformed,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::MissingData { .. } => FailureKind::MissingData,
            Self::TaskFailed { kind, .. } => *kind,
            Self::Store(_) => FailureKind::Unknown,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }

    /// Whether the failure is recorded against the session. Lookups of
    /// missing sessions and database faults are not.
    pub fn is_recorded(&self) -> bool {
        !matches!(self, Self::SessionNotFound { .. } | Self::Store(_))
    }

    pub fn failure(&self) -> Failure {
        let retry_after = match self {
            Self::Collaborator(e) => Failure::from_collaborator(e).retry_after,
            _ => None,
        };
        Failure {
            kind: self.kind(),
            message: self.to_string(),
            retry_after,
        }
    }
}

/// Errors from the recovery manager.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Cannot restart phase {requested}: session is at phase {current}")]
    InvalidPhase { requested: u32, current: u32 },

    #[error("Session {id} is already completed")]
    AlreadyCompleted { id: String },

    #[error("Invalid recovery action: {0}")]
    InvalidAction(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
