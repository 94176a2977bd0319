//! Progress events published by the executor, queue and recovery manager.

use cotflow_common::Step;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while sessions move through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A step began, inline or by enqueuing tasks.
    StepStarted {
        session_id: String,
        phase: u32,
        step: Step,
        queued: bool,
    },
    /// A step's result was persisted and the cursor moved.
    StepCompleted {
        session_id: String,
        phase: u32,
        step: Step,
    },
    /// A step failed and the failure was recorded on the session.
    StepFailed {
        session_id: String,
        phase: u32,
        step: Step,
        error: String,
    },
    TaskCompleted {
        task_id: String,
        session_id: String,
    },
    /// A task attempt failed. `terminal` is set once it will not run again.
    TaskFailed {
        task_id: String,
        session_id: String,
        attempts: u32,
        terminal: bool,
        error: String,
    },
    /// A recovery action was persisted.
    RecoveryApplied {
        session_id: String,
        action: String,
        /// Id of the replacement session after a session restart.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_session_id: Option<String>,
    },
    /// The final INTEGRATE of a session completed.
    SessionCompleted { session_id: String },
}

/// Fan-out channel for `PipelineEvent`s. Publishing never blocks; with no
/// subscriber the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        self.tx.send(event).ok();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
