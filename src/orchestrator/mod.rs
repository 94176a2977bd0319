//! Orchestrator: wires the store, executor, queue, recovery manager and
//! scheduler into one handle, and exposes the caller-facing operations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cotflow_common::{PhaseRecord, Session, SessionConfig, SessionStatus, TaskSummary};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::Collaborators;
use crate::config::{ContinuationMode, CotflowConfig, CotflowToml};
use crate::events::{EventBus, PipelineEvent};
use crate::executor::{ExecutorSettings, PhaseExecutor};
use crate::queue::{QueueSettings, TaskQueue};
use crate::recovery::{AppliedRecovery, HealthReport, RecoveryAction, RecoveryManager};
use crate::scheduler::{
    Continuation, Driven, InProcessContinuation, Scheduler, SchedulerSettings, WebhookContinuation,
};
use crate::store::{DbHandle, PipelineDb};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything known about one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session: Session,
    pub phases: Vec<PhaseRecord>,
    pub tasks: TaskSummary,
}

pub struct Orchestrator {
    db: DbHandle,
    clock: Arc<dyn Clock>,
    events: EventBus,
    queue: TaskQueue,
    scheduler: Scheduler,
    /// Local signal path. Held even in webhook mode so the receiver stays open.
    local: InProcessContinuation,
    continuations: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Orchestrator {
    /// Open the project database and build real collaborators.
    pub fn open(config: &CotflowConfig) -> Result<Self> {
        for warning in config.validate() {
            warn!(%warning, "Configuration warning");
        }
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = DbHandle::new(PipelineDb::new(&db_path)?);
        let collaborators = Collaborators::from_config(&config.toml)?;

        let (local, rx) = InProcessContinuation::channel();
        let continuation: Arc<dyn Continuation> = match (&config.toml.continuation.mode, &config.toml.continuation.endpoint) {
            (ContinuationMode::Webhook, Some(endpoint)) => {
                info!(%endpoint, "Continuations delivered by webhook");
                Arc::new(WebhookContinuation::new(endpoint, WEBHOOK_TIMEOUT)?)
            }
            (ContinuationMode::Webhook, None) => {
                warn!("Webhook continuation has no endpoint, using in-process delivery");
                Arc::new(local.clone())
            }
            (ContinuationMode::InProcess, _) => Arc::new(local.clone()),
        };

        Ok(Self::assemble(
            db,
            &config.toml,
            collaborators,
            Arc::new(SystemClock),
            continuation,
            local,
            rx,
        ))
    }

    /// Build from explicit parts with in-process continuations.
    pub fn with_parts(
        db: DbHandle,
        toml: &CotflowToml,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (local, rx) = InProcessContinuation::channel();
        let continuation: Arc<dyn Continuation> = Arc::new(local.clone());
        Self::assemble(db, toml, collaborators, clock, continuation, local, rx)
    }

    fn assemble(
        db: DbHandle,
        toml: &CotflowToml,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        continuation: Arc<dyn Continuation>,
        local: InProcessContinuation,
        rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let events = EventBus::default();
        let queue = TaskQueue::new(
            db.clone(),
            collaborators.clone(),
            clock.clone(),
            continuation,
            QueueSettings::from_config(&toml.queue),
        )
        .with_events(events.clone());
        let executor = PhaseExecutor::new(
            db.clone(),
            Arc::new(toml.pipeline.clone()),
            collaborators.reasoning.clone(),
            clock.clone(),
            ExecutorSettings::from_config(toml),
        )
        .with_events(events.clone())
        .with_waker(queue.waker());
        let recovery = RecoveryManager::new(
            db.clone(),
            clock.clone(),
            toml.recovery.clone(),
            toml.queue.max_retries,
        )
        .with_events(events.clone());
        let scheduler = Scheduler::new(
            db.clone(),
            Arc::new(executor),
            recovery,
            clock.clone(),
            SchedulerSettings::from_config(toml),
        );

        Self {
            db,
            clock,
            events,
            queue,
            scheduler,
            local,
            continuations: Mutex::new(Some(rx)),
        }
    }

    /// Subscribe to pipeline progress.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Persist a new PENDING session at phase 1 THINK.
    pub async fn create_session(&self, config: SessionConfig) -> Result<Session> {
        if config.topic.trim().is_empty() {
            anyhow::bail!("Session topic must not be empty");
        }
        let session = Session::new(config, self.clock.now());
        let row = session.clone();
        self.db.call(move |db| db.insert_session(&row)).await?;
        info!(session_id = %session.id, topic = %session.config.topic, "Session created");
        self.local.resume(&session.id).await;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let id = session_id.to_string();
        self.db
            .call(move |db| db.get_session(&id))
            .await?
            .with_context(|| format!("Session {} not found", session_id))
    }

    /// Session row, phase records and task counts.
    pub async fn get_session_status(&self, session_id: &str) -> Result<SessionView> {
        let id = session_id.to_string();
        let max = self.queue.settings().max_retries;
        let view = self
            .db
            .call(move |db| {
                let Some(session) = db.get_session(&id)? else {
                    return Ok(None);
                };
                let phases = db.get_phases(&id)?;
                let tasks = db.task_summary(&id, max)?;
                Ok(Some(SessionView {
                    session,
                    phases,
                    tasks,
                }))
            })
            .await?;
        view.with_context(|| format!("Session {} not found", session_id))
    }

    pub async fn get_session_tasks(&self, session_id: &str) -> Result<TaskSummary> {
        self.get_session(session_id).await?;
        self.queue.task_summary(session_id).await
    }

    pub async fn list_sessions(&self, status: Option<SessionStatus>, limit: usize) -> Result<Vec<Session>> {
        self.db.call(move |db| db.list_sessions(status, limit)).await
    }

    // ── Recovery ──────────────────────────────────────────────────────

    pub async fn check_health(&self, session_id: &str) -> Result<HealthReport> {
        Ok(self.scheduler.recovery().check_health(session_id).await?)
    }

    /// Apply `action`, or the planned action when `None`. A running
    /// scheduler is signalled to pick the session up again.
    pub async fn trigger_recovery(
        &self,
        session_id: &str,
        action: Option<RecoveryAction>,
    ) -> Result<Option<AppliedRecovery>> {
        let applied = self
            .scheduler
            .recovery()
            .trigger_recovery(session_id, action)
            .await?;
        if let Some(applied) = &applied {
            if applied.session.status != SessionStatus::Failed {
                self.local.resume(applied.active_session_id()).await;
            }
        }
        Ok(applied)
    }

    // ── Driving ───────────────────────────────────────────────────────

    /// Run steps of one session until it stops making immediate progress.
    pub async fn drive(&self, session_id: &str) -> Result<Driven> {
        self.scheduler.drive(session_id).await
    }

    /// Start the task queue and drive one session until it completes or
    /// halts. The queue is stopped afterwards.
    pub async fn run_session_to_end(&self, session_id: &str) -> Result<Driven> {
        let mut guard = self.continuations.lock().await;
        let rx = guard
            .as_mut()
            .context("Continuations are already consumed by a running service")?;

        let worker = self.queue.start();
        let result = self.scheduler.drive_to_end(session_id, rx).await;
        self.queue.shutdown();
        if let Err(e) = worker.await {
            warn!(error = %e, "Task queue ended abnormally");
        }
        result
    }

    /// Run the task queue and the scheduler until `shutdown` flips.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let rx = self
            .continuations
            .lock()
            .await
            .take()
            .context("Orchestrator is already serving")?;

        let worker = self.queue.start();
        self.scheduler.run(rx, shutdown).await;
        self.queue.shutdown();
        if let Err(e) = worker.await {
            warn!(error = %e, "Task queue ended abnormally");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::StepOutcome;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use cotflow_common::{
        Citation, CollaboratorError, ReasoningClient, ReasoningRequest, ReasoningResponse, SearchClient,
        SearchRequest, SearchResponse, Step,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request with a JSON object holding the expected fields.
    struct Echo {
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl ReasoningClient for Echo {
        async fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, CollaboratorError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CollaboratorError::PayloadTooLarge("context length exceeded".into()));
            }
            let mut object = serde_json::Map::new();
            for field in &request.expected_fields {
                let value = if field == "queries" {
                    serde_json::json!(["first query", "second query"])
                } else {
                    serde_json::json!(format!("{} text", field))
                };
                object.insert(field.clone(), value);
            }
            Ok(ReasoningResponse {
                content: serde_json::Value::Object(object).to_string(),
                model: None,
                usage: None,
            })
        }
    }

    struct Found;

    #[async_trait]
    impl SearchClient for Found {
        async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, CollaboratorError> {
            Ok(SearchResponse {
                content: format!("results for {}", request.query),
                citations: vec![Citation {
                    url: "https://news.example/1".into(),
                    title: None,
                }],
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn orchestrator(fail_first: usize) -> Orchestrator {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let collaborators = Collaborators {
            reasoning: Arc::new(Echo {
                fail_first: AtomicUsize::new(fail_first),
            }),
            search: Arc::new(Found),
        };
        Orchestrator::with_parts(
            db,
            &CotflowToml::default(),
            collaborators,
            Arc::new(ManualClock::new(t0())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_starts_at_first_think() {
        let orch = orchestrator(0);
        let session = orch
            .create_session(SessionConfig::new("solid-state batteries", "witty", "linkedin"))
            .await
            .unwrap();

        let view = orch.get_session_status(&session.id).await.unwrap();
        assert_eq!(view.session.status, SessionStatus::Pending);
        assert_eq!(view.session.cursor.phase, 1);
        assert_eq!(view.session.cursor.step, Step::Think);
        assert!(view.phases.is_empty());
        assert_eq!(view.tasks.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_rejects_blank_topic() {
        let orch = orchestrator(0);
        assert!(orch.create_session(SessionConfig::new("  ", "witty", "x")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_is_an_error() {
        let orch = orchestrator(0);
        assert!(orch.get_session_status("nope").await.is_err());
        assert!(orch.get_session_tasks("nope").await.is_err());
        assert!(orch.check_health("nope").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_session_to_end_completes_every_phase() {
        let orch = orchestrator(0);
        let session = orch
            .create_session(SessionConfig::new("rust", "witty", "x"))
            .await
            .unwrap();

        let driven = orch.run_session_to_end(&session.id).await.unwrap();
        assert_eq!(driven.outcome, StepOutcome::Completed);

        let view = orch.get_session_status(&session.id).await.unwrap();
        assert_eq!(view.session.status, SessionStatus::Completed);
        assert_eq!(view.phases.len(), 3);
        assert!(view.phases.iter().all(|p| Step::all().iter().all(|s| p.has_result(*s))));
        assert_eq!(view.tasks.total, view.tasks.completed);
        assert!(orch.check_health(&session.id).await.unwrap().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_recovery_resumes_a_halted_session() {
        let orch = orchestrator(1);
        let session = orch
            .create_session(SessionConfig::new("rust", "witty", "x"))
            .await
            .unwrap();

        let driven = orch.drive(&session.id).await.unwrap();
        assert!(matches!(driven.outcome, StepOutcome::Halted { .. }));

        let applied = orch
            .trigger_recovery(&session.id, None)
            .await
            .unwrap()
            .expect("a failed session has a plan");
        assert_eq!(applied.decision.action, RecoveryAction::RestartPhase { phase: 1 });
        assert_eq!(applied.session.status, SessionStatus::Pending);

        let driven = orch.run_session_to_end(&session.id).await.unwrap();
        assert_eq!(driven.outcome, StepOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_sessions_filters_by_status() {
        let orch = orchestrator(0);
        orch.create_session(SessionConfig::new("a", "s", "p")).await.unwrap();
        orch.create_session(SessionConfig::new("b", "s", "p")).await.unwrap();

        assert_eq!(orch.list_sessions(None, 10).await.unwrap().len(), 2);
        assert_eq!(orch.list_sessions(Some(SessionStatus::Pending), 10).await.unwrap().len(), 2);
        assert!(orch.list_sessions(Some(SessionStatus::Completed), 10).await.unwrap().is_empty());
    }
}
