//! Phase executor.
//!
//! `run_step` performs exactly one step of one session: it re-reads the
//! session from the store, asks the state machine what is due and does
//! that one thing. It keeps no state between calls and never retries;
//! a failure is recorded on the session and returned to the caller, which
//! hands it to the recovery manager.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cotflow_common::{
    Cursor, ExecuteResult, IntegrateResult, NewTask, PayloadError, PhaseRecord, ReasoningClient,
    SearchOutcome, SearchRequest, Session, Step, StepResult, Task, TaskRequest, TaskResponse,
    TaskType, ThinkResult,
};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CotflowToml;
use crate::errors::StepError;
use crate::events::{EventBus, PipelineEvent};
use crate::machine::{NextStep, next_step};
use crate::plan::{ExecMode, PhaseSpec, PipelinePlan, PromptVars, StepSpec, reasoning_request, render};
use crate::store::{DbHandle, StepStart};

/// What a call to `run_step` achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step's result was persisted and the cursor moved to `to`.
    Advanced { from: Cursor, to: Cursor },
    /// Tasks were queued for the step; the queue resumes the session.
    Enqueued { cursor: Cursor, task_ids: Vec<String> },
    /// Tasks of the step are still outstanding.
    Awaiting { cursor: Cursor, pending: usize },
    /// A retry is scheduled for `until`.
    Waiting { until: DateTime<Utc> },
    /// The session is COMPLETED.
    Completed,
    /// The session is FAILED and needs a recovery action.
    Halted { reason: String },
    /// Another writer moved the session while the step ran; nothing was
    /// written.
    Superseded,
    /// Another driver already started this step and has not finished it.
    InProgress { cursor: Cursor },
}

impl StepOutcome {
    /// Whether calling `run_step` again right away can make progress.
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Superseded)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Bound on an inline reasoning call.
    pub step_timeout: Duration,
    /// Upper bound on searches fanned out by one EXECUTE step.
    pub max_queries: usize,
    pub max_retries: u32,
}

impl ExecutorSettings {
    pub fn from_config(toml: &CotflowToml) -> Self {
        Self {
            step_timeout: Duration::from_secs(toml.scheduler.step_timeout_secs),
            max_queries: toml.search.max_queries,
            max_retries: toml.queue.max_retries,
        }
    }
}

/// Everything `run_step` reads before deciding.
struct Snapshot {
    session: Session,
    phases: Vec<PhaseRecord>,
    tasks: Vec<Task>,
}

pub struct PhaseExecutor {
    db: DbHandle,
    plan: Arc<PipelinePlan>,
    reasoning: Arc<dyn ReasoningClient>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    waker: Arc<Notify>,
    settings: ExecutorSettings,
}

impl PhaseExecutor {
    pub fn new(
        db: DbHandle,
        plan: Arc<PipelinePlan>,
        reasoning: Arc<dyn ReasoningClient>,
        clock: Arc<dyn Clock>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            db,
            plan,
            reasoning,
            clock,
            events: EventBus::default(),
            waker: Arc::new(Notify::new()),
            settings,
        }
    }

    /// Publish progress on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Notified whenever the executor queues tasks.
    pub fn with_waker(mut self, waker: Arc<Notify>) -> Self {
        self.waker = waker;
        self
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    /// Perform the next due step of `session_id`.
    pub async fn run_step(&self, session_id: &str) -> Result<StepOutcome, StepError> {
        let snapshot = self.load(session_id).await?;
        let now = self.clock.now();
        let next = next_step(
            &snapshot.session,
            &snapshot.phases,
            &snapshot.tasks,
            now,
            self.plan.phase_count(),
            self.settings.max_retries,
        );

        match self.perform(&snapshot, next).await {
            Err(err) if err.is_recorded() => {
                self.record_failure(&snapshot.session, &err).await?;
                Err(err)
            }
            other => other,
        }
    }

    async fn load(&self, session_id: &str) -> Result<Snapshot, StepError> {
        let id = session_id.to_string();
        let loaded = self
            .db
            .call(move |db| {
                let Some(session) = db.get_session(&id)? else {
                    return Ok(None);
                };
                let phases = db.get_phases(&id)?;
                let tasks = db.step_tasks(&id, session.cursor.phase, session.cursor.step)?;
                Ok(Some(Snapshot {
                    session,
                    phases,
                    tasks,
                }))
            })
            .await
            .map_err(StepError::Store)?;
        loaded.ok_or_else(|| StepError::SessionNotFound {
            id: session_id.to_string(),
        })
    }

    async fn perform(&self, snapshot: &Snapshot, next: NextStep) -> Result<StepOutcome, StepError> {
        let session = &snapshot.session;
        match next {
            NextStep::Done => Ok(StepOutcome::Completed),
            NextStep::Halted { reason } => Ok(StepOutcome::Halted { reason }),
            NextStep::Wait { until } => Ok(StepOutcome::Waiting { until }),
            NextStep::Await { cursor, pending } => Ok(StepOutcome::Awaiting { cursor, pending }),
            NextStep::Advance { from, to } => self.advance(session, from, None, to).await,
            NextStep::TaskFailed {
                task_id,
                attempts,
                error,
                ..
            } => Err(StepError::task_failed(&task_id, attempts, &error)),
            NextStep::Run { cursor } => {
                let spec = self.phase_spec(cursor.phase)?;
                match cursor.step {
                    Step::Think | Step::Integrate => {
                        self.run_reasoning(session, &snapshot.phases, spec, cursor).await
                    }
                    Step::Execute => self.run_execute(session, &snapshot.phases, spec, cursor).await,
                }
            }
            NextStep::Collect { cursor, task_ids } => {
                let tasks: Vec<&Task> = task_ids
                    .iter()
                    .filter_map(|id| snapshot.tasks.iter().find(|t| &t.id == id))
                    .collect();
                let result = collect_result(cursor, &tasks)?;
                let to = cursor.next(self.plan.phase_count());
                self.advance(session, cursor, Some(result), to).await
            }
        }
    }

    fn phase_spec(&self, phase: u32) -> Result<&PhaseSpec, StepError> {
        self.plan.phase(phase).ok_or(StepError::UnknownPhase {
            phase,
            phase_count: self.plan.phase_count(),
        })
    }

    /// THINK or INTEGRATE: inline call or one REASONING task.
    async fn run_reasoning(
        &self,
        session: &Session,
        phases: &[PhaseRecord],
        spec: &PhaseSpec,
        cursor: Cursor,
    ) -> Result<StepOutcome, StepError> {
        let (step_spec, required): (&StepSpec, &[&str]) = match cursor.step {
            Step::Think => (&spec.think, &["queries"][..]),
            _ => (&spec.integrate, &[][..]),
        };
        let evidence = match cursor.step {
            Step::Integrate => find_phase(phases, cursor.phase)
                .and_then(|p| p.execute_result.as_ref())
                .map(ExecuteResult::as_evidence)
                .ok_or(StepError::MissingData {
                    phase: cursor.phase,
                    step: Step::Execute,
                })?,
            _ => String::new(),
        };
        let vars = PromptVars {
            config: &session.config,
            goal: &spec.goal,
            previous: self.previous_outputs(phases, cursor.phase)?,
            evidence,
        };
        let request = reasoning_request(step_spec, &vars, required);

        match step_spec.mode {
            ExecMode::Queued => {
                let task = NewTask {
                    session_id: session.id.clone(),
                    phase_number: cursor.phase,
                    step: cursor.step,
                    slot: 0,
                    epoch: session.epoch,
                    request: TaskRequest::Reasoning(request),
                };
                self.enqueue(session, cursor, vec![task]).await
            }
            ExecMode::Sync => {
                match self.start(session, cursor, Vec::new()).await? {
                    StepStart::Started(_) => {}
                    other => return Ok(Self::not_started(session, cursor, other)),
                }
                self.emit_started(session, cursor, false);
                info!(session_id = %session.id, phase = cursor.phase, step = %cursor.step, "Calling reasoning collaborator");

                let after = self.settings.step_timeout;
                let response = tokio::time::timeout(after, self.reasoning.reason(&request))
                    .await
                    .map_err(|_| StepError::Timeout { after })??;
                let result = reasoning_result(cursor.step, &response.content, &request.expected_fields)?;
                let to = cursor.next(self.plan.phase_count());
                self.advance(session, cursor, Some(result), to).await
            }
        }
    }

    /// EXECUTE: one SEARCH task per planned query.
    async fn run_execute(
        &self,
        session: &Session,
        phases: &[PhaseRecord],
        spec: &PhaseSpec,
        cursor: Cursor,
    ) -> Result<StepOutcome, StepError> {
        let think = find_phase(phases, cursor.phase)
            .and_then(|p| p.think_result.as_ref())
            .ok_or(StepError::MissingData {
                phase: cursor.phase,
                step: Step::Think,
            })?;

        if think.queries.is_empty() {
            info!(session_id = %session.id, phase = cursor.phase, "No searches planned, skipping EXECUTE");
            let to = cursor.next(self.plan.phase_count());
            return self
                .advance(session, cursor, Some(StepResult::Execute(ExecuteResult::default())), to)
                .await;
        }
        if think.queries.len() > self.settings.max_queries {
            warn!(
                session_id = %session.id,
                planned = think.queries.len(),
                max = self.settings.max_queries,
                "Too many searches planned, keeping the first ones"
            );
        }

        let vars = PromptVars {
            config: &session.config,
            goal: &spec.goal,
            previous: String::new(),
            evidence: String::new(),
        };
        let context = spec.search.context.as_deref().map(|c| render(c, &vars));
        let tasks = think
            .queries
            .iter()
            .take(self.settings.max_queries)
            .enumerate()
            .map(|(slot, q)| NewTask {
                session_id: session.id.clone(),
                phase_number: cursor.phase,
                step: Step::Execute,
                slot: slot as u32,
                epoch: session.epoch,
                request: TaskRequest::Search(SearchRequest {
                    query: q.query.clone(),
                    recency: spec.search.recency,
                    context: context.clone(),
                }),
            })
            .collect();
        self.enqueue(session, cursor, tasks).await
    }

    /// `{previous}`: integrate outputs of every earlier phase, keyed by
    /// phase name.
    fn previous_outputs(&self, phases: &[PhaseRecord], current: u32) -> Result<String, StepError> {
        if current <= 1 {
            return Ok(String::new());
        }
        let mut outputs = Map::new();
        for number in 1..current {
            let output = find_phase(phases, number)
                .and_then(|p| p.integrate_result.as_ref())
                .ok_or(StepError::MissingData {
                    phase: number,
                    step: Step::Integrate,
                })?;
            let name = self
                .plan
                .phase(number)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("phase_{}", number));
            outputs.insert(name, Value::Object(output.output.clone()));
        }
        serde_json::to_string_pretty(&outputs)
            .map_err(|e| StepError::Store(anyhow::anyhow!("Failed to render previous outputs: {}", e)))
    }

    async fn start(
        &self,
        session: &Session,
        cursor: Cursor,
        tasks: Vec<NewTask>,
    ) -> Result<StepStart, StepError> {
        let id = session.id.clone();
        let epoch = session.epoch;
        let now = self.clock.now();
        let reclaim_before =
            now - chrono::Duration::from_std(self.settings.step_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        self.db
            .call(move |db| db.start_step(&id, epoch, cursor, &tasks, reclaim_before, now))
            .await
            .map_err(StepError::Store)
    }

    fn not_started(session: &Session, cursor: Cursor, start: StepStart) -> StepOutcome {
        match start {
            StepStart::AlreadyStarted => {
                debug!(session_id = %session.id, cursor = %cursor, "Step already started by another driver");
                StepOutcome::InProgress { cursor }
            }
            _ => StepOutcome::Superseded,
        }
    }

    async fn enqueue(
        &self,
        session: &Session,
        cursor: Cursor,
        tasks: Vec<NewTask>,
    ) -> Result<StepOutcome, StepError> {
        let count = tasks.len();
        let task_ids = match self.start(session, cursor, tasks).await? {
            StepStart::Started(ids) => ids,
            other => return Ok(Self::not_started(session, cursor, other)),
        };
        info!(session_id = %session.id, phase = cursor.phase, step = %cursor.step, tasks = count, "Queued step tasks");
        self.emit_started(session, cursor, true);
        self.waker.notify_one();
        Ok(StepOutcome::Enqueued { cursor, task_ids })
    }

    async fn advance(
        &self,
        session: &Session,
        from: Cursor,
        result: Option<StepResult>,
        to: Option<Cursor>,
    ) -> Result<StepOutcome, StepError> {
        let id = session.id.clone();
        let epoch = session.epoch;
        let now = self.clock.now();
        let moved = self
            .db
            .call(move |db| db.complete_step(&id, epoch, from, result.as_ref(), to, now))
            .await
            .map_err(|e| match e.downcast::<StepError>() {
                Ok(step) => step,
                Err(e) => StepError::Store(e),
            })?;
        if !moved {
            warn!(session_id = %session.id, cursor = %from, "Session moved on while the step ran, result dropped");
            return Ok(StepOutcome::Superseded);
        }

        info!(session_id = %session.id, phase = from.phase, step = %from.step, "Step completed");
        self.events.emit(PipelineEvent::StepCompleted {
            session_id: session.id.clone(),
            phase: from.phase,
            step: from.step,
        });
        match to {
            Some(to) => Ok(StepOutcome::Advanced { from, to }),
            None => {
                info!(session_id = %session.id, "Session completed");
                self.events.emit(PipelineEvent::SessionCompleted {
                    session_id: session.id.clone(),
                });
                Ok(StepOutcome::Completed)
            }
        }
    }

    /// FAILED, tagged `last_error`, `retry_count + 1`; only if the session
    /// is still in the epoch the step ran in.
    async fn record_failure(&self, session: &Session, err: &StepError) -> Result<(), StepError> {
        let tagged = err.failure().tagged();
        let id = session.id.clone();
        let epoch = session.epoch;
        let now = self.clock.now();
        let text = tagged.clone();
        let recorded = self
            .db
            .call(move |db| db.record_failure(&id, Some(epoch), &text, now))
            .await
            .map_err(StepError::Store)?;
        if recorded {
            warn!(session_id = %session.id, cursor = %session.cursor, error = %tagged, "Step failed");
            self.events.emit(PipelineEvent::StepFailed {
                session_id: session.id.clone(),
                phase: session.cursor.phase,
                step: session.cursor.step,
                error: tagged,
            });
        }
        Ok(())
    }

    fn emit_started(&self, session: &Session, cursor: Cursor, queued: bool) {
        self.events.emit(PipelineEvent::StepStarted {
            session_id: session.id.clone(),
            phase: cursor.phase,
            step: cursor.step,
            queued,
        });
    }
}

fn find_phase(phases: &[PhaseRecord], number: u32) -> Option<&PhaseRecord> {
    phases.iter().find(|p| p.phase_number == number)
}

fn reasoning_result(step: Step, content: &str, expected: &[String]) -> Result<StepResult, PayloadError> {
    match step {
        Step::Think => ThinkResult::from_output(content, expected).map(StepResult::Think),
        _ => IntegrateResult::from_output(content, expected).map(StepResult::Integrate),
    }
}

/// Assemble a step result from its completed tasks, in slot order.
fn collect_result(cursor: Cursor, tasks: &[&Task]) -> Result<StepResult, StepError> {
    let step = cursor.step;
    match step {
        Step::Execute => {
            let mut searches = Vec::with_capacity(tasks.len());
            for task in tasks {
                let query = match &task.request {
                    TaskRequest::Search(r) => r.query.clone(),
                    other => {
                        return Err(PayloadError::WrongVariant {
                            expected: TaskType::Search,
                            found: other.task_type(),
                        }
                        .into());
                    }
                };
                match response_of(task)? {
                    TaskResponse::Search(r) => searches.push(SearchOutcome {
                        query,
                        content: r.content.clone(),
                        citations: r.citations.clone(),
                        task_id: Some(task.id.clone()),
                    }),
                    other => {
                        return Err(PayloadError::WrongVariant {
                            expected: TaskType::Search,
                            found: other.task_type(),
                        }
                        .into());
                    }
                }
            }
            Ok(StepResult::Execute(ExecuteResult { searches }))
        }
        Step::Think | Step::Integrate => {
            let task = tasks.first().ok_or(StepError::MissingData {
                phase: cursor.phase,
                step,
            })?;
            let expected = match &task.request {
                TaskRequest::Reasoning(r) => r.expected_fields.clone(),
                TaskRequest::Search(_) => Vec::new(),
            };
            match response_of(task)? {
                TaskResponse::Reasoning(r) => Ok(reasoning_result(step, &r.content, &expected)?),
                other => Err(PayloadError::WrongVariant {
                    expected: TaskType::Reasoning,
                    found: other.task_type(),
                }
                .into()),
            }
        }
    }
}

fn response_of<'a>(task: &'a Task) -> Result<&'a TaskResponse, StepError> {
    task.response.as_ref().ok_or_else(|| {
        StepError::Store(anyhow::anyhow!("Task {} is COMPLETED without a response", task.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::PipelineDb;
    use async_trait::async_trait;
    use cotflow_common::{
        CollaboratorError, PhaseStatus, ReasoningRequest, ReasoningResponse, SearchResponse,
        SessionConfig, SessionStatus, TaskStatus,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Reasoning collaborator answering from a script, in order.
    #[derive(Default)]
    struct ScriptedReasoning {
        answers: Mutex<VecDeque<Result<String, CollaboratorError>>>,
        requests: Mutex<Vec<ReasoningRequest>>,
        delay: Option<Duration>,
    }

    impl ScriptedReasoning {
        fn new(answers: Vec<Result<String, CollaboratorError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<ReasoningRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReasoningClient for ScriptedReasoning {
        async fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, CollaboratorError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let answer = self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CollaboratorError::Transport("script exhausted".into())));
            answer.map(|content| ReasoningResponse {
                content,
                model: Some("scripted".into()),
                usage: None,
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            step_timeout: Duration::from_secs(5),
            max_queries: 3,
            max_retries: 3,
        }
    }

    struct Harness {
        db: DbHandle,
        executor: PhaseExecutor,
        reasoning: Arc<ScriptedReasoning>,
        session_id: String,
    }

    fn harness_with(plan: PipelinePlan, reasoning: ScriptedReasoning) -> Harness {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let session = Session::new(SessionConfig::new("rust async", "witty", "linkedin"), t0());
        db.lock_sync().unwrap().insert_session(&session).unwrap();
        let reasoning = Arc::new(reasoning);
        let executor = PhaseExecutor::new(
            db.clone(),
            Arc::new(plan),
            reasoning.clone(),
            Arc::new(ManualClock::new(t0())),
            settings(),
        );
        Harness {
            db,
            executor,
            reasoning,
            session_id: session.id,
        }
    }

    fn harness(answers: Vec<Result<String, CollaboratorError>>) -> Harness {
        harness_with(PipelinePlan::default(), ScriptedReasoning::new(answers))
    }

    fn think_answer(queries: &[&str]) -> String {
        serde_json::json!({ "approach": "survey news", "queries": queries }).to_string()
    }

    impl Harness {
        fn session(&self) -> Session {
            self.db.lock_sync().unwrap().get_session(&self.session_id).unwrap().unwrap()
        }

        fn phases(&self) -> Vec<PhaseRecord> {
            self.db.lock_sync().unwrap().get_phases(&self.session_id).unwrap()
        }

        /// Claim and complete every queued task with `respond`.
        fn finish_tasks(&self, respond: impl Fn(&Task) -> TaskResponse) {
            let db = self.db.lock_sync().unwrap();
            for task in db.claim_tasks(10, 3, t0()).unwrap() {
                assert!(db.complete_task(&task.id, &respond(&task), t0()).unwrap());
            }
        }
    }

    fn search_response(task: &Task) -> TaskResponse {
        match &task.request {
            TaskRequest::Search(r) => TaskResponse::Search(SearchResponse {
                content: format!("findings for {}", r.query),
                citations: vec![],
            }),
            TaskRequest::Reasoning(_) => panic!("expected a search task"),
        }
    }

    #[tokio::test]
    async fn test_sync_think_persists_result_and_advances() {
        let h = harness(vec![Ok(think_answer(&["a", "b"]))]);
        let outcome = h.executor.run_step(&h.session_id).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                from: Cursor::start(),
                to: Cursor::new(1, Step::Execute)
            }
        );

        let session = h.session();
        assert_eq!(session.status, SessionStatus::Executing);
        assert_eq!(session.cursor, Cursor::new(1, Step::Execute));
        let phases = h.phases();
        assert_eq!(phases[0].status, PhaseStatus::Executing);
        assert_eq!(phases[0].think_result.as_ref().unwrap().queries.len(), 2);

        let request = &h.reasoning.requests()[0];
        assert!(request.prompt.contains("rust async"));
        assert!(request.expected_fields.contains(&"queries".to_string()));
    }

    #[tokio::test]
    async fn test_execute_fans_out_one_search_per_query_capped() {
        let h = harness(vec![Ok(think_answer(&["a", "b", "c", "d"]))]);
        h.executor.run_step(&h.session_id).await.unwrap();

        let outcome = h.executor.run_step(&h.session_id).await.unwrap();
        let StepOutcome::Enqueued { task_ids, .. } = outcome else {
            panic!("Expected Enqueued, got {:?}", outcome);
        };
        assert_eq!(task_ids.len(), 3);

        let tasks = h.db.lock_sync().unwrap().list_tasks(&h.session_id).unwrap();
        assert!(tasks.iter().all(|t| t.task_type == TaskType::Search && t.epoch == 0));
        let slots: Vec<u32> = tasks.iter().map(|t| t.slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);

        // A second call while tasks are outstanding queues nothing new.
        let again = h.executor.run_step(&h.session_id).await.unwrap();
        assert!(matches!(again, StepOutcome::Awaiting { pending: 3, .. }));
        assert_eq!(h.db.lock_sync().unwrap().list_tasks(&h.session_id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_execute_without_queries_completes_empty() {
        let h = harness(vec![Ok(think_answer(&[]))]);
        h.executor.run_step(&h.session_id).await.unwrap();
        let outcome = h.executor.run_step(&h.session_id).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                from: Cursor::new(1, Step::Execute),
                to: Cursor::new(1, Step::Integrate)
            }
        );
        assert!(h.phases()[0].execute_result.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collect_assembles_searches_in_slot_order() {
        let h = harness(vec![Ok(think_answer(&["first", "second"]))]);
        h.executor.run_step(&h.session_id).await.unwrap();
        h.executor.run_step(&h.session_id).await.unwrap();
        h.finish_tasks(search_response);

        let outcome = h.executor.run_step(&h.session_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Advanced { .. }));
        let session = h.session();
        assert_eq!(session.status, SessionStatus::Integrating);
        let execute = h.phases()[0].execute_result.clone().unwrap();
        let queries: Vec<&str> = execute.searches.iter().map(|s| s.query.as_str()).collect();
        assert_eq!(queries, vec!["first", "second"]);
        assert!(execute.as_evidence().contains("findings for second"));
    }

    #[tokio::test]
    async fn test_queued_integrate_uses_evidence_and_moves_to_next_phase() {
        let h = harness(vec![Ok(think_answer(&["q"]))]);
        h.executor.run_step(&h.session_id).await.unwrap();
        h.executor.run_step(&h.session_id).await.unwrap();
        h.finish_tasks(search_response);
        h.executor.run_step(&h.session_id).await.unwrap();

        // INTEGRATE of the default plan is queued.
        let outcome = h.executor.run_step(&h.session_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Enqueued { ref task_ids, .. } if task_ids.len() == 1));
        let task = h
            .db
            .lock_sync()
            .unwrap()
            .step_tasks(&h.session_id, 1, Step::Integrate)
            .unwrap()
            .remove(0);
        match &task.request {
            TaskRequest::Reasoning(r) => assert!(r.prompt.contains("findings for q")),
            other => panic!("unexpected request {:?}", other),
        }

        h.finish_tasks(|_| {
            TaskResponse::Reasoning(ReasoningResponse {
                content: r#"{"insights": ["x"], "trends": ["y"]}"#.into(),
                model: None,
                usage: None,
            })
        });
        let outcome = h.executor.run_step(&h.session_id).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                from: Cursor::new(1, Step::Integrate),
                to: Cursor::new(2, Step::Think)
            }
        );
        let session = h.session();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.cursor, Cursor::new(2, Step::Think));
        assert!(h.phases()[0].is_complete());
    }

    #[tokio::test]
    async fn test_malformed_output_is_recorded_on_the_session() {
        let h = harness(vec![Ok("I think we should search for news".into())]);
        let err = h.executor.run_step(&h.session_id).await.unwrap_err();
        assert!(matches!(err, StepError::MalformedOutput(_)));

        let session = h.session();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.retry_count, 1);
        assert!(session.last_error.unwrap().starts_with("[malformed]"));
        assert!(h.phases().is_empty());
    }

    #[tokio::test]
    async fn test_collaborator_error_is_typed_and_recorded() {
        let h = harness(vec![Err(CollaboratorError::RateLimited {
            retry_after: Some(Duration::from_secs(20)),
            message: "slow down".into(),
        })]);
        let err = h.executor.run_step(&h.session_id).await.unwrap_err();
        assert!(matches!(err, StepError::Collaborator(CollaboratorError::RateLimited { .. })));
        assert!(h.session().last_error.unwrap().starts_with("[rate_limit]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_call_times_out() {
        let reasoning = ScriptedReasoning {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedReasoning::new(vec![Ok(think_answer(&["a"]))])
        };
        let h = harness_with(PipelinePlan::default(), reasoning);
        let err = h.executor.run_step(&h.session_id).await.unwrap_err();
        assert!(matches!(err, StepError::Timeout { .. }));
        assert!(h.session().last_error.unwrap().starts_with("[timeout]"));
    }

    #[tokio::test]
    async fn test_missing_previous_phase_is_missing_data() {
        let h = harness(vec![]);
        let mut session = Session::new(SessionConfig::new("t", "s", "p"), t0());
        session.cursor = Cursor::new(2, Step::Think);
        h.db.lock_sync().unwrap().insert_session(&session).unwrap();

        let err = h.executor.run_step(&session.id).await.unwrap_err();
        assert_eq!(err.to_string(), "INTEGRATE result not found for phase 1");
        assert!(h.reasoning.requests().is_empty());
    }

    #[tokio::test]
    async fn test_final_integrate_completes_the_session() {
        let mut plan = PipelinePlan::default();
        plan.phases.truncate(1);
        plan.phases[0].integrate.mode = ExecMode::Sync;
        let h = harness_with(
            plan,
            ScriptedReasoning::new(vec![
                Ok(think_answer(&[])),
                Ok(r#"{"insights": "i", "trends": "t"}"#.into()),
            ]),
        );
        let mut events = h.executor.events.subscribe();

        let mut outcome = h.executor.run_step(&h.session_id).await.unwrap();
        while outcome.should_continue() {
            outcome = h.executor.run_step(&h.session_id).await.unwrap();
        }
        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(h.session().status, SessionStatus::Completed);
        assert!(h.phases()[0].is_complete());

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if event == (PipelineEvent::SessionCompleted { session_id: h.session_id.clone() }) {
                completed = true;
            }
        }
        assert!(completed);
        assert_eq!(h.executor.run_step(&h.session_id).await.unwrap(), StepOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_recorded() {
        let h = harness(vec![]);
        let err = h.executor.run_step("nope").await.unwrap_err();
        assert!(matches!(err, StepError::SessionNotFound { .. }));
        assert!(!err.is_recorded());
    }

    #[tokio::test]
    async fn test_exhausted_task_fails_the_step() {
        let h = harness(vec![Ok(think_answer(&["a"]))]);
        h.executor.run_step(&h.session_id).await.unwrap();
        h.executor.run_step(&h.session_id).await.unwrap();
        {
            let db = h.db.lock_sync().unwrap();
            let task = db.claim_tasks(1, 3, t0()).unwrap().remove(0);
            db.fail_task(&task.id, 3, "[timeout] too slow", None, t0()).unwrap();
            assert_eq!(db.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Failed);
        }
        let err = h.executor.run_step(&h.session_id).await.unwrap_err();
        assert!(matches!(err, StepError::TaskFailed { attempts: 3, .. }));
        let session = h.session();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.last_error.unwrap().contains("failed after 3 attempts"));
    }
}
