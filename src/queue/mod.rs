//! Durable task queue with a bounded worker pool.
//!
//! Tasks live in the `tasks` table; the queue owns no in-memory backlog.
//! One worker loop per process claims QUEUED tasks oldest-first up to the
//! concurrency cap, runs each collaborator call on its own tokio task under
//! `task_timeout`, and writes the outcome back:
//!
//! - success: COMPLETED (only if still PROCESSING), then the continuation
//!   signal re-enters the owning session
//! - transient failure below the ceiling: FAILED with `next_attempt_at`
//!   after exponential backoff; the loop re-queues it when due
//! - ceiling reached, or a structural failure: FAILED for good and the
//!   owning session (same epoch only) is marked FAILED
//!
//! While a retry is pending the loop sleeps until it is due, never longer
//! than `poll_interval`. With nothing queued, running or pending it stops
//! polling and suspends on a `Notify` until the next `enqueue`.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cotflow_common::{CollaboratorError, NewTask, Task, TaskRequest, TaskResponse, TaskSummary};
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::collaborators::Collaborators;
use crate::config::QueueSection;
use crate::errors::{Failure, StepError};
use crate::events::{EventBus, PipelineEvent};
use crate::scheduler::Continuation;
use crate::store::DbHandle;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub task_timeout: Duration,
    pub poll_interval: Duration,
}

impl QueueSettings {
    pub fn from_config(section: &QueueSection) -> Self {
        Self {
            concurrency: section.concurrency,
            max_retries: section.max_retries,
            backoff_base: Duration::from_secs(section.backoff_base_secs),
            backoff_cap: Duration::from_secs(section.backoff_cap_secs),
            task_timeout: section.task_timeout(),
            poll_interval: section.poll_interval(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueSection::default())
    }
}

/// Cheap to clone; clones share the wake-up and shutdown signals.
#[derive(Clone)]
pub struct TaskQueue {
    db: DbHandle,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    continuation: Arc<dyn Continuation>,
    events: EventBus,
    settings: QueueSettings,
    wake: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TaskQueue {
    pub fn new(
        db: DbHandle,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        continuation: Arc<dyn Continuation>,
        settings: QueueSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            db,
            collaborators,
            clock,
            continuation,
            events: EventBus::default(),
            settings,
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Wakes the worker loop. Hand it to anything that inserts tasks
    /// directly through the store.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn enqueue(&self, task: NewTask) -> Result<String> {
        let mut ids = self.enqueue_batch(vec![task]).await?;
        ids.pop()
            .ok_or_else(|| anyhow::anyhow!("Enqueue returned no task id"))
    }

    /// Insert independent tasks in one transaction.
    pub async fn enqueue_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<String>> {
        let now = self.clock.now();
        let ids = self.db.call(move |db| db.enqueue_tasks(&tasks, now)).await?;
        debug!(count = ids.len(), "Enqueued tasks");
        self.wake();
        Ok(ids)
    }

    pub async fn task_summary(&self, session_id: &str) -> Result<TaskSummary> {
        let id = session_id.to_string();
        let max = self.settings.max_retries;
        self.db.call(move |db| db.task_summary(&id, max)).await
    }

    /// Spawn the worker loop.
    pub fn start(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { queue.run(shutdown).await })
    }

    /// Stop claiming. The loop returns once in-flight tasks have finished.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.wake();
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.settings.concurrency, "Task queue started");

        let max = self.settings.max_retries;
        let now = self.clock.now();
        match self.db.call(move |db| db.recover_orphans(max, now)).await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Recovered tasks left PROCESSING by a previous run"),
            Err(e) => error!(error = %e, "Failed to recover orphaned tasks"),
        }

        let mut running: JoinSet<()> = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.fill(&mut running).await {
                error!(error = %e, "Task queue cycle failed");
            }
            let idle = self.idle_wait().await;
            if idle.is_none() && running.is_empty() {
                debug!("No pending tasks, waiting for the next enqueue");
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Task worker panicked");
                    }
                }
                _ = self.clock.sleep(idle.unwrap_or_default()), if idle.is_some() => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(in_flight = running.len(), "Task queue stopping");
        while running.join_next().await.is_some() {}
        info!("Task queue stopped");
    }

    /// Re-queue due retries and claim up to the free capacity.
    async fn fill(&self, running: &mut JoinSet<()>) -> Result<()> {
        let max = self.settings.max_retries;
        let cap = self.settings.concurrency;
        let now = self.clock.now();
        let claimed = self
            .db
            .call(move |db| {
                let requeued = db.requeue_due(max, now)?;
                if requeued > 0 {
                    debug!(count = requeued, "Re-queued tasks after backoff");
                }
                let room = cap.saturating_sub(db.count_processing()?);
                db.claim_tasks(room, max, now)
            })
            .await?;

        for task in claimed {
            info!(
                task_id = %task.id,
                session_id = %task.session_id,
                task_type = %task.task_type,
                attempt = task.retry_count + 1,
                "Claimed task"
            );
            let queue = self.clone();
            running.spawn(async move { queue.execute(task).await });
        }
        Ok(())
    }

    /// Time until the earliest retry is due, bounded by the poll interval.
    /// `None` when no retry is pending: only an enqueue or a finishing
    /// worker can create new work then.
    async fn idle_wait(&self) -> Option<Duration> {
        let poll = self.settings.poll_interval;
        let max = self.settings.max_retries;
        let now = self.clock.now();
        match self.db.call(move |db| db.next_attempt_due(max)).await {
            Ok(Some(at)) => Some((at - now).to_std().unwrap_or(Duration::ZERO).min(poll)),
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "Failed to look up pending retries");
                Some(poll)
            }
        }
    }

    async fn execute(&self, task: Task) {
        let timeout = self.settings.task_timeout;
        let result = match tokio::time::timeout(timeout, self.call(&task.request)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout { after: timeout }),
        };
        let recorded = match result {
            Ok(response) => self.on_success(&task, response).await,
            Err(err) => self.on_failure(&task, err).await,
        };
        if let Err(e) = recorded {
            error!(task_id = %task.id, error = %e, "Failed to record task outcome");
        }
    }

    async fn call(&self, request: &TaskRequest) -> Result<TaskResponse, CollaboratorError> {
        match request {
            TaskRequest::Reasoning(r) => self
                .collaborators
                .reasoning
                .reason(r)
                .await
                .map(TaskResponse::Reasoning),
            TaskRequest::Search(r) => self
                .collaborators
                .search
                .search(r)
                .await
                .map(TaskResponse::Search),
        }
    }

    async fn on_success(&self, task: &Task, response: TaskResponse) -> Result<()> {
        let now = self.clock.now();
        let id = task.id.clone();
        let session_id = task.session_id.clone();
        let stored = self
            .db
            .call(move |db| {
                if !db.complete_task(&id, &response, now)? {
                    return Ok(false);
                }
                db.note_task_activity(&session_id, &id, now)?;
                Ok(true)
            })
            .await?;
        if !stored {
            warn!(task_id = %task.id, "Task is no longer processing, late result discarded");
            return Ok(());
        }

        info!(task_id = %task.id, session_id = %task.session_id, "Task completed");
        self.events.emit(PipelineEvent::TaskCompleted {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
        });
        self.continuation.resume(&task.session_id).await;
        Ok(())
    }

    async fn on_failure(&self, task: &Task, err: CollaboratorError) -> Result<()> {
        let max = self.settings.max_retries;
        let now = self.clock.now();
        let failure = Failure::from_collaborator(&err);
        let tagged = failure.tagged();
        let attempts = task.retry_count + 1;
        let structural = err.is_structural();
        let terminal = structural || attempts >= max;
        let next_attempt_at = if terminal {
            None
        } else {
            let wait = backoff::delay(self.settings.backoff_base, self.settings.backoff_cap, task.retry_count)
                .max(failure.retry_after.unwrap_or_default());
            Some(now + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero()))
        };
        let session_error = StepError::task_failed(&task.id, attempts, &tagged).failure().tagged();

        let id = task.id.clone();
        let session_id = task.session_id.clone();
        let epoch = task.epoch;
        let error_text = tagged.clone();
        let stored = self
            .db
            .call(move |db| {
                if !db.fail_task(&id, attempts, &error_text, next_attempt_at, now)? {
                    return Ok(false);
                }
                db.note_task_activity(&session_id, &id, now)?;
                if terminal {
                    db.record_failure(&session_id, Some(epoch), &session_error, now)?;
                }
                Ok(true)
            })
            .await?;
        if !stored {
            warn!(task_id = %task.id, "Task is no longer processing, failure discarded");
            return Ok(());
        }

        if terminal {
            error!(task_id = %task.id, session_id = %task.session_id, attempts, error = %tagged, "Task failed terminally");
        } else {
            warn!(task_id = %task.id, session_id = %task.session_id, attempts, retry_at = ?next_attempt_at, error = %tagged, "Task failed, will retry");
        }
        self.events.emit(PipelineEvent::TaskFailed {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            attempts,
            terminal,
            error: tagged,
        });
        if terminal {
            self.continuation.resume(&task.session_id).await;
        }
        Ok(())
    }
}
