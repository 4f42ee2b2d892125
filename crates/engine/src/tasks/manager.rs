use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use paybridge_core::{ConnectorId, Task, TaskId, TaskKind, TaskOutcome};
use paybridge_observability::Telemetry;

use crate::error::{EngineError, EngineResult};
use crate::storage::{Storage, TaskCompletion};

/// Background work of a task. Resolves to the id of the object it produced, if any.
pub type TaskJob = Pin<Box<dyn Future<Output = EngineResult<Option<String>>> + Send + 'static>>;

type Waiters = Mutex<HashMap<TaskId, watch::Sender<Option<Task>>>>;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Creates tasks, runs their jobs and hands out results.
///
/// Jobs run on spawned tokio tasks and are never cancelled: a caller that
/// stops waiting only abandons its wait, the provider call carries on and
/// still records its outcome.
#[derive(Clone)]
pub struct TaskManager {
    storage: Arc<dyn Storage>,
    telemetry: Telemetry,
    stack: String,
    wait_timeout: Duration,
    waiters: Arc<Waiters>,
}

impl TaskManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        telemetry: Telemetry,
        stack: impl Into<String>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            telemetry,
            stack: stack.into(),
            wait_timeout,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deterministic id for `kind` applied to `parts`.
    pub fn task_id(&self, kind: TaskKind, connector_id: Option<ConnectorId>, parts: &[&str]) -> TaskId {
        TaskId::new(kind.reference(&self.stack, parts), connector_id)
    }

    /// Create the task and schedule `job`, unless a task with the same id
    /// already exists, in which case the existing task is returned and `job`
    /// is dropped unscheduled.
    ///
    /// With `wait_result`, blocks until the task is terminal or the configured
    /// timeout elapses; on timeout the still-pending task is returned.
    pub async fn submit(&self, id: TaskId, kind: TaskKind, wait_result: bool, job: TaskJob) -> EngineResult<Task> {
        let (task, created) = self.storage.tasks_create(Task::new(id.clone(), kind)).await?;

        if created {
            self.spawn(id.clone(), job).await;
        } else {
            info!(task_id = %id.reference, status = ?task.status, "task already exists, not rescheduled");
        }

        if wait_result && !task.is_terminal() {
            return self.await_result(&id, self.wait_timeout).await;
        }
        Ok(task)
    }

    /// Wait for the task to reach a terminal state, at most `timeout`.
    ///
    /// Tasks whose job runs in this process are awaited through their waiter.
    /// Without one (the job is not spawned yet, or runs elsewhere) storage is
    /// polled until the deadline.
    pub async fn await_result(&self, id: &TaskId, timeout: Duration) -> EngineResult<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let receiver = self.waiters.lock().await.get(id).map(|tx| tx.subscribe());

            if let Some(mut rx) = receiver {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let waited = tokio::time::timeout(remaining, rx.wait_for(|task| task.is_some()))
                    .await
                    .map(|res| res.map(|done| done.clone()));
                match waited {
                    Ok(Ok(done)) => {
                        if let Some(task) = done {
                            return Ok(task);
                        }
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        warn!(task_id = %id.reference, ?timeout, "wait for task result timed out");
                        return self.get(id).await;
                    }
                }
            }

            let task = self.get(id).await?;
            let now = Instant::now();
            if task.is_terminal() || now >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn get(&self, id: &TaskId) -> EngineResult<Task> {
        self.storage
            .tasks_get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("task {}", id.reference)))
    }

    /// Record a terminal outcome for a task from outside its job
    /// (e.g. a provider webhook). Completing a terminal task is a no-op.
    pub async fn complete(&self, id: &TaskId, outcome: TaskOutcome) -> EngineResult<Task> {
        let completion = self.storage.tasks_complete(id, outcome).await?;
        let task = match completion {
            TaskCompletion::Applied(task) => {
                self.notify(id, &task).await;
                task
            }
            TaskCompletion::AlreadyTerminal(task) => {
                info!(task_id = %id.reference, status = ?task.status, "task already terminal, outcome ignored");
                task
            }
        };
        Ok(task)
    }

    async fn spawn(&self, id: TaskId, job: TaskJob) {
        let (tx, _) = watch::channel(None);
        self.waiters.lock().await.insert(id.clone(), tx);

        let manager = self.clone();
        let span = self.telemetry.job(&id.reference);
        tokio::spawn(
            async move {
                let outcome = match job.await {
                    Ok(created_object_id) => TaskOutcome::succeeded(created_object_id),
                    Err(err) => {
                        warn!(task_id = %id.reference, error = %err, "task failed");
                        TaskOutcome::failed(err.to_string())
                    }
                };

                if let Err(err) = manager.complete(&id, outcome).await {
                    error!(task_id = %id.reference, error = %err, "failed to record task outcome");
                    manager.waiters.lock().await.remove(&id);
                }
            }
            .instrument(span),
        );
    }

    async fn notify(&self, id: &TaskId, task: &Task) {
        if let Some(tx) = self.waiters.lock().await.remove(id) {
            tx.send_replace(Some(task.clone()));
        }
    }
}
