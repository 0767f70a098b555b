//! The orchestration core: task registry, FIFO queue and worker slots.
//!
//! All mutation of task state happens inside one critical section (a single
//! `std::sync::Mutex`). Nothing awaits while holding it: dispatch decides
//! which tasks start under the lock and spawns their workers after it is
//! released. Events are handed to the sink under the lock so that each
//! task's events reach it in history order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use remedy_core::Config;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::pool::WorkerSlots;
use super::worker::{ExecutionContext, TaskRunner};
use crate::sink::{EventSink, SinkEvent};
use crate::subprocess::OutputSink;
use crate::task::{
    FailureDetail, FailureKind, Task, TaskEvent, TaskEventStream, TaskId, TaskOutcome, TaskResult,
    TaskSnapshot, TaskSpec, TaskState, ValidationError, log,
};

/// Errors from scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("the scheduler needs a Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} has not finished")]
    NotTerminal(TaskId),
}

/// Settings read once when the scheduler is built.
///
/// After a cancel or the deadline, a worker gets up to twice
/// `grace_period` to unwind before it is aborted. The body's own subprocess
/// teardown (SIGTERM, `grace_period`, SIGKILL, reap) runs inside that bound,
/// so a stopped task settles within `2 × grace_period` plus reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub task_timeout: Duration,
    pub grace_period: Duration,
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        let o = &config.orchestrator;
        Self {
            max_workers: o.max_workers,
            task_timeout: Duration::from_secs(o.task_timeout_secs),
            grace_period: Duration::from_secs(o.grace_period_secs),
            event_capacity: o.event_capacity,
        }
    }
}

/// Task counts by phase, plus slot usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub cancelling: usize,
    pub terminal: usize,
    pub slots_in_use: usize,
    pub slot_capacity: usize,
}

struct Entry {
    task: Task,
    /// Bound while the task holds a worker slot.
    cancel: Option<CancellationToken>,
    /// Set once the deadline fired; output from then on is discarded.
    tearing_down: bool,
}

struct State {
    tasks: HashMap<TaskId, Entry>,
    /// Submission order, for `list`.
    order: Vec<TaskId>,
    queue: VecDeque<TaskId>,
    slots: WorkerSlots,
}

/// A task that has been moved to `Running` and needs a worker.
struct Launch {
    ctx: ExecutionContext,
    slot: usize,
}

/// Owns every task for its whole lifetime and runs them on a fixed number
/// of worker slots, strictly in submission order.
pub struct Scheduler {
    config: SchedulerConfig,
    runner: Arc<dyn TaskRunner>,
    sink: Arc<dyn EventSink>,
    runtime: Handle,
    state: Mutex<State>,
    this: Weak<Self>,
}

impl Scheduler {
    /// Build a scheduler on the current Tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        runner: Arc<dyn TaskRunner>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, SchedulerError> {
        if config.max_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }
        if config.task_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "task timeout must be non-zero".into(),
            ));
        }
        if config.event_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "event capacity must be non-zero".into(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        info!(
            max_workers = config.max_workers,
            timeout_secs = config.task_timeout.as_secs(),
            "Scheduler started"
        );
        Ok(Arc::new_cyclic(|this| Self {
            config,
            runner,
            sink,
            runtime,
            state: Mutex::new(State {
                tasks: HashMap::new(),
                order: Vec::new(),
                queue: VecDeque::new(),
                slots: WorkerSlots::new(config.max_workers),
            }),
            this: this.clone(),
        }))
    }

    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: TaskEvent) {
        self.sink.emit(SinkEvent::Task(event));
    }

    /// Publish a status event followed by the task's resulting snapshot.
    fn publish_status(&self, task: &Task, event: TaskEvent) {
        self.publish(event);
        self.sink.emit(SinkEvent::Snapshot {
            snapshot: Box::new(task.snapshot()),
        });
    }

    /// Validate and enqueue a task. Never blocks on running work.
    pub fn submit(&self, spec: &TaskSpec) -> Result<TaskId, ValidationError> {
        let repository = spec.validate()?;
        let (task, created) = Task::new(
            repository,
            spec.kind,
            spec.issue_number,
            self.config.event_capacity,
        );
        let id = task.id();

        let launches = {
            let mut guard = self.lock();
            let state = &mut *guard;
            info!(task_id = %id, repository = %task.repository(), kind = task.kind().as_str(), "Task queued");
            self.publish_status(&task, created);
            state.tasks.insert(
                id,
                Entry {
                    task,
                    cancel: None,
                    tearing_down: false,
                },
            );
            state.order.push(id);
            state.queue.push_back(id);
            self.dispatch(state)
        };
        self.launch(launches);
        Ok(id)
    }

    /// Cancel a task.
    ///
    /// A queued task goes straight to `Cancelled`. A running task moves to
    /// `Cancelling` and its worker is signalled; it reaches `Cancelled` once
    /// the worker has unwound. Finished tasks are left as they are.
    pub fn cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        let mut guard = self.lock();
        self.cancel_locked(&mut guard, id)
    }

    fn cancel_locked(&self, state: &mut State, id: TaskId) -> Result<(), SchedulerError> {
        let entry = state.tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        match entry.task.state() {
            TaskState::Queued => {
                state.queue.retain(|queued| *queued != id);
                self.finish(
                    &mut entry.task,
                    TaskState::Cancelled,
                    TaskResult::Failed(FailureDetail::new(
                        FailureKind::Cancellation,
                        "cancelled before start",
                    )),
                );
                info!(task_id = %id, "Queued task cancelled");
            }
            TaskState::Running => {
                match entry.task.transition(TaskState::Cancelling) {
                    Ok(event) => self.publish_status(&entry.task, event),
                    Err(e) => warn!(task_id = %id, error = %e, "Cannot mark task cancelling"),
                }
                if let Some(token) = &entry.cancel {
                    token.cancel();
                }
                info!(task_id = %id, slot = ?entry.task.slot(), "Cancelling running task");
            }
            other => debug!(task_id = %id, state = %other, "Cancel ignored"),
        }
        Ok(())
    }

    /// Snapshot of one task.
    pub fn status(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.lock()
            .tasks
            .get(&id)
            .map(|entry| entry.task.snapshot())
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Stream a task's events from the first one, following live until the
    /// terminal status event.
    pub fn subscribe(&self, id: TaskId) -> Result<TaskEventStream, SchedulerError> {
        let (backlog, live) = self
            .lock()
            .tasks
            .get(&id)
            .map(|entry| entry.task.log().attach())
            .ok_or(SchedulerError::NotFound(id))?;

        let scheduler = self.this.clone();
        Ok(log::follow(backlog, live, move |from| {
            scheduler
                .upgrade()
                .map(|s| s.history_since(id, from))
                .unwrap_or_default()
        }))
    }

    fn history_since(&self, id: TaskId, from: usize) -> Vec<TaskEvent> {
        self.lock()
            .tasks
            .get(&id)
            .map(|entry| entry.task.log().since(from))
            .unwrap_or_default()
    }

    /// Snapshots of every known task, in submission order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|entry| entry.task.snapshot())
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        let mut stats = SchedulerStats {
            slots_in_use: state.slots.occupied(),
            slot_capacity: state.slots.capacity(),
            ..SchedulerStats::default()
        };
        for entry in state.tasks.values() {
            match entry.task.state() {
                TaskState::Queued => stats.queued += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Cancelling => stats.cancelling += 1,
                _ => stats.terminal += 1,
            }
        }
        stats
    }

    /// Drop a finished task and its history.
    pub fn forget(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        let mut state = self.lock();
        let entry = state.tasks.get(&id).ok_or(SchedulerError::NotFound(id))?;
        if !entry.task.state().is_terminal() {
            return Err(SchedulerError::NotTerminal(id));
        }
        let snapshot = entry.task.snapshot();
        state.tasks.remove(&id);
        state.order.retain(|known| *known != id);
        debug!(task_id = %id, "Task forgotten");
        Ok(snapshot)
    }

    /// Cancel every task that has not finished. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let live: Vec<TaskId> = state
            .order
            .iter()
            .copied()
            .filter(|id| {
                state
                    .tasks
                    .get(id)
                    .is_some_and(|entry| !entry.task.state().is_terminal())
            })
            .collect();
        for id in &live {
            let _ = self.cancel_locked(state, *id);
        }
        info!(count = live.len(), "Scheduler shutting down");
        live.len()
    }

    /// Move queued tasks into free slots. Called with the lock held; the
    /// returned launches are spawned after it is released.
    fn dispatch(&self, state: &mut State) -> Vec<Launch> {
        let mut launches = Vec::new();
        while state.slots.has_free() {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            let Some(entry) = state.tasks.get_mut(&id) else {
                continue;
            };
            if entry.task.state() != TaskState::Queued {
                continue;
            }
            let Some(slot) = state.slots.claim_free(id) else {
                state.queue.push_front(id);
                break;
            };

            entry.task.set_slot(Some(slot));
            match entry.task.transition(TaskState::Running) {
                Ok(event) => self.publish_status(&entry.task, event),
                Err(e) => {
                    error!(task_id = %id, error = %e, "Cannot start task");
                    entry.task.set_slot(None);
                    state.slots.release(slot);
                    continue;
                }
            }

            let cancel = CancellationToken::new();
            entry.cancel = Some(cancel.clone());
            let output: Arc<dyn OutputSink> = Arc::new(TaskOutput {
                scheduler: self.this.clone(),
                task_id: id,
            });
            let ctx = ExecutionContext::new(
                id,
                entry.task.repository().clone(),
                entry.task.kind(),
                entry.task.issue_number(),
                Instant::now() + self.config.task_timeout,
                cancel,
                output,
                self.config.grace_period,
            );
            info!(task_id = %id, slot, "Task started");
            launches.push(Launch { ctx, slot });
        }
        launches
    }

    fn launch(&self, launches: Vec<Launch>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        for launch in launches {
            self.runtime.spawn(Arc::clone(&this).supervise(launch));
        }
    }

    /// Run one task body and report its outcome.
    ///
    /// The body runs in its own Tokio task so that a panic is contained.
    /// After cancel or the deadline, the body gets twice the grace period
    /// to unwind (its subprocess teardown included) before it is aborted.
    async fn supervise(self: Arc<Self>, launch: Launch) {
        let Launch { ctx, slot } = launch;
        let task_id = ctx.task_id;
        let cancel = ctx.cancel.clone();
        let deadline = ctx.deadline;

        let runner = Arc::clone(&self.runner);
        let mut body = self.runtime.spawn(async move { runner.run(ctx).await });
        let bound = self.config.grace_period.saturating_mul(2);

        let outcome = tokio::select! {
            biased;
            joined = &mut body => outcome_of(task_id, joined),
            () = cancel.cancelled() => {
                unwind(task_id, &mut body, bound).await;
                TaskOutcome::Cancelled
            }
            () = tokio::time::sleep_until(deadline) => {
                self.begin_teardown(task_id);
                cancel.cancel();
                unwind(task_id, &mut body, bound).await;
                TaskOutcome::TimedOut
            }
        };
        self.complete(task_id, slot, outcome);
    }

    /// Stop accepting output from a task whose deadline has passed.
    fn begin_teardown(&self, id: TaskId) {
        if let Some(entry) = self.lock().tasks.get_mut(&id) {
            entry.tearing_down = true;
        }
        debug!(task_id = %id, "Deadline reached, tearing down");
    }

    fn complete(&self, id: TaskId, slot: usize, outcome: TaskOutcome) {
        let launches = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.slots.holder(slot) == Some(id) {
                state.slots.release(slot);
            } else {
                warn!(task_id = %id, slot, "Slot held by another task at completion");
            }
            if let Some(entry) = state.tasks.get_mut(&id) {
                entry.cancel = None;
                self.settle(&mut entry.task, outcome);
            }
            self.dispatch(state)
        };
        self.launch(launches);
    }

    /// Apply a worker's outcome as the task's terminal state.
    fn settle(&self, task: &mut Task, outcome: TaskOutcome) {
        let timeout_secs = self.config.task_timeout.as_secs();
        let (target, result) = match outcome {
            _ if task.state() == TaskState::Cancelling => (TaskState::Cancelled, cancelled()),
            TaskOutcome::Succeeded(success) => (TaskState::Succeeded, TaskResult::Succeeded(success)),
            TaskOutcome::Failed(detail) => (TaskState::Failed, TaskResult::Failed(detail)),
            TaskOutcome::TimedOut => (
                TaskState::TimedOut,
                TaskResult::Failed(FailureDetail::new(
                    FailureKind::Timeout,
                    format!("task exceeded its {timeout_secs}s timeout"),
                )),
            ),
            TaskOutcome::Cancelled => (TaskState::Cancelled, cancelled()),
        };

        if target == TaskState::Cancelled && task.state() == TaskState::Running {
            match task.transition(TaskState::Cancelling) {
                Ok(event) => self.publish_status(task, event),
                Err(e) => warn!(task_id = %task.id(), error = %e, "Cannot mark task cancelling"),
            }
        }
        self.finish(task, target, result);
        info!(task_id = %task.id(), state = %task.state(), "Task finished");
    }

    /// Enter a terminal state and record the result.
    fn finish(&self, task: &mut Task, target: TaskState, result: TaskResult) {
        match task.transition(target) {
            Ok(event) => {
                task.set_result(result);
                self.publish_status(task, event);
            }
            Err(e) => warn!(task_id = %task.id(), error = %e, "Terminal transition rejected"),
        }
    }

    fn record_output(&self, id: TaskId, text: String) {
        let mut state = self.lock();
        let Some(entry) = state.tasks.get_mut(&id) else {
            return;
        };
        if entry.tearing_down {
            trace!(task_id = %id, "Output discarded during teardown");
            return;
        }
        match entry.task.append_output(text) {
            Ok(event) => self.publish(event),
            Err(e) => trace!(task_id = %id, error = %e, "Output discarded"),
        }
    }
}

fn cancelled() -> TaskResult {
    TaskResult::Failed(FailureDetail::new(FailureKind::Cancellation, "cancelled"))
}

fn outcome_of(id: TaskId, joined: Result<TaskOutcome, JoinError>) -> TaskOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(task_id = %id, panic = %message, "Worker panicked");
            TaskOutcome::failed(FailureKind::Execution, format!("worker panicked: {message}"))
        }
        Err(_) => TaskOutcome::failed(FailureKind::Execution, "worker was aborted"),
    }
}

async fn unwind(id: TaskId, body: &mut JoinHandle<TaskOutcome>, bound: Duration) {
    if tokio::time::timeout(bound, &mut *body).await.is_err() {
        warn!(task_id = %id, bound_ms = bound.as_millis(), "Worker did not unwind in time, aborting");
        body.abort();
        let _ = body.await;
    }
}

/// Routes a worker's output lines into its task's history.
struct TaskOutput {
    scheduler: Weak<Scheduler>,
    task_id: TaskId,
}

impl OutputSink for TaskOutput {
    fn emit(&self, chunk: String) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.record_output(self.task_id, chunk);
        }
    }
}
