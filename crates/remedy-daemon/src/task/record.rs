//! The task record owned by the scheduler.

use chrono::{DateTime, Utc};

use super::log::{EventLog, LogClosed};
use super::state::{TaskState, TransitionError};
use super::types::{RepositoryRef, TaskEvent, TaskId, TaskKind, TaskResult, TaskSnapshot};

/// Errors from mutating a task record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Closed(#[from] LogClosed),

    #[error("task {0} is not running")]
    NotRunning(TaskId),
}

/// One unit of orchestrated work and its full event history.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    repository: RepositoryRef,
    kind: TaskKind,
    issue_number: Option<u64>,
    state: TaskState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    log: EventLog,
    output_seq: u64,
    result: Option<TaskResult>,
    slot: Option<usize>,
}

impl Task {
    /// Create a queued task; its history starts with the `None -> Queued` event.
    pub fn new(
        repository: RepositoryRef,
        kind: TaskKind,
        issue_number: Option<u64>,
        event_capacity: usize,
    ) -> (Self, TaskEvent) {
        let id = TaskId::new();
        let created_at = Utc::now();
        let mut log = EventLog::new(id, event_capacity);
        let created = TaskEvent::StatusChanged {
            task_id: id,
            index: 0,
            old_state: None,
            new_state: TaskState::Queued,
            timestamp: created_at,
        };
        // A fresh log is open.
        let _ = log.append(created.clone());

        let task = Self {
            id,
            repository,
            kind,
            issue_number,
            state: TaskState::Queued,
            created_at,
            started_at: None,
            finished_at: None,
            log,
            output_seq: 0,
            result: None,
            slot: None,
        };
        (task, created)
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    pub const fn state(&self) -> TaskState {
        self.state
    }

    pub const fn repository(&self) -> &RepositoryRef {
        &self.repository
    }

    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    pub const fn issue_number(&self) -> Option<u64> {
        self.issue_number
    }

    pub const fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub const fn set_slot(&mut self, slot: Option<usize>) {
        self.slot = slot;
    }

    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// Move to `next`, recording a timestamped status event.
    ///
    /// `started_at` is set on entering `Running`, `finished_at` on entering a
    /// terminal state; the log is closed after the terminal event.
    pub fn transition(&mut self, next: TaskState) -> Result<TaskEvent, TaskError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            }
            .into());
        }

        let now = Utc::now();
        let event = TaskEvent::StatusChanged {
            task_id: self.id,
            index: self.log.next_index(),
            old_state: Some(self.state),
            new_state: next,
            timestamp: now,
        };
        self.log.append(event.clone())?;

        self.state = next;
        if next == TaskState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            if self.finished_at.is_none() {
                self.finished_at = Some(now);
            }
            self.slot = None;
            self.log.close();
        }
        Ok(event)
    }

    /// Record the outcome. Only the first call has any effect.
    pub fn set_result(&mut self, result: TaskResult) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(result);
        true
    }

    /// Append an output chunk. Accepted only while the task is `Running`.
    pub fn append_output(&mut self, text: String) -> Result<TaskEvent, TaskError> {
        if self.state != TaskState::Running {
            return Err(TaskError::NotRunning(self.id));
        }
        let event = TaskEvent::OutputChunk {
            task_id: self.id,
            index: self.log.next_index(),
            sequence_number: self.output_seq,
            text,
            timestamp: Utc::now(),
        };
        self.log.append(event.clone())?;
        self.output_seq += 1;
        Ok(event)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            repository: self.repository.clone(),
            kind: self.kind,
            issue_number: self.issue_number,
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            output_len: self.output_seq,
            event_count: self.log.len(),
            result: self.result.clone(),
            slot: self.slot,
        }
    }
}
