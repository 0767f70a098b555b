//! Tasks: the unit of orchestrated work.
//!
//! A task targets one repository, optionally one issue, and moves through
//! the lifecycle in [`state`]. Every transition and output chunk is kept in
//! the task's [`log::EventLog`] so late subscribers can replay it.

pub mod log;
mod record;
mod state;
mod types;

pub use log::{EventLog, TaskEventStream};
pub use record::{Task, TaskError};
pub use state::{TaskState, TransitionError};
pub use types::{
    FailureDetail, FailureKind, RepositoryRef, TaskEvent, TaskId, TaskKind, TaskOutcome,
    TaskResult, TaskSnapshot, TaskSpec, TaskSuccess, ValidationError,
};
