//! Task identifiers, specifications, results and snapshots.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TaskState;

/// Accepts `owner/name`, `https://github.com/owner/name(.git)` and
/// `git@github.com:owner/name(.git)`.
#[allow(clippy::expect_used)]
static REPOSITORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://(?:www\.)?github\.com/|git@github\.com:)?([^/\s:]+)/([^/\s]+?)(?:\.git)?/?$")
        .expect("static regex is valid")
});

/// Opaque task identifier, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A GitHub repository reference (`owner/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    /// Parse a reference from its short or URL form.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingRepository);
        }
        let caps = REPOSITORY_RE
            .captures(trimmed)
            .ok_or_else(|| ValidationError::InvalidRepository(trimmed.to_string()))?;
        let owner = &caps[1];
        let name = &caps[2];
        if !is_valid_component(owner) || !is_valid_component(name) {
            return Err(ValidationError::InvalidRepository(trimmed.to_string()));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Directory name used for this repository's clone.
    pub fn dir_name(&self) -> String {
        format!("{}__{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepositoryRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_valid_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.starts_with('-')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Clone (or update) the repository and run a review directive.
    CloneAndReview,
    /// Attempt to fix one issue and open a pull request.
    FixIssue,
}

impl TaskKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CloneAndReview => "clone_and_review",
            Self::FixIssue => "fix_issue",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to create a task, as received from the command surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub repository: String,
    pub kind: TaskKind,
    pub issue_number: Option<u64>,
}

impl TaskSpec {
    pub fn clone_and_review(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            kind: TaskKind::CloneAndReview,
            issue_number: None,
        }
    }

    pub fn fix_issue(repository: impl Into<String>, issue_number: u64) -> Self {
        Self {
            repository: repository.into(),
            kind: TaskKind::FixIssue,
            issue_number: Some(issue_number),
        }
    }

    /// Validate the request and resolve its repository reference.
    pub fn validate(&self) -> Result<RepositoryRef, ValidationError> {
        let repository = RepositoryRef::parse(&self.repository)?;
        match (self.kind, self.issue_number) {
            (TaskKind::FixIssue, None) => Err(ValidationError::MissingIssueNumber),
            (TaskKind::FixIssue, Some(0)) => Err(ValidationError::InvalidIssueNumber),
            (TaskKind::CloneAndReview, Some(n)) => Err(ValidationError::UnexpectedIssueNumber(n)),
            _ => Ok(repository),
        }
    }
}

/// A task spec was rejected at submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("repository reference is missing")]
    MissingRepository,

    #[error("invalid repository reference: {0}")]
    InvalidRepository(String),

    #[error("fix task requires an issue number")]
    MissingIssueNumber,

    #[error("issue number must be positive")]
    InvalidIssueNumber,

    #[error("review task does not take an issue number (got #{0})")]
    UnexpectedIssueNumber(u64),
}

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The external process could not start.
    Launch,
    /// The external process ran and exited abnormally, or the worker crashed.
    Execution,
    Timeout,
    Cancellation,
    /// A repository capability call failed.
    Capability,
}

/// Failure detail recorded on a terminal task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Success payload recorded on a terminal task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSuccess {
    pub summary: String,
    pub pull_request_url: Option<String>,
    pub branch: Option<String>,
}

/// Outcome recorded exactly once, at the terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Succeeded(TaskSuccess),
    Failed(FailureDetail),
}

/// What a worker reports back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded(TaskSuccess),
    Failed(FailureDetail),
    TimedOut,
    Cancelled,
}

impl TaskOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed(FailureDetail::new(kind, message))
    }
}

/// Immutable copy of a task's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub repository: RepositoryRef,
    pub kind: TaskKind,
    pub issue_number: Option<u64>,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of output chunks recorded so far.
    pub output_len: u64,
    /// Number of events in the task's history.
    pub event_count: usize,
    pub result: Option<TaskResult>,
    /// Worker slot currently holding the task, if running.
    pub slot: Option<usize>,
}

/// One entry in a task's event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        task_id: TaskId,
        index: usize,
        old_state: Option<TaskState>,
        new_state: TaskState,
        timestamp: DateTime<Utc>,
    },
    OutputChunk {
        task_id: TaskId,
        index: usize,
        sequence_number: u64,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::StatusChanged { task_id, .. } | Self::OutputChunk { task_id, .. } => *task_id,
        }
    }

    /// Position of this event in its task's history.
    pub const fn index(&self) -> usize {
        match self {
            Self::StatusChanged { index, .. } | Self::OutputChunk { index, .. } => *index,
        }
    }

    /// True for a status change into a terminal state.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::StatusChanged { new_state, .. } if new_state.is_terminal())
    }
}
