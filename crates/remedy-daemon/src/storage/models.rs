//! Database models for Remedy.

use serde::{Deserialize, Serialize};

use crate::task::{RepositoryRef, TaskResult, TaskState};

/// Registered repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub created_at: i64,
}

impl RepositoryRow {
    pub fn repository_ref(&self) -> RepositoryRef {
        RepositoryRef {
            owner: self.owner.clone(),
            name: self.name.clone(),
        }
    }
}

/// Persisted mirror of a task snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRecordRow {
    pub id: String,
    /// `owner/name` of the target repository.
    pub repository: String,
    pub kind: String,
    pub issue_number: Option<i64>,
    pub state: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub output_len: i64,
    /// JSON-encoded [`TaskResult`].
    pub result: Option<String>,
    pub updated_at: i64,
}

impl TaskRecordRow {
    pub fn task_state(&self) -> Option<TaskState> {
        TaskState::from_str_value(&self.state)
    }

    /// Decode the stored result. Unreadable JSON reads as no result.
    pub fn task_result(&self) -> Option<TaskResult> {
        self.result
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
    }
}
