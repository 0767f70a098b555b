//! The command surface: repository registration and task requests.
//!
//! [`RemediationService`] is what a front-end talks to. Repositories are
//! registered once and then addressed by their record id; task requests are
//! turned into [`TaskSpec`]s and handed to the [`Scheduler`].

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::capability::{CapabilityError, Issue, IssueQuery, RepositoryClient};
use crate::orchestration::{Scheduler, SchedulerError};
use crate::sink::{EventSink, SinkEvent};
use crate::storage::{Database, DatabaseError, RepositoryRow, TaskRecordRow};
use crate::task::{RepositoryRef, TaskId, TaskSnapshot, TaskSpec, ValidationError};

/// Errors from service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("repository {0} is not registered")]
    RepositoryNotFound(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

pub struct RemediationService {
    scheduler: Arc<Scheduler>,
    repos: Arc<dyn RepositoryClient>,
    db: Database,
    sink: Arc<dyn EventSink>,
}

impl RemediationService {
    pub fn new(
        scheduler: Arc<Scheduler>,
        repos: Arc<dyn RepositoryClient>,
        db: Database,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            scheduler,
            repos,
            db,
            sink,
        }
    }

    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    /// Register a repository, or return the existing record for it.
    pub async fn add_repository(&self, reference: &str) -> Result<RepositoryRow, ServiceError> {
        let repo = RepositoryRef::parse(reference)?;
        if let Some(row) = self.db.find_repository(&repo).await? {
            return Ok(row);
        }

        let id = Uuid::new_v4().to_string();
        match self.db.insert_repository(&id, &repo).await {
            Ok(row) => {
                info!(repository_id = %row.id, repository = %repo, "Repository added");
                Ok(row)
            }
            // Lost a race with a concurrent add of the same repository.
            Err(DatabaseError::Conflict(_)) => self
                .db
                .find_repository(&repo)
                .await?
                .ok_or_else(|| ServiceError::RepositoryNotFound(repo.full_name())),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a registered repository by record id.
    pub async fn repository(&self, repo_id: &str) -> Result<RepositoryRow, ServiceError> {
        match self.db.get_repository(repo_id).await {
            Ok(row) => Ok(row),
            Err(DatabaseError::NotFound(_)) => {
                Err(ServiceError::RepositoryNotFound(repo_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_repositories(&self) -> Result<Vec<RepositoryRow>, ServiceError> {
        Ok(self.db.list_repositories().await?)
    }

    /// Enqueue a clone-and-review task.
    pub async fn start_task(&self, repo_id: &str) -> Result<TaskId, ServiceError> {
        let row = self.repository(repo_id).await?;
        let id = self
            .scheduler
            .submit(&TaskSpec::clone_and_review(row.full_name))?;
        Ok(id)
    }

    /// Enqueue a fix attempt for one issue.
    pub async fn fix_issue(&self, repo_id: &str, issue_number: u64) -> Result<TaskId, ServiceError> {
        let row = self.repository(repo_id).await?;
        let id = self
            .scheduler
            .submit(&TaskSpec::fix_issue(row.full_name, issue_number))?;
        Ok(id)
    }

    /// List open issues, relaying each one as `IssueDiscovered`.
    pub async fn list_issues(
        &self,
        repo_id: &str,
        query: &IssueQuery,
    ) -> Result<Vec<Issue>, ServiceError> {
        let row = self.repository(repo_id).await?;
        let issues = self
            .repos
            .list_issues(&row.repository_ref(), query)
            .await?;
        for issue in &issues {
            self.sink.emit(SinkEvent::IssueDiscovered {
                repository_id: row.id.clone(),
                issue_number: issue.number,
            });
        }
        Ok(issues)
    }

    /// Unregister a repository, cancelling its unfinished tasks.
    ///
    /// Returns the ids of the tasks that were signalled. Task history is kept.
    pub async fn remove_repository(&self, repo_id: &str) -> Result<Vec<TaskId>, ServiceError> {
        let row = self.repository(repo_id).await?;
        let repo = row.repository_ref();

        let mut cancelled = Vec::new();
        for snapshot in self.live_tasks(&repo) {
            self.scheduler.cancel(snapshot.id)?;
            cancelled.push(snapshot.id);
        }
        self.db.delete_repository(&row.id).await?;
        info!(repository_id = %row.id, repository = %repo, cancelled = cancelled.len(), "Repository removed");
        Ok(cancelled)
    }

    /// Snapshots of the repository's tasks known to the scheduler.
    pub async fn repository_tasks(&self, repo_id: &str) -> Result<Vec<TaskSnapshot>, ServiceError> {
        let repo = self.repository(repo_id).await?.repository_ref();
        Ok(self
            .scheduler
            .list()
            .into_iter()
            .filter(|snapshot| same_repository(&snapshot.repository, &repo))
            .collect())
    }

    /// Persisted task records of the repository, including earlier runs.
    pub async fn task_history(&self, repo_id: &str) -> Result<Vec<TaskRecordRow>, ServiceError> {
        let repo = self.repository(repo_id).await?.repository_ref();
        Ok(self.db.list_task_records(&repo).await?)
    }

    fn live_tasks(&self, repo: &RepositoryRef) -> Vec<TaskSnapshot> {
        self.scheduler
            .list()
            .into_iter()
            .filter(|snapshot| {
                !snapshot.state.is_terminal() && same_repository(&snapshot.repository, repo)
            })
            .collect()
    }
}

/// GitHub owner and repository names are case-insensitive.
fn same_repository(a: &RepositoryRef, b: &RepositoryRef) -> bool {
    a.owner.eq_ignore_ascii_case(&b.owner) && a.name.eq_ignore_ascii_case(&b.name)
}
