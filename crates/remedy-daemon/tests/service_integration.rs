#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the command surface.
//!
//! Tests the flow: register repository → request tasks → observe scheduler
//! state and persisted records → unregister.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remedy_daemon::capability::{
    CapabilityError, Issue, IssueQuery, PullRequest, PullRequestRequest, RepositoryClient,
};
use remedy_daemon::orchestration::{ExecutionContext, Scheduler, SchedulerConfig, TaskRunner};
use remedy_daemon::service::{RemediationService, ServiceError};
use remedy_daemon::sink::{ChannelSink, EventSink, FanoutSink, SinkEvent};
use remedy_daemon::storage::{Database, TaskRecorder};
use remedy_daemon::task::{
    RepositoryRef, TaskKind, TaskOutcome, TaskState, TaskSuccess, ValidationError,
};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

struct Issues(Vec<u64>);

#[async_trait]
impl RepositoryClient for Issues {
    async fn list_issues(
        &self,
        _repo: &RepositoryRef,
        query: &IssueQuery,
    ) -> Result<Vec<Issue>, CapabilityError> {
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        Ok(self
            .0
            .iter()
            .take(limit)
            .map(|n| Issue {
                number: *n,
                title: format!("Issue {n}"),
                body: String::new(),
                labels: vec!["bug".into()],
                url: String::new(),
                comments: 0,
            })
            .collect())
    }

    async fn get_issue(
        &self,
        _repo: &RepositoryRef,
        number: u64,
    ) -> Result<Option<Issue>, CapabilityError> {
        Ok(self.0.contains(&number).then(|| Issue {
            number,
            title: format!("Issue {number}"),
            body: String::new(),
            labels: vec!["bug".into()],
            url: String::new(),
            comments: 0,
        }))
    }

    async fn fork_repository(&self, repo: &RepositoryRef) -> Result<RepositoryRef, CapabilityError> {
        Ok(repo.clone())
    }

    async fn clone_repository(
        &self,
        _repo: &RepositoryRef,
        _dest: &Path,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn push_branch(
        &self,
        _workdir: &Path,
        _remote: &RepositoryRef,
        _branch: &str,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn create_pull_request(
        &self,
        _repo: &RepositoryRef,
        _request: &PullRequestRequest,
    ) -> Result<PullRequest, CapabilityError> {
        Err(CapabilityError::Config("not used".into()))
    }
}

/// Reviews finish at once; fixes run until cancelled.
struct Runner;

#[async_trait]
impl TaskRunner for Runner {
    async fn run(&self, ctx: ExecutionContext) -> TaskOutcome {
        match ctx.kind {
            TaskKind::CloneAndReview => TaskOutcome::Succeeded(TaskSuccess {
                summary: "reviewed".into(),
                ..TaskSuccess::default()
            }),
            TaskKind::FixIssue => {
                ctx.cancel.cancelled().await;
                TaskOutcome::Cancelled
            }
        }
    }
}

struct Fixture {
    service: RemediationService,
    events: mpsc::UnboundedReceiver<SinkEvent>,
}

async fn fixture(max_workers: usize) -> Fixture {
    let db = Database::open_in_memory().await.unwrap();
    let (observer, events) = ChannelSink::new();
    let (recording, recorded) = ChannelSink::new();
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(observer), Arc::new(recording)];
    let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(sinks));

    let scheduler = Scheduler::new(
        SchedulerConfig {
            max_workers,
            task_timeout: Duration::from_secs(10),
            grace_period: Duration::from_millis(100),
            event_capacity: 32,
        },
        Arc::new(Runner),
        Arc::clone(&sink),
    )
    .unwrap();
    TaskRecorder::new(db.clone()).spawn(recorded);

    Fixture {
        service: RemediationService::new(scheduler, Arc::new(Issues(vec![3, 5, 8])), db, sink),
        events,
    }
}

async fn wait_terminal(service: &RemediationService, id: remedy_daemon::task::TaskId) {
    let stream = service.scheduler().subscribe(id).unwrap();
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap();
}

#[tokio::test]
async fn add_repository_is_idempotent() {
    let f = fixture(1).await;
    let a = f.service.add_repository("octo/widgets").await.unwrap();
    let b = f
        .service
        .add_repository("https://github.com/Octo/Widgets.git")
        .await
        .unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(f.service.list_repositories().await.unwrap().len(), 1);

    let err = f.service.add_repository("not a repo").await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::InvalidRepository(_))
    ));
}

#[tokio::test]
async fn tasks_require_registered_repository() {
    let f = fixture(1).await;
    let err = f.service.start_task("missing").await.unwrap_err();
    assert!(matches!(err, ServiceError::RepositoryNotFound(_)));

    let row = f.service.add_repository("octo/widgets").await.unwrap();
    let err = f.service.fix_issue(&row.id, 0).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::InvalidIssueNumber)
    ));
    assert!(f.service.scheduler().list().is_empty());
}

#[tokio::test]
async fn review_task_is_recorded() {
    let f = fixture(1).await;
    let row = f.service.add_repository("octo/widgets").await.unwrap();
    let id = f.service.start_task(&row.id).await.unwrap();
    wait_terminal(&f.service, id).await;

    let tasks = f.service.repository_tasks(&row.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Succeeded);

    let history = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let history = f.service.task_history(&row.id).await.unwrap();
            if history
                .first()
                .is_some_and(|r| r.task_state() == Some(TaskState::Succeeded))
            {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(history[0].id, id.to_string());
    assert_eq!(history[0].kind, "clone_and_review");
}

#[tokio::test]
async fn list_issues_relays_discoveries() {
    let mut f = fixture(1).await;
    let row = f.service.add_repository("octo/widgets").await.unwrap();
    let issues = f
        .service
        .list_issues(
            &row.id,
            &IssueQuery {
                labels: vec![],
                limit: Some(2),
            },
        )
        .await
        .unwrap();
    assert_eq!(issues.len(), 2);

    let mut discovered = Vec::new();
    while let Ok(event) = f.events.try_recv() {
        if let SinkEvent::IssueDiscovered {
            repository_id,
            issue_number,
        } = event
        {
            assert_eq!(repository_id, row.id);
            discovered.push(issue_number);
        }
    }
    assert_eq!(discovered, vec![3, 5]);
}

#[tokio::test]
async fn remove_repository_cancels_live_tasks() {
    let f = fixture(1).await;
    let widgets = f.service.add_repository("octo/widgets").await.unwrap();
    let gadgets = f.service.add_repository("octo/gadgets").await.unwrap();

    let running = f.service.fix_issue(&widgets.id, 3).await.unwrap();
    let queued = f.service.fix_issue(&widgets.id, 5).await.unwrap();
    let other = f.service.start_task(&gadgets.id).await.unwrap();
    let scheduler = f.service.scheduler();
    assert_eq!(scheduler.status(running).unwrap().state, TaskState::Running);
    assert_eq!(scheduler.status(queued).unwrap().state, TaskState::Queued);

    let cancelled = f.service.remove_repository(&widgets.id).await.unwrap();
    assert_eq!(cancelled, vec![running, queued]);
    assert_eq!(scheduler.status(queued).unwrap().state, TaskState::Cancelled);

    wait_terminal(&f.service, running).await;
    assert_eq!(scheduler.status(running).unwrap().state, TaskState::Cancelled);

    // The other repository's task gets the freed slot.
    wait_terminal(&f.service, other).await;
    assert_eq!(scheduler.status(other).unwrap().state, TaskState::Succeeded);

    assert!(matches!(
        f.service.start_task(&widgets.id).await,
        Err(ServiceError::RepositoryNotFound(_))
    ));
    assert_eq!(f.service.list_repositories().await.unwrap().len(), 1);
}
