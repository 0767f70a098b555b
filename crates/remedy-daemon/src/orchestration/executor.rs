//! Default task bodies: clone-and-review and the issue fix workflow.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use remedy_core::config::FixConfig;
use tracing::{info, warn};

use super::worker::{ExecutionContext, TaskRunner};
use crate::capability::{
    CodeModifier, Directive, Issue, PullRequestRequest, RepositoryClient, VersionControl,
};
use crate::subprocess::SupervisorOutcome;
use crate::task::{FailureKind, TaskKind, TaskOutcome, TaskSuccess};
use crate::workspace::WorkspaceManager;

/// Summary recorded when the tool left the clone untouched.
pub const NO_CHANGES: &str = "no changes";

/// Drives the capability interfaces for each task kind.
pub struct TaskExecutor {
    repos: Arc<dyn RepositoryClient>,
    vcs: Arc<dyn VersionControl>,
    tool: Arc<dyn CodeModifier>,
    workspaces: Arc<WorkspaceManager>,
    fix: FixConfig,
}

impl TaskExecutor {
    pub fn new(
        repos: Arc<dyn RepositoryClient>,
        vcs: Arc<dyn VersionControl>,
        tool: Arc<dyn CodeModifier>,
        workspaces: Arc<WorkspaceManager>,
        fix: FixConfig,
    ) -> Self {
        Self {
            repos,
            vcs,
            tool,
            workspaces,
            fix,
        }
    }

    async fn review(&self, ctx: &ExecutionContext) -> Result<TaskSuccess, TaskOutcome> {
        let repo = &ctx.repository;
        ctx.progress(format!("Waiting for working directory of {repo}"));
        let lease = ctx
            .guard_with(FailureKind::Execution, self.workspaces.acquire(repo))
            .await?;

        ctx.progress(format!("Cloning {repo}"));
        ctx.guard(self.repos.clone_repository(repo, lease.path()))
            .await?;

        ctx.progress("Running review");
        let transcript = self
            .run_tool(ctx, lease.path(), &Directive::Review)
            .await?;

        let summary = transcript
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("review completed")
            .to_string();
        Ok(TaskSuccess {
            summary,
            pull_request_url: None,
            branch: None,
        })
    }

    async fn fix_issue(&self, ctx: &ExecutionContext) -> Result<TaskSuccess, TaskOutcome> {
        let repo = &ctx.repository;
        let Some(number) = ctx.issue_number else {
            return Err(TaskOutcome::failed(
                FailureKind::Execution,
                "fix task has no issue number",
            ));
        };

        ctx.progress(format!("Waiting for working directory of {repo}"));
        let lease = ctx
            .guard_with(FailureKind::Execution, self.workspaces.acquire(repo))
            .await?;
        let workdir = lease.path();

        ctx.progress(format!("Cloning {repo}"));
        ctx.guard(self.repos.clone_repository(repo, workdir)).await?;

        let issue = self.find_issue(ctx, number).await?;
        ctx.progress(format!("Fixing #{}: {}", issue.number, issue.title));

        let base = ctx.guard(self.vcs.default_branch(workdir)).await?;
        let branch = format!("{}{number}", self.fix.branch_prefix);
        ctx.progress(format!("Creating branch {branch} from {base}"));
        ctx.guard(self.vcs.checkout_branch(workdir, &base, &branch))
            .await?;

        let directive = Directive::FixIssue {
            number,
            title: issue.title.clone(),
            body: issue.body.clone(),
        };
        self.run_tool(ctx, workdir, &directive).await?;

        let diff = ctx.guard(self.vcs.diff(workdir)).await?;
        if diff.trim().is_empty() {
            ctx.progress("The tool made no changes");
            return Ok(TaskSuccess {
                summary: NO_CHANGES.to_string(),
                pull_request_url: None,
                branch: Some(branch),
            });
        }
        ctx.progress("Changes:");
        for line in diff.lines() {
            ctx.emit(line);
        }

        if !self.fix.commit {
            return Ok(Self::stopped_at(branch, "changes left uncommitted"));
        }
        let message = format!("fix: resolve issue #{number} - {}", issue.title);
        ctx.progress(format!("Committing: {message}"));
        if !ctx.guard(self.vcs.commit_all(workdir, &message)).await? {
            warn!(task_id = %ctx.task_id, "Diff was non-empty but nothing was committed");
            return Ok(TaskSuccess {
                summary: NO_CHANGES.to_string(),
                pull_request_url: None,
                branch: Some(branch),
            });
        }

        if !self.fix.push {
            return Ok(Self::stopped_at(branch, "committed locally"));
        }
        ctx.progress("Forking repository");
        let fork = ctx.guard(self.repos.fork_repository(repo)).await?;
        ctx.progress(format!("Pushing {branch} to {fork}"));
        ctx.guard(self.repos.push_branch(workdir, &fork, &branch))
            .await?;

        if !self.fix.open_pull_request {
            return Ok(Self::stopped_at(branch, &format!("pushed to {fork}")));
        }
        let head = if fork.owner.eq_ignore_ascii_case(&repo.owner) {
            branch.clone()
        } else {
            format!("{}:{branch}", fork.owner)
        };
        let request = PullRequestRequest {
            title: format!("Fix #{number}: {}", issue.title),
            body: pull_request_body(number),
            head,
            base,
        };
        ctx.progress("Opening pull request");
        let pr = ctx
            .guard(self.repos.create_pull_request(repo, &request))
            .await?;
        ctx.progress(format!("Pull request opened: {}", pr.html_url));
        info!(task_id = %ctx.task_id, url = %pr.html_url, "Fix submitted");

        Ok(TaskSuccess {
            summary: format!("opened pull request #{}", pr.number),
            pull_request_url: Some(pr.html_url),
            branch: Some(branch),
        })
    }

    async fn find_issue(&self, ctx: &ExecutionContext, number: u64) -> Result<Issue, TaskOutcome> {
        let issue = ctx
            .guard(self.repos.get_issue(&ctx.repository, number))
            .await?;
        issue.ok_or_else(|| {
            TaskOutcome::failed(
                FailureKind::Capability,
                format!("issue #{number} is not an open issue of {}", ctx.repository),
            )
        })
    }

    /// Run the tool and map anything but a clean exit to a task outcome.
    async fn run_tool(
        &self,
        ctx: &ExecutionContext,
        workdir: &Path,
        directive: &Directive,
    ) -> Result<String, TaskOutcome> {
        let outcome = self
            .tool
            .run_directive(workdir, directive, ctx.directive_io())
            .await
            .map_err(|e| TaskOutcome::failed(FailureKind::Launch, e.to_string()))?;
        match outcome {
            SupervisorOutcome::Succeeded { transcript } => Ok(transcript),
            SupervisorOutcome::Failed(detail) => Err(TaskOutcome::failed(
                FailureKind::Execution,
                format!("code-modification tool {detail}"),
            )),
            SupervisorOutcome::TimedOut => Err(TaskOutcome::TimedOut),
            SupervisorOutcome::Cancelled => Err(TaskOutcome::Cancelled),
        }
    }

    fn stopped_at(branch: String, summary: &str) -> TaskSuccess {
        TaskSuccess {
            summary: summary.to_string(),
            pull_request_url: None,
            branch: Some(branch),
        }
    }
}

fn pull_request_body(number: u64) -> String {
    format!(
        "## Summary\nThis PR fixes #{number}.\n\n\
         ## Changes\n- Automated fix generated by Remedy\n\n\
         ## Related Issue\nCloses #{number}\n"
    )
}

#[async_trait]
impl TaskRunner for TaskExecutor {
    async fn run(&self, ctx: ExecutionContext) -> TaskOutcome {
        let result = match ctx.kind {
            TaskKind::CloneAndReview => self.review(&ctx).await,
            TaskKind::FixIssue => self.fix_issue(&ctx).await,
        };
        match result {
            Ok(success) => TaskOutcome::Succeeded(success),
            Err(outcome) => {
                if let TaskOutcome::Failed(detail) = &outcome {
                    ctx.progress(format!("Failed: {}", detail.message));
                }
                outcome
            }
        }
    }
}
