//! External collaborators, reached only through narrow capability traits.
//!
//! - [`RepositoryClient`]: the hosted repository service (issues, forks,
//!   pull requests) plus getting code to and from it.
//! - [`VersionControl`]: local working-copy operations.
//! - [`CodeModifier`]: the AI code-modification tool.
//!
//! The default adapters are [`GitHubClient`], [`GitCli`] and [`AiderTool`].

pub mod aider;
pub mod git;
pub mod github;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::subprocess::{LaunchError, OutputSink, SupervisorConfig, SupervisorOutcome};
use crate::task::RepositoryRef;

pub use aider::AiderTool;
pub use git::GitCli;
pub use github::GitHubClient;

/// Errors from capability calls. The core never retries these.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// An open issue on a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub url: String,
    pub comments: u64,
}

/// Filter for [`RepositoryClient::list_issues`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IssueQuery {
    /// Only issues carrying all of these labels.
    pub labels: Vec<String>,
    /// Upper bound on returned issues; `None` uses the client default.
    pub limit: Option<u32>,
}

/// Request body for a new pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestRequest {
    pub title: String,
    pub body: String,
    /// `owner:branch` for cross-repository pull requests, or a bare branch.
    pub head: String,
    pub base: String,
}

/// A created pull request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

/// The hosted repository service.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    async fn list_issues(
        &self,
        repo: &RepositoryRef,
        query: &IssueQuery,
    ) -> Result<Vec<Issue>, CapabilityError>;

    /// Look up one issue by number. `None` when the number is unknown, is a
    /// pull request, or the issue is closed.
    async fn get_issue(
        &self,
        repo: &RepositoryRef,
        number: u64,
    ) -> Result<Option<Issue>, CapabilityError>;

    /// Fork `repo` into the authenticated account and return the fork.
    /// Repositories the account already owns are returned unchanged.
    async fn fork_repository(&self, repo: &RepositoryRef) -> Result<RepositoryRef, CapabilityError>;

    /// Clone `repo` into `dest`, or update the clone already there.
    async fn clone_repository(&self, repo: &RepositoryRef, dest: &Path)
    -> Result<(), CapabilityError>;

    /// Push `branch` from the clone at `workdir` to `remote`.
    async fn push_branch(
        &self,
        workdir: &Path,
        remote: &RepositoryRef,
        branch: &str,
    ) -> Result<(), CapabilityError>;

    async fn create_pull_request(
        &self,
        repo: &RepositoryRef,
        request: &PullRequestRequest,
    ) -> Result<PullRequest, CapabilityError>;
}

/// Local working-copy operations.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Branch the remote's HEAD points at, `main` if unknown.
    async fn default_branch(&self, workdir: &Path) -> Result<String, CapabilityError>;

    /// Check out `branch`, creating it from an up-to-date `base` if needed.
    async fn checkout_branch(
        &self,
        workdir: &Path,
        base: &str,
        branch: &str,
    ) -> Result<(), CapabilityError>;

    /// Staged, unstaged and untracked changes; empty when clean.
    async fn diff(&self, workdir: &Path) -> Result<String, CapabilityError>;

    /// Stage everything and commit. Returns `false` if there was nothing to commit.
    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool, CapabilityError>;
}

/// An instruction for the code-modification tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Summarise the project and suggest improvements.
    Review,
    FixIssue {
        number: u64,
        title: String,
        body: String,
    },
}

impl Directive {
    /// The natural-language message handed to the tool.
    pub fn message(&self) -> String {
        match self {
            Self::Review => "Please review this project's code and tell me:\n\
                1. What the project's main purpose is\n\
                2. How the code is organised\n\
                3. Which modules and files matter most\n\
                4. What the technology stack is\n\
                5. What could be improved"
                .to_string(),
            Self::FixIssue {
                number,
                title,
                body,
            } => format!(
                "Please fix the following issue (#{number}).\n\n\
                 ## Issue title\n{title}\n\n\
                 ## Issue description\n{body}\n\n\
                 Please:\n\
                 1. Analyse the root cause\n\
                 2. Find the relevant code\n\
                 3. Implement the fix\n\
                 4. Make sure existing behaviour is not broken"
            ),
        }
    }
}

/// Where a directive's output goes and how long it may run.
#[derive(Clone)]
pub struct DirectiveIo {
    pub output: Arc<dyn OutputSink>,
    pub cancel: CancellationToken,
    pub limits: SupervisorConfig,
}

/// The AI code-modification tool.
#[async_trait]
pub trait CodeModifier: Send + Sync {
    async fn run_directive(
        &self,
        workdir: &Path,
        directive: &Directive,
        io: DirectiveIo,
    ) -> Result<SupervisorOutcome, LaunchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_directive_carries_issue() {
        let msg = Directive::FixIssue {
            number: 42,
            title: "Crash on empty input".into(),
            body: "Steps to reproduce...".into(),
        }
        .message();
        assert!(msg.contains("#42"));
        assert!(msg.contains("Crash on empty input"));
        assert!(msg.contains("Steps to reproduce..."));
    }

    #[test]
    fn review_directive_is_stable() {
        assert!(Directive::Review.message().starts_with("Please review"));
    }
}
