//! GitHub REST API v3 response types.

use serde::Deserialize;

use crate::capability::Issue;

/// An entry of `GET /repos/{owner}/{repo}/issues`.
///
/// The endpoint also returns pull requests; those carry `pull_request`.
#[derive(Debug, Clone, Deserialize)]
pub struct GhIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<GhLabel>,
    pub html_url: String,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
    /// `open` or `closed`; absent in some trimmed payloads.
    #[serde(default)]
    pub state: Option<String>,
}

impl GhIssue {
    pub const fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.state.as_deref().is_none_or(|s| s == "open")
    }
}

impl From<GhIssue> for Issue {
    fn from(gh: GhIssue) -> Self {
        Self {
            number: gh.number,
            title: gh.title,
            body: gh.body.unwrap_or_default(),
            labels: gh.labels.into_iter().map(|l| l.name).collect(),
            url: gh.html_url,
            comments: gh.comments,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhLabel {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhUser {
    pub login: String,
}

/// Repository payload (`POST /forks`, `GET /repos/...`).
#[derive(Debug, Clone, Deserialize)]
pub struct GhRepository {
    pub name: String,
    pub owner: GhUser,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Error body returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct GhError {
    pub message: String,
}

/// The issue itself, if it is an open issue and not a pull request.
pub fn open_issue(raw: GhIssue) -> Option<Issue> {
    (!raw.is_pull_request() && raw.is_open()).then(|| Issue::from(raw))
}

/// Keep real issues only, converted to the capability type.
pub fn issues_only(raw: Vec<GhIssue>, limit: usize) -> Vec<Issue> {
    raw.into_iter()
        .filter(|i| !i.is_pull_request())
        .take(limit)
        .map(Issue::from)
        .collect()
}
