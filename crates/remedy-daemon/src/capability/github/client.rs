//! GitHub REST API client.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use remedy_core::config::GitHubConfig;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::types::{GhError, GhIssue, GhRepository, GhUser, issues_only, open_issue};
use crate::capability::{
    CapabilityError, GitCli, Issue, IssueQuery, PullRequest, PullRequestRequest, RepositoryClient,
};
use crate::task::RepositoryRef;

/// GitHub may take a moment before a new fork accepts pushes.
const FORK_READY_ATTEMPTS: u32 = 5;
const FORK_READY_INTERVAL: Duration = Duration::from_secs(2);

/// GitHub's largest page size.
const MAX_PER_PAGE: u32 = 100;
/// Stop paging an issue listing after this many pages.
const MAX_ISSUE_PAGES: u32 = 10;

/// GitHub REST API client plus git transport.
#[derive(Debug)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    web_url: String,
    issues_per_page: u32,
    token: Option<String>,
    git: GitCli,
    login: OnceCell<String>,
}

impl GitHubClient {
    /// Create a client. Without a token only public reads work.
    pub fn new(config: &GitHubConfig, token: Option<String>) -> Result<Self, CapabilityError> {
        if config.api_url.is_empty() {
            return Err(CapabilityError::Config("github.api_url is empty".into()));
        }
        if config.web_url.is_empty() {
            return Err(CapabilityError::Config("github.web_url is empty".into()));
        }
        let token = token.filter(|t| !t.trim().is_empty());

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("remedy/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = &token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| CapabilityError::Config("Invalid token format".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        // reqwest is built with rustls-no-provider; Err means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            web_url: config.web_url.trim_end_matches('/').to_string(),
            issues_per_page: config.issues_per_page.clamp(1, MAX_PER_PAGE),
            git: GitCli::new().with_secret(token.clone()),
            token,
            login: OnceCell::new(),
        })
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// Anonymous clone URL, stored as the clone's `origin`.
    pub(crate) fn public_clone_url(&self, repo: &RepositoryRef) -> String {
        format!("{}/{}/{}.git", self.web_url, repo.owner, repo.name)
    }

    /// Clone URL with the token embedded, passed to git on the command line only.
    pub(crate) fn authenticated_clone_url(&self, repo: &RepositoryRef) -> String {
        let url = self.public_clone_url(repo);
        match (&self.token, url.strip_prefix("https://")) {
            (Some(token), Some(rest)) => format!("https://x-access-token:{token}@{rest}"),
            _ => url,
        }
    }

    /// `GET /repos/{owner}/{repo}/issues` URL for one page of open issues.
    pub(crate) fn issues_url(
        &self,
        repo: &RepositoryRef,
        labels: &[String],
        per_page: u32,
        page: u32,
    ) -> Result<reqwest::Url, CapabilityError> {
        let mut url = reqwest::Url::parse(
            &self.api_url(&format!("/repos/{}/{}/issues", repo.owner, repo.name)),
        )
        .map_err(|e| CapabilityError::Config(format!("Invalid API URL: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("state", "open");
            pairs.append_pair("per_page", &per_page.to_string());
            pairs.append_pair("page", &page.to_string());
            if !labels.is_empty() {
                pairs.append_pair("labels", &labels.join(","));
            }
        }
        Ok(url)
    }

    fn require_token(&self, operation: &str) -> Result<(), CapabilityError> {
        if self.token.is_none() {
            return Err(CapabilityError::Config(format!(
                "GITHUB_TOKEN is required to {operation}"
            )));
        }
        Ok(())
    }

    /// Turn a non-success response into an API error carrying GitHub's message.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CapabilityError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let fallback = status.canonical_reason().unwrap_or("Unknown").to_string();
        let message = resp
            .json::<GhError>()
            .await
            .map_or(fallback, |e| e.message);
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CapabilityError::NotFound(message));
        }
        Err(CapabilityError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Login of the token's owner.
    pub async fn authenticated_login(&self) -> Result<&str, CapabilityError> {
        self.require_token("identify the authenticated user")?;
        let login = self
            .login
            .get_or_try_init(|| async {
                let resp = self.http.get(self.api_url("/user")).send().await?;
                let user: GhUser = Self::check(resp).await?.json().await?;
                debug!(login = %user.login, "Authenticated to GitHub");
                Ok::<_, CapabilityError>(user.login)
            })
            .await?;
        Ok(login.as_str())
    }

    async fn wait_for_repository(&self, repo: &RepositoryRef) -> Result<(), CapabilityError> {
        let url = self.api_url(&format!("/repos/{}/{}", repo.owner, repo.name));
        for attempt in 1..=FORK_READY_ATTEMPTS {
            let resp = self.http.get(&url).send().await?;
            if resp.status().is_success() {
                return Ok(());
            }
            debug!(attempt, fork = %repo, status = %resp.status(), "Fork not ready yet");
            tokio::time::sleep(FORK_READY_INTERVAL).await;
        }
        Err(CapabilityError::NotFound(format!(
            "fork {repo} did not become available"
        )))
    }
}

#[async_trait]
impl RepositoryClient for GitHubClient {
    async fn list_issues(
        &self,
        repo: &RepositoryRef,
        query: &IssueQuery,
    ) -> Result<Vec<Issue>, CapabilityError> {
        let limit = query.limit.unwrap_or(self.issues_per_page).max(1);
        let per_page = limit.min(MAX_PER_PAGE);

        let issues = collect_issue_pages(limit as usize, per_page, |page| async move {
            let url = self.issues_url(repo, &query.labels, per_page, page)?;
            let resp = Self::check(self.http.get(url).send().await?).await?;
            Ok::<_, CapabilityError>(resp.json::<Vec<GhIssue>>().await?)
        })
        .await?;
        debug!(repository = %repo, count = issues.len(), "Listed issues");
        Ok(issues)
    }

    async fn get_issue(
        &self,
        repo: &RepositoryRef,
        number: u64,
    ) -> Result<Option<Issue>, CapabilityError> {
        let url = self.api_url(&format!(
            "/repos/{}/{}/issues/{number}",
            repo.owner, repo.name
        ));
        let resp = match Self::check(self.http.get(url).send().await?).await {
            Ok(resp) => resp,
            Err(CapabilityError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let issue = open_issue(resp.json().await?);
        debug!(repository = %repo, number, found = issue.is_some(), "Looked up issue");
        Ok(issue)
    }

    async fn fork_repository(&self, repo: &RepositoryRef) -> Result<RepositoryRef, CapabilityError> {
        let login = self.authenticated_login().await?;
        if login.eq_ignore_ascii_case(&repo.owner) {
            debug!(repository = %repo, "Repository is owned by the token holder, not forking");
            return Ok(repo.clone());
        }

        let resp = self
            .http
            .post(self.api_url(&format!("/repos/{}/{}/forks", repo.owner, repo.name)))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let fork: GhRepository = Self::check(resp).await?.json().await?;
        let fork = RepositoryRef {
            owner: fork.owner.login,
            name: fork.name,
        };
        self.wait_for_repository(&fork).await?;
        info!(upstream = %repo, fork = %fork, "Repository forked");
        Ok(fork)
    }

    async fn clone_repository(
        &self,
        repo: &RepositoryRef,
        dest: &Path,
    ) -> Result<(), CapabilityError> {
        self.git
            .clone_or_update(
                &self.authenticated_clone_url(repo),
                &self.public_clone_url(repo),
                dest,
            )
            .await
    }

    async fn push_branch(
        &self,
        workdir: &Path,
        remote: &RepositoryRef,
        branch: &str,
    ) -> Result<(), CapabilityError> {
        self.require_token("push")?;
        self.git
            .push(workdir, &self.authenticated_clone_url(remote), branch)
            .await
    }

    async fn create_pull_request(
        &self,
        repo: &RepositoryRef,
        request: &PullRequestRequest,
    ) -> Result<PullRequest, CapabilityError> {
        self.require_token("open a pull request")?;
        let resp = self
            .http
            .post(self.api_url(&format!("/repos/{}/{}/pulls", repo.owner, repo.name)))
            .json(request)
            .send()
            .await?;
        let pr: PullRequest = Self::check(resp).await?.json().await?;
        info!(repository = %repo, number = pr.number, url = %pr.html_url, "Pull request opened");
        Ok(pr)
    }
}

/// Page through an issue listing until `limit` real issues are collected.
///
/// Pull requests share the listing, so a full page can still leave the
/// result short. Paging stops at the first short page or after
/// `MAX_ISSUE_PAGES`.
pub(crate) async fn collect_issue_pages<F, Fut>(
    limit: usize,
    per_page: u32,
    mut fetch: F,
) -> Result<Vec<Issue>, CapabilityError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<GhIssue>, CapabilityError>>,
{
    let mut issues = Vec::new();
    for page in 1..=MAX_ISSUE_PAGES {
        let raw = fetch(page).await?;
        let exhausted = raw.len() < per_page as usize;
        issues.extend(issues_only(raw, limit - issues.len()));
        if issues.len() >= limit || exhausted {
            break;
        }
    }
    Ok(issues)
}
