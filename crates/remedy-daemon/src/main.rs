//! Remedy
//!
//! Command-line entry point: registers repositories, lists their issues and
//! runs review and fix tasks through the scheduler, streaming task output to
//! stdout while it is produced.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{info, warn};

use remedy_core::Config;
use remedy_daemon::capability::{
    AiderTool, GitCli, GitHubClient, IssueQuery, RepositoryClient, VersionControl,
};
use remedy_daemon::orchestration::{Scheduler, SchedulerConfig, TaskExecutor};
use remedy_daemon::service::RemediationService;
use remedy_daemon::sink::{ChannelSink, EventSink, FanoutSink, TracingSink};
use remedy_daemon::storage::{Database, TaskRecorder};
use remedy_daemon::task::{RepositoryRef, TaskEvent, TaskId, TaskResult, TaskState};
use remedy_daemon::workspace::WorkspaceManager;

/// How long to wait for the task recorder to flush on exit.
const RECORDER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "remedy")]
#[command(version, about = "Remedy - automated issue remediation across repositories")]
struct Cli {
    /// Directory whose `.remedy/config.toml` is loaded (defaults to the current directory)
    #[arg(long, global = true, env = "REMEDY_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, global = true, env = "REMEDY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Maximum number of tasks running at once
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Per-task timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Root directory for repository clones
    #[arg(long, global = true)]
    workdir_root: Option<PathBuf>,

    /// GitHub token used for API calls, pushes and pull requests
    #[arg(long, global = true, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true, default_value = "warn", env = "REMEDY_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "REMEDY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clone each repository and run a review
    Review {
        /// Repositories as `owner/name` or GitHub URLs
        #[arg(required = true)]
        repositories: Vec<String>,
    },
    /// Attempt to fix issues and open pull requests
    Fix {
        /// Repository as `owner/name` or GitHub URL
        repository: String,
        /// Issue numbers
        #[arg(required = true)]
        issues: Vec<u64>,
    },
    /// List open issues of a repository
    Issues {
        repository: String,
        /// Only issues with this label (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Maximum number of issues
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Manage registered repositories
    Repos {
        #[command(subcommand)]
        action: ReposAction,
    },
}

#[derive(Subcommand, Debug)]
enum ReposAction {
    /// List registered repositories
    List,
    /// Register a repository
    Add { repository: String },
    /// Unregister a repository (by id or `owner/name`)
    Remove { repository: String },
    /// Show recorded tasks of a repository
    Tasks { repository: String },
}

struct App {
    service: RemediationService,
    recorder: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let log_filter = format!("remedy={0},remedy_daemon={0},remedy_core={0}", cli.log_level);
    remedy_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    let config = resolve_config(&cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_workers = config.orchestrator.max_workers,
        timeout_secs = config.orchestrator.task_timeout_secs,
        "Starting remedy"
    );

    let app = build(&cli, &config).await?;
    let code = match cli.command {
        Command::Review { repositories } => review(&app.service, &repositories).await?,
        Command::Fix { repository, issues } => fix(&app.service, &repository, &issues).await?,
        Command::Issues {
            repository,
            labels,
            limit,
        } => {
            list_issues(&app.service, &repository, IssueQuery { labels, limit }).await?;
            ExitCode::SUCCESS
        }
        Command::Repos { action } => {
            repos(&app.service, action).await?;
            ExitCode::SUCCESS
        }
    };

    // Dropping the service drops the scheduler, which closes the recorder's channel.
    drop(app.service);
    if tokio::time::timeout(RECORDER_FLUSH_TIMEOUT, app.recorder)
        .await
        .is_err()
    {
        warn!("Task recorder did not finish in time");
    }
    Ok(code)
}

/// Defaults, config files and `REMEDY_*` variables, then CLI flags on top.
fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let mut config = remedy_core::config::load_config(Some(&project_dir))?;

    if let Some(max_workers) = cli.max_workers {
        config.orchestrator.max_workers = max_workers;
    }
    if let Some(timeout) = cli.timeout {
        config.orchestrator.task_timeout_secs = timeout;
    }
    if let Some(root) = &cli.workdir_root {
        config.orchestrator.workdir_root = Some(root.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn build(cli: &Cli, config: &Config) -> anyhow::Result<App> {
    let db_path = match &cli.db_path {
        Some(path) => path.clone(),
        None => remedy_home()?.join("remedy.db"),
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let workdir_root = match &config.orchestrator.workdir_root {
        Some(root) => root.clone(),
        None => remedy_home()?.join("repos"),
    };

    let token = cli.github_token.clone();
    let github: Arc<dyn RepositoryClient> =
        Arc::new(GitHubClient::new(&config.github, token.clone())?);
    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new().with_secret(token));
    let executor = TaskExecutor::new(
        Arc::clone(&github),
        vcs,
        Arc::new(AiderTool::new(&config.tool)),
        Arc::new(WorkspaceManager::new(workdir_root)),
        config.fix.clone(),
    );

    let (channel, events) = ChannelSink::new();
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink), Arc::new(channel)];
    let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(sinks));
    let scheduler = Scheduler::new(
        SchedulerConfig::from(config),
        Arc::new(executor),
        Arc::clone(&sink),
    )?;
    let recorder = TaskRecorder::new(db.clone()).spawn(events);

    Ok(App {
        service: RemediationService::new(scheduler, github, db, sink),
        recorder,
    })
}

/// `~/.remedy`
fn remedy_home() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".remedy"))
}

async fn review(service: &RemediationService, repositories: &[String]) -> anyhow::Result<ExitCode> {
    let mut tasks = Vec::new();
    for repository in repositories {
        let row = service.add_repository(repository).await?;
        tasks.push(service.start_task(&row.id).await?);
    }
    follow(service, &tasks).await
}

async fn fix(
    service: &RemediationService,
    repository: &str,
    issues: &[u64],
) -> anyhow::Result<ExitCode> {
    let row = service.add_repository(repository).await?;
    let mut tasks = Vec::new();
    for issue in issues {
        tasks.push(service.fix_issue(&row.id, *issue).await?);
    }
    follow(service, &tasks).await
}

/// Stream the tasks' events to stdout until every task has finished.
/// Ctrl+C cancels all of them; their terminal events are still printed.
async fn follow(service: &RemediationService, tasks: &[TaskId]) -> anyhow::Result<ExitCode> {
    let scheduler = service.scheduler();
    let mut streams = StreamMap::new();
    for id in tasks {
        streams.insert(*id, scheduler.subscribe(*id)?);
    }
    let prefixed = tasks.len() > 1;
    let mut out = io::stdout();
    let mut interrupted = false;

    loop {
        tokio::select! {
            next = streams.next() => {
                let Some((id, event)) = next else { break };
                print_event(&mut out, id, &event, prefixed)?;
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                let count = scheduler.shutdown();
                writeln!(out, "Interrupted, cancelling {count} task(s)...")?;
            }
        }
    }

    writeln!(out)?;
    let mut all_succeeded = true;
    for id in tasks {
        let snapshot = scheduler.status(*id)?;
        all_succeeded &= snapshot.state == TaskState::Succeeded;
        let detail = match &snapshot.result {
            Some(TaskResult::Succeeded(success)) => success
                .pull_request_url
                .clone()
                .unwrap_or_else(|| success.summary.clone()),
            Some(TaskResult::Failed(failure)) => failure.message.clone(),
            None => String::new(),
        };
        writeln!(
            out,
            "{}  {:<10}  {}  {}",
            short_id(*id),
            snapshot.state,
            snapshot.repository,
            detail
        )?;
    }
    Ok(if all_succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_event(out: &mut impl Write, id: TaskId, event: &TaskEvent, prefixed: bool) -> io::Result<()> {
    let prefix = if prefixed {
        format!("[{}] ", short_id(id))
    } else {
        String::new()
    };
    match event {
        TaskEvent::StatusChanged {
            old_state: Some(old),
            new_state,
            ..
        } => writeln!(out, "{prefix}== {old} -> {new_state}"),
        TaskEvent::StatusChanged { new_state, .. } => writeln!(out, "{prefix}== {new_state}"),
        TaskEvent::OutputChunk { text, .. } => writeln!(out, "{prefix}{text}"),
    }
}

fn short_id(id: TaskId) -> String {
    id.to_string().chars().take(8).collect()
}

async fn list_issues(
    service: &RemediationService,
    repository: &str,
    query: IssueQuery,
) -> anyhow::Result<()> {
    let row = service.add_repository(repository).await?;
    let issues = service.list_issues(&row.id, &query).await?;
    let mut out = io::stdout();
    if issues.is_empty() {
        writeln!(out, "No open issues.")?;
        return Ok(());
    }
    writeln!(out, "{:>6}  {:<60}  LABELS", "NUMBER", "TITLE")?;
    for issue in &issues {
        let title: String = issue.title.chars().take(60).collect();
        writeln!(
            out,
            "{:>6}  {:<60}  {}",
            format!("#{}", issue.number),
            title,
            issue.labels.join(",")
        )?;
    }
    writeln!(out, "\n{} issue(s)", issues.len())?;
    Ok(())
}

async fn repos(service: &RemediationService, action: ReposAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        ReposAction::List => {
            let rows = service.list_repositories().await?;
            if rows.is_empty() {
                writeln!(out, "No repositories registered.")?;
                return Ok(());
            }
            writeln!(out, "{:<36}  REPOSITORY", "ID")?;
            for row in &rows {
                writeln!(out, "{:<36}  {}", row.id, row.full_name)?;
            }
        }
        ReposAction::Add { repository } => {
            let row = service.add_repository(&repository).await?;
            writeln!(out, "Registered {} ({})", row.full_name, row.id)?;
        }
        ReposAction::Remove { repository } => {
            let id = resolve_repository_id(service, &repository).await?;
            let cancelled = service.remove_repository(&id).await?;
            writeln!(out, "Repository {id} unregistered.")?;
            if !cancelled.is_empty() {
                writeln!(out, "  Tasks cancelled: {}", cancelled.len())?;
            }
        }
        ReposAction::Tasks { repository } => {
            let id = resolve_repository_id(service, &repository).await?;
            let records = service.task_history(&id).await?;
            if records.is_empty() {
                writeln!(out, "No tasks recorded.")?;
                return Ok(());
            }
            writeln!(out, "{:<36}  {:<16}  {:<6}  STATE", "TASK", "KIND", "ISSUE")?;
            for record in &records {
                let issue = record
                    .issue_number
                    .map(|n| format!("#{n}"))
                    .unwrap_or_default();
                writeln!(
                    out,
                    "{:<36}  {:<16}  {:<6}  {}",
                    record.id, record.kind, issue, record.state
                )?;
            }
        }
    }
    Ok(())
}

/// Accept either a repository record id or an `owner/name` reference.
async fn resolve_repository_id(
    service: &RemediationService,
    repository: &str,
) -> anyhow::Result<String> {
    if let Ok(repo) = RepositoryRef::parse(repository)
        && let Some(row) = service.db().find_repository(&repo).await?
    {
        return Ok(row.id);
    }
    Ok(repository.to_string())
}
