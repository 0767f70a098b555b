//! Configuration resolution for Remedy.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/remedy/config.toml)
//! 3. Project config (.remedy/config.toml)
//! 4. Environment variables (`REMEDY_*`)
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Files are merged key by key, so a project file that only sets
//! `orchestrator.max_workers` keeps every other value from the layers below.
//! The resolved configuration is read once at startup and never reloaded.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Remedy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub fix: FixConfig,
}

/// Scheduler and worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of worker slots; bounds how many tasks run at once.
    pub max_workers: usize,
    /// Wall-clock budget for a whole task, from `Running` to terminal.
    pub task_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when tearing down a subprocess.
    pub grace_period_secs: u64,
    /// Root directory for repository clones. `None` means `~/.remedy/repos`.
    pub workdir_root: Option<PathBuf>,
    /// Capacity of each task's live event broadcast channel.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            task_timeout_secs: 30 * 60,
            grace_period_secs: 5,
            workdir_root: None,
            event_capacity: 256,
        }
    }
}

/// External code-modification tool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Path to the `aider` binary.
    pub binary: PathBuf,
    /// Model passed through `--model`, if any.
    pub model: Option<String>,
    /// Extra arguments appended before the directive.
    pub extra_args: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("aider"),
            model: None,
            extra_args: Vec::new(),
        }
    }
}

/// GitHub endpoint settings. The token itself is read from `GITHUB_TOKEN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_url: String,
    pub web_url: String,
    /// Page size used when listing issues.
    pub issues_per_page: u32,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            web_url: "https://github.com".to_string(),
            issues_per_page: 30,
        }
    }
}

/// How far the fix workflow goes after the tool has modified the clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    pub commit: bool,
    pub push: bool,
    pub open_pull_request: bool,
    pub branch_prefix: String,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            commit: true,
            push: true,
            open_pull_request: true,
            branch_prefix: "fix/issue-".to_string(),
        }
    }
}

impl Config {
    /// Check invariants the orchestration core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_workers == 0 {
            return Err(Error::Config(
                "orchestrator.max_workers must be at least 1".into(),
            ));
        }
        if self.orchestrator.task_timeout_secs == 0 {
            return Err(Error::Config(
                "orchestrator.task_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.orchestrator.event_capacity == 0 {
            return Err(Error::Config(
                "orchestrator.event_capacity must be greater than 0".into(),
            ));
        }
        if self.tool.binary.as_os_str().is_empty() {
            return Err(Error::Config("tool.binary must not be empty".into()));
        }
        if self.fix.open_pull_request && !(self.fix.commit && self.fix.push) {
            return Err(Error::Config(
                "fix.open_pull_request requires fix.commit and fix.push".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        layers.push(global_path);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".remedy").join("config.toml");
        if project_path.exists() {
            layers.push(project_path);
        }
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Merge the given TOML files, in order, over the built-in defaults.
pub fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = toml::Value::try_from(Config::default())
        .map_err(|e| Error::Config(format!("Failed to encode defaults: {e}")))?;

    for path in paths {
        let overlay = read_config_file(path)?;
        merge_values(&mut merged, overlay);
    }

    merged
        .try_into()
        .map_err(|e: toml::de::Error| Error::Config(format!("Invalid configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".remedy").join("config.toml"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/remedy/config.toml"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("remedy").join("config.toml"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn read_config_file(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`; tables merge, everything else replaces.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `REMEDY_*` overrides using `lookup` to read variables.
///
/// Unparseable numeric values are ignored so a typo cannot zero a limit.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("REMEDY_MAX_WORKERS").and_then(|v| v.parse().ok()) {
        config.orchestrator.max_workers = n;
    }
    if let Some(n) = lookup("REMEDY_TASK_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.orchestrator.task_timeout_secs = n;
    }
    if let Some(n) = lookup("REMEDY_GRACE_PERIOD_SECS").and_then(|v| v.parse().ok()) {
        config.orchestrator.grace_period_secs = n;
    }
    if let Some(dir) = lookup("REMEDY_WORKDIR_ROOT") {
        config.orchestrator.workdir_root = Some(PathBuf::from(dir));
    }
    if let Some(bin) = lookup("REMEDY_TOOL_BIN") {
        config.tool.binary = PathBuf::from(bin);
    }
    if let Some(model) = lookup("REMEDY_MODEL") {
        config.tool.model = Some(model);
    }
    if let Some(url) = lookup("REMEDY_GITHUB_API_URL") {
        config.github.api_url = url;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator.max_workers, 2);
        assert_eq!(config.orchestrator.grace_period_secs, 5);
        assert_eq!(config.tool.binary, PathBuf::from("aider"));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.orchestrator.max_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = Config::default();
        config.orchestrator.task_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pull_request_requires_push() {
        let mut config = Config::default();
        config.fix.push = false;
        assert!(config.validate().is_err());

        config.fix.open_pull_request = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn layers_merge_key_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(
            &global,
            "[orchestrator]\nmax_workers = 4\ngrace_period_secs = 9\n[tool]\nmodel = \"gpt-4o\"\n",
        )
        .unwrap();
        std::fs::write(&project, "[orchestrator]\nmax_workers = 1\n").unwrap();

        let config = load_layers(&[global, project]).unwrap();
        assert_eq!(config.orchestrator.max_workers, 1);
        assert_eq!(config.orchestrator.grace_period_secs, 9);
        assert_eq!(config.orchestrator.task_timeout_secs, 30 * 60);
        assert_eq!(config.tool.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.github.api_url, "https://api.github.com");
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[orchestrator\nmax_workers = ").unwrap();

        let err = load_layers(&[path]).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("REMEDY_MAX_WORKERS", "8"),
            ("REMEDY_TASK_TIMEOUT_SECS", "60"),
            ("REMEDY_WORKDIR_ROOT", "/srv/remedy"),
            ("REMEDY_MODEL", "sonnet"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.orchestrator.max_workers, 8);
        assert_eq!(config.orchestrator.task_timeout_secs, 60);
        assert_eq!(
            config.orchestrator.workdir_root,
            Some(PathBuf::from("/srv/remedy"))
        );
        assert_eq!(config.tool.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn env_override_ignores_garbage_numbers() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| {
            (k == "REMEDY_MAX_WORKERS").then(|| "many".to_string())
        });
        assert_eq!(config.orchestrator.max_workers, 2);
    }
}
