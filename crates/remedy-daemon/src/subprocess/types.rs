//! Process supervisor inputs, outcomes and errors.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

/// Number of trailing transcript lines kept in an [`ExitDetail`].
pub const TRANSCRIPT_TAIL_LINES: usize = 20;

/// The external command to supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Time limits for one supervised invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Wall-clock budget from spawn to exit.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL during teardown.
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// How a non-successful process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDetail {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if killed by one (unix).
    pub signal: Option<i32>,
    /// Last lines of captured output.
    pub transcript_tail: String,
}

impl fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}")?,
            (None, Some(signal)) => write!(f, "killed by signal {signal}")?,
            (None, None) => f.write_str("exited abnormally")?,
        }
        if !self.transcript_tail.is_empty() {
            write!(f, "\n{}", self.transcript_tail)?;
        }
        Ok(())
    }
}

/// Terminal result of a supervised invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Clean exit; `transcript` is every captured line, newline-joined.
    Succeeded { transcript: String },
    Failed(ExitDetail),
    /// The timeout elapsed and the process was torn down.
    TimedOut,
    /// Cancellation was requested and the process was torn down.
    Cancelled,
}

impl SupervisorOutcome {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// The external process could not be started.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("working directory {path} is not usable: {reason}")]
    InvalidWorkdir { path: PathBuf, reason: String },

    #[error("program not found: {program}")]
    ProgramNotFound { program: PathBuf },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Receives each captured output line as soon as it is read.
///
/// Called from the supervisor's monitor task; implementations must not block.
pub trait OutputSink: Send + Sync {
    fn emit(&self, chunk: String);
}

impl OutputSink for mpsc::UnboundedSender<String> {
    fn emit(&self, chunk: String) {
        let _ = self.send(chunk);
    }
}

/// Accumulated output of one invocation.
#[derive(Debug, Default)]
pub(crate) struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    pub(crate) fn push(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    pub(crate) fn full(&self) -> String {
        self.lines.join("\n")
    }

    pub(crate) fn tail(&self, n: usize) -> String {
        let start = self.lines.len().saturating_sub(n);
        self.lines[start..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_tail_keeps_last_lines() {
        let mut t = Transcript::default();
        for i in 0..30 {
            t.push(&format!("line {i}"));
        }
        let tail = t.tail(3);
        assert_eq!(tail, "line 27\nline 28\nline 29");
        assert_eq!(t.full().lines().count(), 30);
    }

    #[test]
    fn exit_detail_display() {
        let detail = ExitDetail {
            code: Some(2),
            signal: None,
            transcript_tail: "boom".into(),
        };
        assert_eq!(detail.to_string(), "exited with code 2\nboom");

        let killed = ExitDetail {
            code: None,
            signal: Some(9),
            transcript_tail: String::new(),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
    }

    #[test]
    fn command_builder() {
        let spec = CommandSpec::new("aider", "/tmp")
            .arg("--yes")
            .args(["--message", "hi"])
            .env("NO_COLOR", "1");
        assert_eq!(spec.args, vec!["--yes", "--message", "hi"]);
        assert_eq!(spec.env, vec![("NO_COLOR".to_string(), "1".to_string())]);
    }
}
