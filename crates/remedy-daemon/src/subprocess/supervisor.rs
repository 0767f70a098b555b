//! Spawning, monitoring and teardown of a single external process.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{
    CommandSpec, ExitDetail, LaunchError, OutputSink, SupervisorConfig, SupervisorOutcome,
    TRANSCRIPT_TAIL_LINES, Transcript,
};

/// Lines buffered between the pipe readers and the monitor.
const LINE_BUFFER: usize = 1024;

/// How long to keep draining pipes after the process has exited.
///
/// A grandchild that inherited stdout can keep the pipe open forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches external processes under supervision.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn `spec` and start monitoring it.
    ///
    /// Output lines are forwarded to `output` in the order they are read.
    /// Tripping `cancel` (or calling [`SupervisorHandle::cancel`]) tears the
    /// process down. Must be called inside a Tokio runtime.
    pub fn start(
        spec: CommandSpec,
        config: SupervisorConfig,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<SupervisorHandle, LaunchError> {
        check_workdir(&spec)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::ProgramNotFound {
                    program: spec.program.clone(),
                }
            } else {
                LaunchError::Spawn {
                    program: spec.program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id();
        info!(
            program = %spec.program.display(),
            workdir = %spec.workdir.display(),
            pid,
            "Supervised process started"
        );

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        let cancel = cancel.child_token();
        let join = tokio::spawn(monitor(child, line_rx, output, cancel.clone(), config));

        Ok(SupervisorHandle { pid, cancel, join })
    }

    /// Start `spec` and wait for its outcome.
    pub async fn run(
        spec: CommandSpec,
        config: SupervisorConfig,
        output: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<SupervisorOutcome, LaunchError> {
        Ok(Self::start(spec, config, output, cancel)?.wait().await)
    }
}

/// Handle to a running supervised process.
#[derive(Debug)]
pub struct SupervisorHandle {
    pid: Option<u32>,
    cancel: CancellationToken,
    join: JoinHandle<SupervisorOutcome>,
}

impl SupervisorHandle {
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request teardown. The outcome resolves to `Cancelled` unless the
    /// process had already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the process to finish and return its outcome.
    pub async fn wait(self) -> SupervisorOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => SupervisorOutcome::Failed(ExitDetail {
                code: None,
                signal: None,
                transcript_tail: format!("supervisor task failed: {e}"),
            }),
        }
    }
}

fn check_workdir(spec: &CommandSpec) -> Result<(), LaunchError> {
    match std::fs::metadata(&spec.workdir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(LaunchError::InvalidWorkdir {
            path: spec.workdir.clone(),
            reason: "not a directory".to_string(),
        }),
        Err(e) => Err(LaunchError::InvalidWorkdir {
            path: spec.workdir.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Read `reader` line by line (lossy UTF-8) into `tx` until EOF or until
/// the monitor stops listening.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

async fn monitor(
    mut child: Child,
    mut lines: mpsc::Receiver<String>,
    output: Arc<dyn OutputSink>,
    cancel: CancellationToken,
    config: SupervisorConfig,
) -> SupervisorOutcome {
    let pid = child.id();
    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    let mut transcript = Transcript::default();
    let mut streams_open = true;

    let status = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(pid, "Cancelling supervised process");
                teardown(&mut child, config.grace_period).await;
                return SupervisorOutcome::Cancelled;
            }
            () = &mut deadline => {
                warn!(pid, timeout = ?config.timeout, "Supervised process timed out");
                teardown(&mut child, config.grace_period).await;
                return SupervisorOutcome::TimedOut;
            }
            line = lines.recv(), if streams_open => match line {
                Some(line) => {
                    transcript.push(&line);
                    output.emit(line);
                }
                None => streams_open = false,
            },
            status = child.wait() => break status,
        }
    };

    // The process is gone; collect whatever is still in the pipes.
    while streams_open {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return SupervisorOutcome::Cancelled,
            line = tokio::time::timeout(DRAIN_TIMEOUT, lines.recv()) => match line {
                Ok(Some(line)) => {
                    transcript.push(&line);
                    output.emit(line);
                }
                Ok(None) => streams_open = false,
                Err(_) => {
                    debug!(pid, "Output still open after exit, giving up on drain");
                    streams_open = false;
                }
            },
        }
    }

    match status {
        Ok(status) if status.success() => {
            info!(pid, "Supervised process exited successfully");
            SupervisorOutcome::Succeeded {
                transcript: transcript.full(),
            }
        }
        Ok(status) => {
            info!(pid, ?status, "Supervised process failed");
            SupervisorOutcome::Failed(ExitDetail {
                code: status.code(),
                signal: exit_signal(status),
                transcript_tail: transcript.tail(TRANSCRIPT_TAIL_LINES),
            })
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to wait for supervised process");
            SupervisorOutcome::Failed(ExitDetail {
                code: None,
                signal: None,
                transcript_tail: format!("wait failed: {e}"),
            })
        }
    }
}

/// SIGTERM the process group, escalate to SIGKILL after `grace`, then reap.
async fn teardown(child: &mut Child, grace: Duration) {
    // Reaping clears `Child::id`, so take it first.
    let pid = child.id();
    signal_group(child, pid, Signal::Terminate);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, "Process exited after SIGTERM");
            // Stragglers in the group that ignored SIGTERM.
            signal_group(child, pid, Signal::Kill);
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for process, killing");
            signal_group(child, pid, Signal::Kill);
            let _ = child.kill().await;
        }
        Err(_) => {
            warn!(grace = ?grace, "Grace period expired, sending SIGKILL");
            signal_group(child, pid, Signal::Kill);
            let _ = child.kill().await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: the child was spawned as leader of its own process group, so
    // -pid addresses only that group. kill(2) has no memory-safety impact.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(-(pid as i32), sig) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: group already empty.
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, signal = ?signal, error = %err, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: Signal) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}
