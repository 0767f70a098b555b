//! What a worker slot runs, and the context it runs with.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityError, DirectiveIo};
use crate::subprocess::{OutputSink, SupervisorConfig};
use crate::task::{FailureKind, RepositoryRef, TaskId, TaskKind, TaskOutcome};

/// Executes one task body inside a worker slot.
///
/// Implementations report failures through the returned [`TaskOutcome`];
/// a panic is caught by the scheduler and recorded as an execution failure.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> TaskOutcome;
}

/// Everything a running task may use: its identity, its deadline, its
/// cancellation signal and its output channel.
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub repository: RepositoryRef,
    pub kind: TaskKind,
    pub issue_number: Option<u64>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    output: Arc<dyn OutputSink>,
    grace_period: Duration,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: TaskId,
        repository: RepositoryRef,
        kind: TaskKind,
        issue_number: Option<u64>,
        deadline: Instant,
        cancel: CancellationToken,
        output: Arc<dyn OutputSink>,
        grace_period: Duration,
    ) -> Self {
        Self {
            task_id,
            repository,
            kind,
            issue_number,
            deadline,
            cancel,
            output,
            grace_period,
        }
    }

    /// Emit one raw output line.
    pub fn emit(&self, line: impl Into<String>) {
        self.output.emit(line.into());
    }

    /// Emit a `[remedy] ...` progress line.
    pub fn progress(&self, message: impl Display) {
        self.output.emit(format!("[remedy] {message}"));
    }

    pub fn output(&self) -> Arc<dyn OutputSink> {
        Arc::clone(&self.output)
    }

    /// Time left before the task deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// I/O and limits for a supervised tool run, bounded by the task deadline.
    pub fn directive_io(&self) -> DirectiveIo {
        DirectiveIo {
            output: self.output(),
            cancel: self.cancel.clone(),
            limits: SupervisorConfig {
                timeout: self.remaining(),
                grace_period: self.grace_period,
            },
        }
    }

    /// Await a capability call under the task's cancel signal and deadline.
    ///
    /// Cancel maps to `Cancelled`, the deadline to `TimedOut`, and a
    /// capability error to `Failed(Capability)`. Losing the race drops `fut`.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, TaskOutcome>
    where
        F: Future<Output = Result<T, CapabilityError>> + Send,
    {
        self.guard_with(FailureKind::Capability, fut).await
    }

    /// Like [`ExecutionContext::guard`], recording errors as `kind`.
    pub async fn guard_with<T, E, F>(&self, kind: FailureKind, fut: F) -> Result<T, TaskOutcome>
    where
        E: Display,
        F: Future<Output = Result<T, E>> + Send,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TaskOutcome::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => Err(TaskOutcome::TimedOut),
            result = fut => result.map_err(|e| TaskOutcome::failed(kind, e.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn context(deadline: Instant) -> (ExecutionContext, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let ctx = ExecutionContext::new(
            TaskId::new(),
            RepositoryRef::parse("o/r").unwrap(),
            TaskKind::CloneAndReview,
            None,
            deadline,
            CancellationToken::new(),
            Arc::new(tx),
            Duration::from_millis(100),
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn guard_passes_result_through() {
        let (ctx, _rx) = context(Instant::now() + Duration::from_secs(5));
        let value = ctx.guard(async { Ok::<_, CapabilityError>(7) }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn guard_maps_capability_error() {
        let (ctx, _rx) = context(Instant::now() + Duration::from_secs(5));
        let err = ctx
            .guard(async { Err::<(), _>(CapabilityError::NotFound("repo".into())) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskOutcome::Failed(ref d) if d.kind == FailureKind::Capability && d.message.contains("repo")
        ));
    }

    #[tokio::test]
    async fn guard_observes_cancel() {
        let (ctx, _rx) = context(Instant::now() + Duration::from_secs(5));
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, CapabilityError>(())
            })
            .await;
        assert_eq!(result, Err(TaskOutcome::Cancelled));
    }

    #[tokio::test]
    async fn guard_observes_deadline() {
        let (ctx, _rx) = context(Instant::now() + Duration::from_millis(20));
        let result = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, CapabilityError>(())
            })
            .await;
        assert_eq!(result, Err(TaskOutcome::TimedOut));
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn progress_lines_are_tagged() {
        let (ctx, mut rx) = context(Instant::now() + Duration::from_secs(5));
        ctx.progress("Cloning o/r");
        ctx.emit("raw");
        assert_eq!(rx.recv().await.unwrap(), "[remedy] Cloning o/r");
        assert_eq!(rx.recv().await.unwrap(), "raw");
    }
}
