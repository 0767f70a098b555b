//! Event sinks: where the orchestration core publishes status and output.
//!
//! The scheduler calls [`EventSink::emit`] while holding its critical
//! section so that per-task ordering is preserved; implementations must
//! therefore never block or await.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::task::{TaskEvent, TaskSnapshot};

/// Event published by the core (task events) or relayed through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkEvent {
    Task(TaskEvent),
    /// A task's full state right after one of its status changes.
    Snapshot { snapshot: Box<TaskSnapshot> },
    /// An issue seen while listing a repository's issues.
    IssueDiscovered {
        repository_id: String,
        issue_number: u64,
    },
}

/// Receiver of core events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SinkEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SinkEvent) {}
}

/// Writes events as structured tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SinkEvent) {
        match event {
            SinkEvent::Task(TaskEvent::StatusChanged {
                task_id,
                old_state,
                new_state,
                ..
            }) => {
                info!(
                    %task_id,
                    from = old_state.map_or("none", |s| s.as_str()),
                    to = %new_state,
                    "Task status changed"
                );
            }
            SinkEvent::Snapshot { snapshot } => {
                trace!(task_id = %snapshot.id, state = %snapshot.state, "Task snapshot");
            }
            SinkEvent::Task(TaskEvent::OutputChunk {
                task_id,
                sequence_number,
                text,
                ..
            }) => {
                debug!(%task_id, seq = sequence_number, "{text}");
            }
            SinkEvent::IssueDiscovered {
                repository_id,
                issue_number,
            } => {
                debug!(%repository_id, issue_number, "Issue discovered");
            }
        }
    }
}

/// Forwards events into an unbounded channel for an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SinkEvent) {
        // Consumer gone: nothing left to deliver to.
        let _ = self.tx.send(event);
    }
}

/// Delivers each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: SinkEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
