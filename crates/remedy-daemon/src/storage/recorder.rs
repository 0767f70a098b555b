//! Mirrors scheduler status transitions into `task_records`.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::db::Database;
use crate::sink::SinkEvent;
use crate::task::TaskSnapshot;

/// Consumes the receiving end of a [`ChannelSink`](crate::sink::ChannelSink)
/// and upserts a task's record from every snapshot the scheduler publishes.
///
/// Snapshots travel with the events, so records are complete even when the
/// scheduler is gone before the channel has been drained. The recorder stops
/// once every sender has been dropped.
pub struct TaskRecorder {
    db: Database,
}

impl TaskRecorder {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn spawn(self, events: mpsc::UnboundedReceiver<SinkEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    pub async fn run(self, mut events: mpsc::UnboundedReceiver<SinkEvent>) {
        while let Some(event) = events.recv().await {
            if let SinkEvent::Snapshot { snapshot } = event {
                self.record(&snapshot).await;
            }
        }
        debug!("Task recorder stopped");
    }

    async fn record(&self, snapshot: &TaskSnapshot) {
        if let Err(e) = self.db.upsert_task_record(snapshot).await {
            warn!(task_id = %snapshot.id, state = %snapshot.state, error = %e, "Failed to record task state");
        }
    }
}
