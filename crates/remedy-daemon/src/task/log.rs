//! Append-only per-task event history with live fan-out.
//!
//! Every status transition and output chunk of a task is appended here. A
//! subscriber first takes the recorded history and a broadcast receiver in
//! one step (see [`EventLog::attach`]), replays the history, then follows
//! live events. Events carry their history index, so a subscriber that lags
//! behind the broadcast buffer re-reads the missed range from history instead
//! of losing it.

use std::pin::Pin;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::Stream;

use super::types::{TaskEvent, TaskId};

/// Boxed stream of a single task's events, ending after the terminal status.
pub type TaskEventStream = Pin<Box<dyn Stream<Item = TaskEvent> + Send>>;

/// The log no longer accepts events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event log for task {0} is closed")]
pub struct LogClosed(pub TaskId);

#[derive(Debug)]
pub struct EventLog {
    task_id: TaskId,
    history: Vec<TaskEvent>,
    live: broadcast::Sender<TaskEvent>,
    closed: bool,
}

impl EventLog {
    pub fn new(task_id: TaskId, capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            task_id,
            history: Vec::new(),
            live,
            closed: false,
        }
    }

    /// Index the next appended event must carry.
    pub fn next_index(&self) -> usize {
        self.history.len()
    }

    /// Append an event and broadcast it to attached subscribers.
    pub fn append(&mut self, event: TaskEvent) -> Result<(), LogClosed> {
        if self.closed {
            return Err(LogClosed(self.task_id));
        }
        debug_assert_eq!(event.index(), self.history.len());
        self.history.push(event.clone());
        // No receivers is fine; history still has the event.
        let _ = self.live.send(event);
        Ok(())
    }

    /// Stop accepting events. History stays readable.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self) -> &[TaskEvent] {
        &self.history
    }

    /// Events from index `from` onward.
    pub fn since(&self, from: usize) -> Vec<TaskEvent> {
        self.history.get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Snapshot the history and subscribe to live events in one step.
    ///
    /// Must be called under the same lock that serialises [`EventLog::append`],
    /// otherwise an event could fall between the snapshot and the receiver.
    pub fn attach(&self) -> (Vec<TaskEvent>, broadcast::Receiver<TaskEvent>) {
        (self.history.clone(), self.live.subscribe())
    }
}

/// Turn an attached backlog and receiver into a finite event stream.
///
/// `reread(from)` returns the recorded history from index `from`; it is used
/// to recover after the receiver lagged or the sender went away. The stream
/// yields every index exactly once, in order, and ends after the terminal
/// status event (or when history can no longer be read).
pub fn follow<F>(
    backlog: Vec<TaskEvent>,
    mut live: broadcast::Receiver<TaskEvent>,
    reread: F,
) -> TaskEventStream
where
    F: Fn(usize) -> Vec<TaskEvent> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut cursor = 0usize;
        let mut finished = false;

        for event in backlog {
            if event.index() < cursor {
                continue;
            }
            cursor = event.index() + 1;
            finished = event.is_terminal();
            yield event;
            if finished {
                break;
            }
        }

        while !finished {
            let batch = match live.recv().await {
                Ok(event) if event.index() == cursor => vec![event],
                Ok(event) if event.index() < cursor => continue,
                Ok(_) | Err(RecvError::Lagged(_)) => reread(cursor),
                Err(RecvError::Closed) => {
                    let rest = reread(cursor);
                    if rest.is_empty() {
                        break;
                    }
                    rest
                }
            };

            for event in batch {
                if event.index() < cursor {
                    continue;
                }
                cursor = event.index() + 1;
                finished = event.is_terminal();
                yield event;
                if finished {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use tokio_stream::StreamExt;

    fn status(id: TaskId, index: usize, old: Option<TaskState>, new: TaskState) -> TaskEvent {
        TaskEvent::StatusChanged {
            task_id: id,
            index,
            old_state: old,
            new_state: new,
            timestamp: Utc::now(),
        }
    }

    fn output(id: TaskId, index: usize, seq: u64) -> TaskEvent {
        TaskEvent::OutputChunk {
            task_id: id,
            index,
            sequence_number: seq,
            text: format!("line {seq}"),
            timestamp: Utc::now(),
        }
    }

    fn shared_log(capacity: usize) -> (TaskId, Arc<Mutex<EventLog>>) {
        let id = TaskId::new();
        (id, Arc::new(Mutex::new(EventLog::new(id, capacity))))
    }

    fn subscribe(log: &Arc<Mutex<EventLog>>) -> TaskEventStream {
        let (backlog, rx) = log.lock().unwrap().attach();
        let reader = Arc::clone(log);
        follow(backlog, rx, move |from| reader.lock().unwrap().since(from))
    }

    #[test]
    fn closed_log_rejects_appends() {
        let (id, log) = shared_log(8);
        let mut log = log.lock().unwrap();
        log.append(status(id, 0, None, TaskState::Queued)).unwrap();
        log.close();
        assert_eq!(
            log.append(status(id, 1, Some(TaskState::Queued), TaskState::Cancelled)),
            Err(LogClosed(id))
        );
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn replays_completed_history() {
        let (id, log) = shared_log(8);
        {
            let mut log = log.lock().unwrap();
            log.append(status(id, 0, None, TaskState::Queued)).unwrap();
            log.append(status(id, 1, Some(TaskState::Queued), TaskState::Running))
                .unwrap();
            log.append(output(id, 2, 0)).unwrap();
            log.append(status(id, 3, Some(TaskState::Running), TaskState::Succeeded))
                .unwrap();
            log.close();
        }

        let events: Vec<_> = subscribe(&log).collect().await;
        assert_eq!(events, log.lock().unwrap().history().to_vec());
    }

    #[tokio::test]
    async fn follows_live_events_until_terminal() {
        let (id, log) = shared_log(8);
        log.lock()
            .unwrap()
            .append(status(id, 0, None, TaskState::Queued))
            .unwrap();

        let stream = subscribe(&log);
        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            for (i, event) in [
                status(id, 1, Some(TaskState::Queued), TaskState::Running),
                output(id, 2, 0),
                output(id, 3, 1),
                status(id, 4, Some(TaskState::Running), TaskState::Failed),
            ]
            .into_iter()
            .enumerate()
            {
                tokio::time::sleep(std::time::Duration::from_millis(5 * i as u64)).await;
                writer.lock().unwrap().append(event).unwrap();
            }
        });

        let events: Vec<_> = stream.collect().await;
        let indices: Vec<_> = events.iter().map(TaskEvent::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers_from_history() {
        let (id, log) = shared_log(1);
        log.lock()
            .unwrap()
            .append(status(id, 0, None, TaskState::Queued))
            .unwrap();
        let stream = subscribe(&log);

        {
            let mut log = log.lock().unwrap();
            log.append(status(id, 1, Some(TaskState::Queued), TaskState::Running))
                .unwrap();
            for i in 0..20 {
                log.append(output(id, 2 + i, i as u64)).unwrap();
            }
            log.append(status(id, 22, Some(TaskState::Running), TaskState::TimedOut))
                .unwrap();
            log.close();
        }

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 23);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.index(), i);
        }
    }

    #[tokio::test]
    async fn stream_ends_when_log_is_dropped() {
        let id = TaskId::new();
        let mut log = EventLog::new(id, 4);
        log.append(status(id, 0, None, TaskState::Queued)).unwrap();
        let (backlog, rx) = log.attach();
        drop(log);

        let events: Vec<_> = follow(backlog, rx, |_| Vec::new()).collect().await;
        assert_eq!(events.len(), 1);
    }
}
