//! Task lifecycle state machine.
//!
//! ```text
//! Queued ──► Running ──► Succeeded | Failed | TimedOut
//!   │           │
//!   │           └──► Cancelling ──► Cancelled
//!   └──────────────────────────────► Cancelled
//! ```
//!
//! Transitions are monotonic: no state is ever revisited and terminal states
//! have no outgoing edges.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Cancelling,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub const ALL: [Self; 7] = [
        Self::Queued,
        Self::Running,
        Self::Cancelling,
        Self::Succeeded,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running | Self::Cancelled)
                | (
                    Self::Running,
                    Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelling
                )
                | (Self::Cancelling, Self::Cancelled)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the persisted form produced by [`TaskState::as_str`].
    pub fn from_str_value(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attempted transition is not an edge of the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use TaskState::{Cancelled, Cancelling, Failed, Queued, Running, Succeeded, TimedOut};

        let allowed = [
            (Queued, Running),
            (Queued, Cancelled),
            (Running, Succeeded),
            (Running, Failed),
            (Running, TimedOut),
            (Running, Cancelling),
            (Cancelling, Cancelled),
        ];

        for from in TaskState::ALL {
            for to in TaskState::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {}",
                    if expected { "allowed" } else { "rejected" }
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in TaskState::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(TaskState::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn no_cycles() {
        // Every edge moves strictly forward in declaration order.
        let rank = |s: TaskState| TaskState::ALL.iter().position(|x| *x == s);
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                if from.can_transition_to(to) {
                    assert!(rank(to) > rank(from), "{from} -> {to} goes backwards");
                }
            }
        }
    }

    #[test]
    fn persisted_form_round_trips() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::from_str_value(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::from_str_value("paused"), None);
    }
}
