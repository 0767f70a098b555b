//! Supervision of external tool processes.
//!
//! [`ProcessSupervisor`] owns one external invocation end to end: it spawns
//! the process in its own process group, streams output line by line while
//! the process runs, enforces a timeout and tears the process down on
//! cancellation (SIGTERM, then SIGKILL after a grace period).

mod supervisor;
mod types;

pub use supervisor::{ProcessSupervisor, SupervisorHandle};
pub use types::{
    CommandSpec, ExitDetail, LaunchError, OutputSink, SupervisorConfig, SupervisorOutcome,
    TRANSCRIPT_TAIL_LINES,
};
